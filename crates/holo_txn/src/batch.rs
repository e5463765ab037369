//! Contiguous groups of committed transactions published together.
//!
//! A multi-transaction batch always targets a single table, and for every
//! partition of that table the members' versions must form an ascending run
//! without gaps. One publish request per partition then covers
//! `[start_version, end_version]`.

use std::collections::BTreeMap;

use crate::error::{TxnError, TxnResult};
use crate::txn::{TransactionState, TxnInfo};
use crate::{DbId, PartitionId, TableId, TxnId, Version};

/// Per-partition view of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionPublishVersionData {
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub txn_ids: Vec<TxnId>,
    pub versions: Vec<Version>,
    pub txn_infos: Vec<TxnInfo>,
}

impl PartitionPublishVersionData {
    pub fn start_version(&self) -> Version {
        self.versions.first().copied().unwrap_or(0)
    }

    pub fn end_version(&self) -> Version {
        self.versions.last().copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct TransactionStateBatch {
    db_id: DbId,
    table_id: TableId,
    txns: Vec<TransactionState>,
}

impl TransactionStateBatch {
    /// Validate and build a batch from transactions in commit order.
    pub fn new(db_id: DbId, table_id: TableId, txns: Vec<TransactionState>) -> TxnResult<Self> {
        if txns.is_empty() {
            return Err(TxnError::InvalidBatch("empty batch".to_string()));
        }
        if txns.len() > 1 {
            for txn in &txns {
                if txn.table_ids.as_slice() != [table_id] {
                    return Err(TxnError::InvalidBatch(format!(
                        "txn {} writes tables {:?}, batch table is {table_id}",
                        txn.txn_id, txn.table_ids
                    )));
                }
            }
        }

        let mut last: BTreeMap<PartitionId, Version> = BTreeMap::new();
        for txn in &txns {
            let Some(table) = txn.table_commit_infos.get(&table_id) else {
                continue;
            };
            for (partition_id, info) in &table.partitions {
                if let Some(prev) = last.get(partition_id) {
                    if info.version != prev + 1 {
                        return Err(TxnError::BatchNotContiguous {
                            partition_id: *partition_id,
                            prev: *prev,
                            next: info.version,
                        });
                    }
                }
                last.insert(*partition_id, info.version);
            }
        }

        Ok(Self {
            db_id,
            table_id,
            txns,
        })
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Tables the batch touches. Only a singleton may touch several.
    pub fn table_ids(&self) -> Vec<TableId> {
        match self.txns.as_slice() {
            [single] => single.table_ids.clone(),
            _ => vec![self.table_id],
        }
    }

    pub fn txns(&self) -> &[TransactionState] {
        &self.txns
    }

    pub fn txn_ids(&self) -> Vec<TxnId> {
        self.txns.iter().map(|t| t.txn_id).collect()
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.txns.len() == 1
    }

    /// Versions and transaction infos grouped by partition of the batch table.
    pub fn partition_publish_data(&self) -> BTreeMap<PartitionId, PartitionPublishVersionData> {
        let mut out: BTreeMap<PartitionId, PartitionPublishVersionData> = BTreeMap::new();
        for txn in &self.txns {
            let Some(table) = txn.table_commit_infos.get(&self.table_id) else {
                continue;
            };
            for (partition_id, info) in &table.partitions {
                let data = out
                    .entry(*partition_id)
                    .or_insert_with(|| PartitionPublishVersionData {
                        table_id: self.table_id,
                        partition_id: *partition_id,
                        txn_ids: Vec::new(),
                        versions: Vec::new(),
                        txn_infos: Vec::new(),
                    });
                data.txn_ids.push(txn.txn_id);
                data.versions.push(info.version);
                data.txn_infos.push(txn.txn_info());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{
        LoadJobSourceType, PartitionCommitInfo, TableCommitInfo, TxnCoordinator, TxnStatus,
    };

    fn committed(txn_id: TxnId, table_id: TableId, versions: &[(PartitionId, Version)]) -> TransactionState {
        let mut txn = TransactionState::new(
            1,
            vec![table_id],
            txn_id,
            format!("l{txn_id}"),
            TxnCoordinator::fe("127.0.0.1"),
            LoadJobSourceType::Frontend,
            1_000,
            0,
        );
        txn.status = TxnStatus::Committed;
        let mut info = TableCommitInfo::new(table_id);
        for (partition_id, version) in versions {
            info.partitions
                .insert(*partition_id, PartitionCommitInfo::new(*partition_id, *version));
        }
        txn.table_commit_infos.insert(table_id, info);
        txn
    }

    #[test]
    fn contiguous_versions_form_a_batch() {
        let batch = TransactionStateBatch::new(
            1,
            10,
            vec![
                committed(1, 10, &[(100, 5), (101, 2)]),
                committed(2, 10, &[(100, 6)]),
                committed(3, 10, &[(100, 7), (101, 3)]),
            ],
        )
        .expect("contiguous");
        let data = batch.partition_publish_data();
        assert_eq!(data[&100].versions, vec![5, 6, 7]);
        assert_eq!(data[&100].start_version(), 5);
        assert_eq!(data[&100].end_version(), 7);
        assert_eq!(data[&101].txn_ids, vec![1, 3]);
        assert_eq!(batch.txn_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn gaps_and_reversals_are_rejected() {
        let gap = TransactionStateBatch::new(
            1,
            10,
            vec![committed(1, 10, &[(100, 5)]), committed(2, 10, &[(100, 7)])],
        );
        match gap {
            Err(TxnError::BatchNotContiguous {
                partition_id,
                prev,
                next,
            }) => {
                assert_eq!((partition_id, prev, next), (100, 5, 7));
            }
            other => panic!("unexpected batch result: {other:?}"),
        }

        let reversed = TransactionStateBatch::new(
            1,
            10,
            vec![committed(2, 10, &[(100, 6)]), committed(1, 10, &[(100, 5)])],
        );
        assert!(matches!(reversed, Err(TxnError::BatchNotContiguous { .. })));
    }

    #[test]
    fn multi_table_transactions_only_batch_alone() {
        let mut wide = committed(1, 10, &[(100, 5)]);
        wide.table_ids.push(11);
        let single = TransactionStateBatch::new(1, 10, vec![wide.clone()]).expect("singleton");
        assert_eq!(single.table_ids(), vec![10, 11]);

        let mixed = TransactionStateBatch::new(1, 10, vec![wide, committed(2, 10, &[(100, 6)])]);
        assert!(matches!(mixed, Err(TxnError::InvalidBatch(_))));
        assert!(TransactionStateBatch::new(1, 10, Vec::new()).is_err());
    }
}

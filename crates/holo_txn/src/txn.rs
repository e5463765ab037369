//! The transaction record.
//!
//! A `TransactionState` is created at begin, gains a commit graph
//! (table → partition → assigned version) at commit and is frozen once it
//! reaches a final status. Everything except the per-tablet confirmations in
//! the ledger and the last error message is persisted through the journal.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::ReplicaVersionLedger;
use crate::{DbId, PartitionId, TableId, TabletId, TxnId, Version, WorkerId};

/// Minimum wait before a failed partition publish is attempted again.
pub const PUBLISH_RETRY_INTERVAL_MS: i64 = 1000;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxnStatus {
    Prepare,
    Prepared,
    Committed,
    Visible,
    Aborted,
}

impl TxnStatus {
    pub fn is_final(self) -> bool {
        matches!(self, TxnStatus::Visible | TxnStatus::Aborted)
    }

    /// Forward transitions only; re-entering a final status is a no-op that
    /// callers check for separately.
    pub fn can_transition_to(self, next: TxnStatus) -> bool {
        use TxnStatus::*;
        matches!(
            (self, next),
            (Prepare, Prepared)
                | (Prepare, Committed)
                | (Prepared, Committed)
                | (Committed, Visible)
                | (Prepare, Aborted)
                | (Prepared, Aborted)
                | (Committed, Aborted)
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadJobSourceType {
    Frontend,
    BackendStreaming,
    InsertStreaming,
    RoutineLoadTask,
    BatchLoadJob,
    Delete,
    LakeCompaction,
    FrontendStreaming,
    MvRefresh,
    Replication,
    BypassWrite,
}

impl LoadJobSourceType {
    pub fn code(self) -> i32 {
        match self {
            LoadJobSourceType::Frontend => 1,
            LoadJobSourceType::BackendStreaming => 2,
            LoadJobSourceType::InsertStreaming => 3,
            LoadJobSourceType::RoutineLoadTask => 4,
            LoadJobSourceType::BatchLoadJob => 5,
            LoadJobSourceType::Delete => 6,
            LoadJobSourceType::LakeCompaction => 7,
            LoadJobSourceType::FrontendStreaming => 8,
            LoadJobSourceType::MvRefresh => 9,
            LoadJobSourceType::Replication => 10,
            LoadJobSourceType::BypassWrite => 11,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let ty = match code {
            1 => LoadJobSourceType::Frontend,
            2 => LoadJobSourceType::BackendStreaming,
            3 => LoadJobSourceType::InsertStreaming,
            4 => LoadJobSourceType::RoutineLoadTask,
            5 => LoadJobSourceType::BatchLoadJob,
            6 => LoadJobSourceType::Delete,
            7 => LoadJobSourceType::LakeCompaction,
            8 => LoadJobSourceType::FrontendStreaming,
            9 => LoadJobSourceType::MvRefresh,
            10 => LoadJobSourceType::Replication,
            11 => LoadJobSourceType::BypassWrite,
            _ => return None,
        };
        Some(ty)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnSourceType {
    Fe,
    Be,
}

/// Who began the transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxnCoordinator {
    pub source_type: TxnSourceType,
    pub ip: String,
    /// Only meaningful while the transaction is running; not persisted.
    #[serde(skip)]
    pub backend_id: Option<WorkerId>,
}

impl TxnCoordinator {
    pub fn fe(ip: impl Into<String>) -> Self {
        Self {
            source_type: TxnSourceType::Fe,
            ip: ip.into(),
            backend_id: None,
        }
    }

    pub fn be(ip: impl Into<String>, backend_id: WorkerId) -> Self {
        Self {
            source_type: TxnSourceType::Be,
            ip: ip.into(),
            backend_id: Some(backend_id),
        }
    }
}

/// Load-specific payload handed to callbacks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TxnCommitAttachment {
    Insert {
        is_version_overwrite: bool,
        loaded_rows: u64,
    },
    Load {
        loaded_rows: u64,
        filtered_rows: u64,
    },
}

/// Compaction score summary reported by lake publish.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Quantiles {
    pub avg: f64,
    pub p50: f64,
    pub max: f64,
}

impl Quantiles {
    pub fn compute(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let mut sorted = scores.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            avg: sum / sorted.len() as f64,
            p50: sorted[sorted.len() / 2],
            max: sorted[sorted.len() - 1],
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PartitionCommitInfo {
    pub partition_id: PartitionId,
    pub version: Version,
    /// Zero until a publish attempt finishes. Positive: success time.
    /// Negative: negated failure time.
    #[serde(default)]
    pub version_time: i64,
    #[serde(default)]
    pub is_double_write: bool,
    #[serde(default)]
    pub compaction_score: Option<Quantiles>,
    /// Per-tablet row counts of a partition's first load.
    #[serde(default)]
    pub first_load_row_counts: BTreeMap<TabletId, u64>,
}

impl PartitionCommitInfo {
    pub fn new(partition_id: PartitionId, version: Version) -> Self {
        Self {
            partition_id,
            version,
            version_time: 0,
            is_double_write: false,
            compaction_score: None,
            first_load_row_counts: BTreeMap::new(),
        }
    }

    pub fn publish_succeeded(&self) -> bool {
        self.version_time > 0
    }

    /// Whether a publish attempt may run at `now_ms`.
    pub fn publish_attempt_due(&self, now_ms: i64) -> bool {
        if self.version_time > 0 {
            return false;
        }
        self.version_time == 0 || now_ms >= self.version_time.abs() + PUBLISH_RETRY_INTERVAL_MS
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TableCommitInfo {
    pub table_id: TableId,
    pub partitions: BTreeMap<PartitionId, PartitionCommitInfo>,
}

impl TableCommitInfo {
    pub fn new(table_id: TableId) -> Self {
        Self {
            table_id,
            partitions: BTreeMap::new(),
        }
    }
}

/// A worker's confirmation that it wrote a tablet.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TabletCommitInfo {
    pub tablet_id: TabletId,
    pub backend_id: WorkerId,
}

impl TabletCommitInfo {
    pub fn new(tablet_id: TabletId, backend_id: WorkerId) -> Self {
        Self {
            tablet_id,
            backend_id,
        }
    }
}

/// Per-transaction information workers need to apply a publish.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnInfo {
    pub txn_id: TxnId,
    pub commit_time: i64,
    pub combined_txn_log: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransactionState {
    pub db_id: DbId,
    pub table_ids: Vec<TableId>,
    pub txn_id: TxnId,
    pub global_txn_id: u64,
    pub label: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub coordinator: TxnCoordinator,
    pub source_type: LoadJobSourceType,
    pub status: TxnStatus,
    #[serde(default)]
    pub reason: String,
    pub prepare_time: i64,
    #[serde(default = "unset_time")]
    pub prepared_time: i64,
    #[serde(default = "unset_time")]
    pub commit_time: i64,
    #[serde(default = "unset_time")]
    pub finish_time: i64,
    pub timeout_ms: i64,
    #[serde(default = "unset_time")]
    pub write_end_time_ms: i64,
    #[serde(default)]
    pub write_duration_ms: i64,
    #[serde(default = "unset_time")]
    pub allow_commit_time_ms: i64,
    /// Order in which the coordinator committed transactions.
    #[serde(default)]
    pub commit_seq: u64,
    #[serde(default)]
    pub table_commit_infos: BTreeMap<TableId, TableCommitInfo>,
    #[serde(default)]
    pub ledger: ReplicaVersionLedger,
    #[serde(default)]
    pub callback_ids: Vec<u64>,
    #[serde(default)]
    pub attachment: Option<TxnCommitAttachment>,
    #[serde(default)]
    pub use_combined_txn_log: bool,
    #[serde(skip)]
    pub error_msg: String,
    #[serde(skip)]
    pub last_err_time_ms: i64,
}

fn unset_time() -> i64 {
    -1
}

impl TransactionState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_id: DbId,
        table_ids: Vec<TableId>,
        txn_id: TxnId,
        label: impl Into<String>,
        coordinator: TxnCoordinator,
        source_type: LoadJobSourceType,
        timeout_ms: i64,
        now_ms: i64,
    ) -> Self {
        Self {
            db_id,
            table_ids,
            txn_id,
            global_txn_id: 0,
            label: label.into(),
            request_id: None,
            coordinator,
            source_type,
            status: TxnStatus::Prepare,
            reason: String::new(),
            prepare_time: now_ms,
            prepared_time: -1,
            commit_time: -1,
            finish_time: -1,
            timeout_ms,
            write_end_time_ms: -1,
            write_duration_ms: 0,
            allow_commit_time_ms: -1,
            commit_seq: 0,
            table_commit_infos: BTreeMap::new(),
            ledger: ReplicaVersionLedger::default(),
            callback_ids: Vec::new(),
            attachment: None,
            use_combined_txn_log: false,
            error_msg: String::new(),
            last_err_time_ms: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, TxnStatus::Prepare | TxnStatus::Prepared)
    }

    /// A running transaction that has outlived its own timeout or, once
    /// prepared, the prepared-state timeout.
    pub fn is_timeout(&self, now_ms: i64, prepared_timeout_ms: i64) -> bool {
        match self.status {
            TxnStatus::Prepare => now_ms - self.prepare_time > self.timeout_ms,
            TxnStatus::Prepared => now_ms - self.prepared_time > prepared_timeout_ms,
            _ => false,
        }
    }

    /// A final transaction whose label no longer needs to be remembered.
    pub fn is_expired(&self, now_ms: i64, label_keep_ms: i64) -> bool {
        self.status.is_final() && self.finish_time >= 0 && now_ms - self.finish_time > label_keep_ms
    }

    pub fn partition_commit_info(
        &self,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Option<&PartitionCommitInfo> {
        self.table_commit_infos
            .get(&table_id)?
            .partitions
            .get(&partition_id)
    }

    pub fn partition_commit_info_mut(
        &mut self,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Option<&mut PartitionCommitInfo> {
        self.table_commit_infos
            .get_mut(&table_id)?
            .partitions
            .get_mut(&partition_id)
    }

    /// Every (table, partition commit info) pair in commit order.
    pub fn partition_commit_infos(
        &self,
    ) -> impl Iterator<Item = (TableId, &PartitionCommitInfo)> + '_ {
        self.table_commit_infos
            .values()
            .flat_map(|t| t.partitions.values().map(move |p| (t.table_id, p)))
    }

    /// Forget a table dropped while the transaction was in flight.
    pub fn remove_table(&mut self, table_id: TableId) {
        self.table_commit_infos.remove(&table_id);
        self.table_ids.retain(|id| *id != table_id);
    }

    pub fn set_error_msg(&mut self, msg: impl Into<String>, now_ms: i64) {
        self.error_msg = msg.into();
        self.last_err_time_ms = now_ms;
    }

    pub fn txn_info(&self) -> TxnInfo {
        TxnInfo {
            txn_id: self.txn_id,
            commit_time: self.commit_time,
            combined_txn_log: self.use_combined_txn_log,
        }
    }

    pub fn brief(&self) -> String {
        format!(
            "txn_id={} label={} db_id={} status={:?}",
            self.txn_id, self.label, self.db_id, self.status
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransactionState. txn_id: {}, label: {}, db id: {}, table id list: {:?}, \
             coordinator: {:?}, status: {:?}, source type: {:?}, commit time: {}, \
             finish time: {}, reason: {}",
            self.txn_id,
            self.label,
            self.db_id,
            self.table_ids,
            self.coordinator.source_type,
            self.status,
            self.source_type,
            self.commit_time,
            self.finish_time,
            self.reason
        )?;
        let errors = self.ledger.error_replicas();
        if !errors.is_empty() {
            let ids: Vec<_> = errors.iter().take(5).collect();
            write!(f, ", error replica ids: {ids:?}")?;
        }
        let unknown = self.ledger.unknown_replicas();
        if !unknown.is_empty() {
            let ids: Vec<_> = unknown.iter().take(5).collect();
            write!(f, ", unknown replica ids: {ids:?}")?;
        }
        Ok(())
    }
}

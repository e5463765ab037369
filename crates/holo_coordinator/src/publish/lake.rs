//! Lake (shared-data) publish.
//!
//! Tablets live on shared storage, so a partition is published by asking one
//! worker per tablet group to apply the txn logs. Outcomes are recorded per
//! partition in `version_time` and a failed partition waits out the retry
//! interval before the next attempt.
//!
//! In-flight work is fenced by two guard sets: individual publish claims
//! txn ids, batch publish claims table ids. Each mode skips work the other
//! one holds.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use holo_txn::catalog::{IndexState, PARTITION_INIT_VERSION};
use holo_txn::txn::{LoadJobSourceType, PartitionCommitInfo, Quantiles, TxnInfo};
use holo_txn::{
    unix_time_ms, DbId, PartitionId, PartitionPublishVersionData, TableId, TabletId,
    TransactionState, TransactionStateBatch, TxnId, Version, WorkerId,
};

use super::executor::BoundedExecutor;
use super::PublishScheduler;
use crate::config::{PublishConfig, DEFAULT_LAKE_PUBLISH_THREADS, DEFAULT_TXNLOG_CLEANUP_THREADS};
use crate::worker::{
    DeleteTxnLogRequest, PublishLogVersionRequest, PublishVersionRequest, WorkerRpcError,
};

pub(super) struct LakePublishState {
    txn_guard: Mutex<HashSet<TxnId>>,
    table_guard: Mutex<HashSet<TableId>>,
    pub(super) executor: BoundedExecutor,
    pub(super) cleanup_executor: BoundedExecutor,
}

impl LakePublishState {
    pub(super) fn new(cfg: &PublishConfig) -> Self {
        Self {
            txn_guard: Mutex::new(HashSet::new()),
            table_guard: Mutex::new(HashSet::new()),
            executor: BoundedExecutor::new(
                "lake-publish",
                cfg.lake_publish_threads,
                DEFAULT_LAKE_PUBLISH_THREADS,
            ),
            cleanup_executor: BoundedExecutor::new(
                "lake-txnlog-cleanup",
                cfg.lake_txnlog_cleanup_threads,
                DEFAULT_TXNLOG_CLEANUP_THREADS,
            ),
        }
    }

    fn txn_in_flight(&self, txn_id: TxnId) -> bool {
        self.txn_guard.lock().expect("txn guard lock").contains(&txn_id)
    }

    fn try_claim_txn(&self, txn_id: TxnId) -> bool {
        self.txn_guard.lock().expect("txn guard lock").insert(txn_id)
    }

    fn release_txn(&self, txn_id: TxnId) {
        self.txn_guard.lock().expect("txn guard lock").remove(&txn_id);
    }

    fn any_table_in_flight(&self, table_ids: &[TableId]) -> bool {
        let guard = self.table_guard.lock().expect("table guard lock");
        table_ids.iter().any(|id| guard.contains(id))
    }

    /// Claim every table or none of them.
    fn try_claim_tables(&self, table_ids: &[TableId]) -> bool {
        let mut guard = self.table_guard.lock().expect("table guard lock");
        if table_ids.iter().any(|id| guard.contains(id)) {
            return false;
        }
        guard.extend(table_ids.iter().copied());
        true
    }

    fn release_tables(&self, table_ids: &[TableId]) {
        let mut guard = self.table_guard.lock().expect("table guard lock");
        for id in table_ids {
            guard.remove(id);
        }
    }
}

enum PartitionOutcome {
    Published {
        compaction_score: Option<Quantiles>,
        first_load_rows: BTreeMap<TabletId, u64>,
    },
    TableDropped,
    PartitionDropped,
    Failed(String),
}

/// Tablets of one partition as seen under the db lock.
struct PartitionLayout {
    visible_version: Version,
    normal: BTreeMap<WorkerId, Vec<TabletId>>,
    /// One entry per shadow index.
    shadow: Vec<ShadowIndex>,
}

struct ShadowIndex {
    visible_txn_id: TxnId,
    tablets: BTreeMap<WorkerId, Vec<TabletId>>,
}

enum Layout {
    TableDropped,
    PartitionDropped,
    Ready(PartitionLayout),
}

/// Txn logs to delete once a batch is visible.
struct CleanupTarget {
    partition_id: PartitionId,
    worker_tablets: BTreeMap<WorkerId, Vec<TabletId>>,
    txn_infos: Vec<TxnInfo>,
}

impl PublishScheduler {
    pub(super) fn publish_lake_individually(self: &Arc<Self>, ready: Vec<TransactionState>) {
        for txn in ready {
            if self.lake.any_table_in_flight(&txn.table_ids) {
                continue;
            }
            if !self.lake.try_claim_txn(txn.txn_id) {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                let txn_id = txn.txn_id;
                this.publish_lake_txn(txn).await;
                this.lake.release_txn(txn_id);
                this.wake();
            });
        }
    }

    pub(super) fn publish_lake_batches(self: &Arc<Self>, batches: Vec<TransactionStateBatch>) {
        for batch in batches {
            if batch.txns().iter().any(|t| self.lake.txn_in_flight(t.txn_id)) {
                continue;
            }
            let table_ids = batch.table_ids();
            if !self.lake.try_claim_tables(&table_ids) {
                continue;
            }
            let this = self.clone();
            tokio::spawn(async move {
                if batch.is_single() {
                    if let Some(txn) = batch.txns().first().cloned() {
                        this.publish_lake_txn(txn).await;
                    }
                } else {
                    this.publish_lake_batch(&batch).await;
                }
                this.lake.release_tables(&table_ids);
                this.wake();
            });
        }
    }

    /// Publish every due partition of one transaction and finish it once
    /// all partitions succeeded.
    async fn publish_lake_txn(self: &Arc<Self>, txn: TransactionState) {
        let db_id = txn.db_id;
        let txn_id = txn.txn_id;
        let none = BTreeSet::new();
        if self.state_machine.catalog().get_db(db_id).is_none() {
            tracing::info!(txn_id, db_id, "database dropped, finishing lake transaction");
            if let Err(err) = self.state_machine.finish_transaction(db_id, txn_id, &none, &none) {
                tracing::warn!(txn_id, db_id, error = %err, "finish lake transaction failed");
            }
            return;
        }

        let now = unix_time_ms();
        let mut all_done = true;
        let mut pending: Vec<(TableId, PartitionCommitInfo)> = Vec::new();
        for (table_id, info) in txn.partition_commit_infos() {
            if info.publish_succeeded() {
                continue;
            }
            if !info.publish_attempt_due(now) {
                all_done = false;
                continue;
            }
            pending.push((table_id, info.clone()));
        }

        let outcomes = join_all(
            pending
                .iter()
                .map(|(table_id, info)| self.publish_partition(&txn, *table_id, info)),
        )
        .await;

        for ((table_id, info), outcome) in pending.iter().zip(outcomes) {
            let partition_id = info.partition_id;
            let done_at = unix_time_ms();
            let recorded = match outcome {
                PartitionOutcome::Published {
                    compaction_score,
                    first_load_rows,
                } => self
                    .state_machine
                    .set_partition_publish_stats(
                        db_id,
                        txn_id,
                        *table_id,
                        partition_id,
                        compaction_score,
                        first_load_rows,
                    )
                    .and_then(|()| {
                        self.state_machine.set_partition_version_time(
                            db_id,
                            txn_id,
                            *table_id,
                            partition_id,
                            done_at,
                        )
                    }),
                PartitionOutcome::TableDropped => {
                    tracing::info!(txn_id, table_id, "table dropped, skipping publish");
                    self.state_machine.remove_table(db_id, txn_id, *table_id)
                }
                PartitionOutcome::PartitionDropped => {
                    tracing::info!(txn_id, table_id, partition_id, "partition dropped, skipping publish");
                    self.state_machine.set_partition_version_time(
                        db_id,
                        txn_id,
                        *table_id,
                        partition_id,
                        done_at,
                    )
                }
                PartitionOutcome::Failed(message) => {
                    all_done = false;
                    if self.should_warn(&format!("lake-{txn_id}-{partition_id}")) {
                        tracing::warn!(
                            txn_id,
                            table_id,
                            partition_id,
                            version = info.version,
                            error = %message,
                            "publish partition failed"
                        );
                    }
                    self.state_machine
                        .set_partition_version_time(db_id, txn_id, *table_id, partition_id, -done_at)
                        .and_then(|()| self.state_machine.set_error_msg(db_id, txn_id, message))
                }
            };
            if let Err(err) = recorded {
                tracing::debug!(txn_id, partition_id, error = %err, "record publish outcome failed");
            }
        }

        if !all_done {
            return;
        }
        if let Err(err) = self.state_machine.finish_transaction(db_id, txn_id, &none, &none) {
            if self.should_warn(&format!("lake-finish-{txn_id}")) {
                tracing::warn!(txn_id, db_id, error = %err, "finish lake transaction failed");
            }
        }
    }

    async fn publish_partition(
        &self,
        txn: &TransactionState,
        table_id: TableId,
        info: &PartitionCommitInfo,
    ) -> PartitionOutcome {
        let layout = match self.partition_layout(txn.db_id, table_id, info.partition_id) {
            Layout::TableDropped => return PartitionOutcome::TableDropped,
            Layout::PartitionDropped => return PartitionOutcome::PartitionDropped,
            Layout::Ready(layout) => layout,
        };
        if txn.source_type != LoadJobSourceType::Replication
            && layout.visible_version + 1 != info.version
        {
            return PartitionOutcome::Failed(format!(
                "visible version {} does not precede publish version {}",
                layout.visible_version, info.version
            ));
        }
        let txn_info = txn.txn_info();

        let shadow_calls: Vec<_> = layout
            .shadow
            .iter()
            .filter(|index| txn.txn_id >= index.visible_txn_id)
            .flat_map(|index| index.tablets.iter())
            .map(|(worker_id, tablets)| {
                let client = self.client.clone();
                let worker_id = *worker_id;
                let req = PublishLogVersionRequest {
                    tablet_ids: tablets.clone(),
                    txn_infos: vec![txn_info],
                    versions: vec![info.version],
                };
                async move { client.publish_log_version(worker_id, req).await }
            })
            .collect();
        if let Err(message) = self.run_rpcs(shadow_calls).await {
            return PartitionOutcome::Failed(message);
        }

        let calls: Vec<_> = layout
            .normal
            .iter()
            .map(|(worker_id, tablets)| {
                let client = self.client.clone();
                let worker_id = *worker_id;
                let req = PublishVersionRequest {
                    tablet_ids: tablets.clone(),
                    txn_infos: vec![txn_info],
                    base_version: layout.visible_version,
                    new_version: info.version,
                };
                async move { client.publish_version(worker_id, req).await }
            })
            .collect();
        let responses = match self.run_rpcs(calls).await {
            Ok(responses) => responses,
            Err(message) => return PartitionOutcome::Failed(message),
        };

        let mut scores = Vec::new();
        let mut first_load_rows = BTreeMap::new();
        for resp in responses {
            if !resp.failed_tablets.is_empty() {
                return PartitionOutcome::Failed(format!(
                    "tablets {:?} failed to publish",
                    resp.failed_tablets
                ));
            }
            scores.extend(resp.compaction_scores.values().copied());
            if layout.visible_version == PARTITION_INIT_VERSION {
                first_load_rows.extend(resp.tablet_row_nums);
            }
        }
        PartitionOutcome::Published {
            compaction_score: Quantiles::compute(&scores),
            first_load_rows,
        }
    }

    fn partition_layout(&self, db_id: DbId, table_id: TableId, partition_id: PartitionId) -> Layout {
        let Some(db) = self.state_machine.catalog().get_db(db_id) else {
            return Layout::TableDropped;
        };
        let meta = db.read();
        let Some(table) = meta.tables.get(&table_id) else {
            return Layout::TableDropped;
        };
        let Some(partition) = table.partitions.get(&partition_id) else {
            return Layout::PartitionDropped;
        };
        let mut layout = PartitionLayout {
            visible_version: partition.visible_version,
            normal: BTreeMap::new(),
            shadow: Vec::new(),
        };
        for index in &partition.indexes {
            let mut tablets: BTreeMap<WorkerId, Vec<TabletId>> = BTreeMap::new();
            for tablet in &index.tablets {
                // Tablets without a worker are left out and publish fails below.
                if let Some(worker_id) = tablet.primary_worker() {
                    tablets.entry(worker_id).or_default().push(tablet.id);
                }
            }
            match index.state {
                IndexState::Normal => {
                    for (worker_id, ids) in tablets {
                        layout.normal.entry(worker_id).or_default().extend(ids);
                    }
                }
                IndexState::Shadow => layout.shadow.push(ShadowIndex {
                    visible_txn_id: index.visible_txn_id,
                    tablets,
                }),
            }
        }
        layout
            .normal
            .values_mut()
            .for_each(|ids| ids.sort_unstable());
        Layout::Ready(layout)
    }

    /// Run RPCs on the publish executor and collect their results. The
    /// first failure wins.
    async fn run_rpcs<F, T>(&self, calls: Vec<F>) -> Result<Vec<T>, String>
    where
        F: Future<Output = Result<T, WorkerRpcError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            match self.lake.executor.submit(call) {
                Ok(handle) => handles.push(handle),
                Err(err) => return Err(err.to_string()),
            }
        }
        let mut out = Vec::with_capacity(handles.len());
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(value)) => out.push(value),
                Ok(Err(err)) => return Err(err.to_string()),
                Err(err) => return Err(format!("publish rpc aborted: {err}")),
            }
        }
        Ok(out)
    }

    /// Publish a contiguous multi-transaction batch of one table.
    async fn publish_lake_batch(self: &Arc<Self>, batch: &TransactionStateBatch) {
        let db_id = batch.db_id();
        let table_id = batch.table_id();
        if self.state_machine.catalog().get_db(db_id).is_none() {
            tracing::info!(db_id, txns = ?batch.txn_ids(), "database dropped, finishing lake batch");
            if let Err(err) = self.state_machine.finish_transaction_batch(batch) {
                tracing::warn!(db_id, error = %err, "finish lake batch failed");
            }
            return;
        }

        let now = unix_time_ms();
        let mut all_done = true;
        let mut cleanup = Vec::new();
        for (partition_id, data) in batch.partition_publish_data() {
            let infos: Vec<&PartitionCommitInfo> = batch
                .txns()
                .iter()
                .filter_map(|t| t.partition_commit_info(table_id, partition_id))
                .collect();
            if infos.iter().all(|i| i.publish_succeeded()) {
                continue;
            }
            if infos.iter().any(|i| !i.publish_succeeded() && !i.publish_attempt_due(now)) {
                all_done = false;
                continue;
            }

            let outcome = self.publish_batch_partition(batch, &data).await;
            let done_at = unix_time_ms();
            match outcome {
                Ok(target) => {
                    for txn_id in &data.txn_ids {
                        if let Err(err) = self.state_machine.set_partition_version_time(
                            db_id,
                            *txn_id,
                            table_id,
                            partition_id,
                            done_at,
                        ) {
                            tracing::debug!(txn_id, partition_id, error = %err, "record publish outcome failed");
                        }
                    }
                    cleanup.extend(target);
                }
                Err(message) => {
                    all_done = false;
                    if self.should_warn(&format!("lake-batch-{table_id}-{partition_id}")) {
                        tracing::warn!(
                            db_id,
                            table_id,
                            partition_id,
                            start_version = data.start_version(),
                            end_version = data.end_version(),
                            error = %message,
                            "publish batch partition failed"
                        );
                    }
                    for txn_id in &data.txn_ids {
                        let recorded = self
                            .state_machine
                            .set_partition_version_time(db_id, *txn_id, table_id, partition_id, -done_at)
                            .and_then(|()| self.state_machine.set_error_msg(db_id, *txn_id, message.clone()));
                        if let Err(err) = recorded {
                            tracing::debug!(txn_id, partition_id, error = %err, "record publish outcome failed");
                        }
                    }
                }
            }
        }
        if !all_done {
            return;
        }

        if let Err(err) = self.state_machine.finish_transaction_batch(batch) {
            if self.should_warn(&format!("lake-batch-finish-{table_id}")) {
                tracing::warn!(db_id, table_id, txns = ?batch.txn_ids(), error = %err, "finish lake batch failed");
            }
            return;
        }
        tracing::debug!(db_id, table_id, txns = batch.len(), "lake batch visible");
        self.cleanup_txn_logs(cleanup);
    }

    /// `Ok(None)` when the table or partition is gone.
    async fn publish_batch_partition(
        &self,
        batch: &TransactionStateBatch,
        data: &PartitionPublishVersionData,
    ) -> Result<Option<CleanupTarget>, String> {
        let layout = match self.partition_layout(batch.db_id(), data.table_id, data.partition_id) {
            Layout::TableDropped => {
                for txn_id in &data.txn_ids {
                    if let Err(err) = self.state_machine.remove_table(batch.db_id(), *txn_id, data.table_id) {
                        tracing::debug!(txn_id, error = %err, "remove dropped table failed");
                    }
                }
                return Ok(None);
            }
            Layout::PartitionDropped => return Ok(None),
            Layout::Ready(layout) => layout,
        };
        if layout.visible_version + 1 != data.start_version() {
            return Err(format!(
                "visible version {} does not precede batch start version {}",
                layout.visible_version,
                data.start_version()
            ));
        }

        // Each shadow index only takes the txns it is visible to.
        let mut shadow_calls = Vec::new();
        for index in &layout.shadow {
            let members: Vec<usize> = (0..data.txn_ids.len())
                .filter(|i| data.txn_ids[*i] >= index.visible_txn_id)
                .collect();
            if members.is_empty() {
                continue;
            }
            for (worker_id, tablets) in &index.tablets {
                let client = self.client.clone();
                let worker_id = *worker_id;
                let req = PublishLogVersionRequest {
                    tablet_ids: tablets.clone(),
                    txn_infos: members.iter().map(|i| data.txn_infos[*i]).collect(),
                    versions: members.iter().map(|i| data.versions[*i]).collect(),
                };
                shadow_calls.push(async move { client.publish_log_version(worker_id, req).await });
            }
        }
        self.run_rpcs(shadow_calls).await?;

        let calls: Vec<_> = layout
            .normal
            .iter()
            .map(|(worker_id, tablets)| {
                let client = self.client.clone();
                let worker_id = *worker_id;
                let req = PublishVersionRequest {
                    tablet_ids: tablets.clone(),
                    txn_infos: data.txn_infos.clone(),
                    base_version: layout.visible_version,
                    new_version: data.end_version(),
                };
                async move { client.publish_version(worker_id, req).await }
            })
            .collect();
        let responses = self.run_rpcs(calls).await?;

        let mut scores = Vec::new();
        for resp in responses {
            if !resp.failed_tablets.is_empty() {
                return Err(format!("tablets {:?} failed to publish", resp.failed_tablets));
            }
            scores.extend(resp.compaction_scores.values().copied());
        }
        if let Some(score) = Quantiles::compute(&scores) {
            if let Some(last) = data.txn_ids.last() {
                let recorded = self.state_machine.set_partition_publish_stats(
                    batch.db_id(),
                    *last,
                    data.table_id,
                    data.partition_id,
                    Some(score),
                    BTreeMap::new(),
                );
                if let Err(err) = recorded {
                    tracing::debug!(txn_id = last, error = %err, "record compaction score failed");
                }
            }
        }

        Ok(Some(CleanupTarget {
            partition_id: data.partition_id,
            worker_tablets: layout.normal,
            txn_infos: data.txn_infos.clone(),
        }))
    }

    /// Best effort: failures are logged and forgotten.
    ///
    /// Per-tablet logs are deleted on every worker holding the partition. A
    /// combined log lives once per partition, so one worker is asked to
    /// delete it along with its own tablets.
    fn cleanup_txn_logs(self: &Arc<Self>, targets: Vec<CleanupTarget>) {
        for target in targets {
            let (combined, normal): (Vec<TxnInfo>, Vec<TxnInfo>) = target
                .txn_infos
                .iter()
                .partition(|info| info.combined_txn_log);
            let mut requests = Vec::new();
            if !normal.is_empty() {
                let txn_ids: Vec<TxnId> = normal.iter().map(|info| info.txn_id).collect();
                for (worker_id, tablets) in &target.worker_tablets {
                    requests.push((
                        *worker_id,
                        DeleteTxnLogRequest {
                            partition_id: target.partition_id,
                            tablet_ids: tablets.clone(),
                            txn_ids: txn_ids.clone(),
                            txn_infos: Vec::new(),
                        },
                    ));
                }
            }
            if !combined.is_empty() {
                if let Some((worker_id, tablets)) = target.worker_tablets.iter().next() {
                    requests.push((
                        *worker_id,
                        DeleteTxnLogRequest {
                            partition_id: target.partition_id,
                            tablet_ids: tablets.clone(),
                            txn_ids: Vec::new(),
                            txn_infos: combined,
                        },
                    ));
                }
            }

            for (worker_id, req) in requests {
                let client = self.client.clone();
                let partition_id = req.partition_id;
                let submitted = self
                    .lake
                    .cleanup_executor
                    .submit(async move { client.delete_txn_log(worker_id, req).await });
                let this = self.clone();
                match submitted {
                    Ok(handle) => {
                        tokio::spawn(async move {
                            let result = match handle.await {
                                Ok(result) => result.map_err(|err| err.to_string()),
                                Err(err) => Err(err.to_string()),
                            };
                            if let Err(message) = result {
                                this.warn_cleanup_failed(worker_id, partition_id, &message);
                            }
                        });
                    }
                    Err(err) => this.warn_cleanup_failed(worker_id, partition_id, &err.to_string()),
                }
            }
        }
    }

    fn warn_cleanup_failed(&self, worker_id: WorkerId, partition_id: PartitionId, message: &str) {
        if self.should_warn(&format!("txnlog-cleanup-{worker_id}")) {
            tracing::warn!(worker_id, partition_id, error = %message, "delete txn log failed");
        }
    }
}

//! Transaction lifecycle driver.
//!
//! Lifecycle:
//! 1. `begin_transaction` issues an id and reserves the label (PREPARE)
//! 2. `prepare_transaction` records a two-phase prepare (PREPARED)
//! 3. `commit_transaction` checks the write quorum and assigns one version per
//!    touched partition (COMMITTED)
//! 4. `finish_transaction` advances trusted replicas and partition visible
//!    versions once the publish scheduler decides the txn is done (VISIBLE)
//! 5. `abort_transaction` ends any transaction that is not yet visible
//!
//! Each transition validates legality, runs callback before-hooks (which may
//! veto), journals the new record, mutates the catalog, then runs the
//! after-hooks outside all locks. Lock order is per-database transaction
//! table, then catalog database, then the catalog tablet index. Callbacks
//! run under the transaction table lock and must not call back into the
//! state machine.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::batch::TransactionStateBatch;
use crate::callback::{CallbackRegistry, TxnStateChangeCallback};
use crate::catalog::{Catalog, DatabaseMeta};
use crate::error::{TxnError, TxnResult};
use crate::journal::{EditLog, JournalEntry};
use crate::txn::{
    LoadJobSourceType, PartitionCommitInfo, Quantiles, TableCommitInfo, TabletCommitInfo,
    TransactionState, TxnCommitAttachment, TxnCoordinator, TxnStatus,
};
use crate::{
    unix_time_ms, DbId, PartitionId, ReplicaId, TableId, TabletId, TxnId, Version, WorkerId,
};
use crate::warn::{should_warn, WARN_INTERVAL};

const ABORT_REASON_TIMEOUT: &str = "timeout by txn manager";

/// Retention and timeout knobs of the state machine.
#[derive(Clone, Copy, Debug)]
pub struct TxnConfig {
    /// Final transactions (and their labels) are kept this long.
    pub label_keep_max_ms: i64,
    /// PREPARED transactions older than this are aborted by the sweeper.
    pub prepared_timeout_ms: i64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            label_keep_max_ms: 3 * 24 * 3600 * 1000,
            prepared_timeout_ms: 24 * 3600 * 1000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BeginRequest {
    pub db_id: DbId,
    pub table_ids: Vec<TableId>,
    pub label: String,
    /// Client retry token. A retried begin with the same label and request id
    /// gets the original txn id back.
    pub request_id: Option<String>,
    pub coordinator: TxnCoordinator,
    pub source_type: LoadJobSourceType,
    pub timeout_ms: i64,
    pub callback_id: Option<u64>,
    /// Workers write one combined txn log per partition instead of one per
    /// tablet.
    pub use_combined_txn_log: bool,
}

impl BeginRequest {
    pub fn new(db_id: DbId, table_ids: Vec<TableId>, label: impl Into<String>) -> Self {
        Self {
            db_id,
            table_ids,
            label: label.into(),
            request_id: None,
            coordinator: TxnCoordinator::fe("127.0.0.1"),
            source_type: LoadJobSourceType::Frontend,
            timeout_ms: 300_000,
            callback_id: None,
            use_combined_txn_log: false,
        }
    }
}

#[derive(Default)]
struct DbTxnTable {
    txns: BTreeMap<TxnId, TransactionState>,
    labels: HashMap<String, Vec<TxnId>>,
    /// Committed, not yet visible transactions by commit sequence.
    committed: BTreeMap<u64, TxnId>,
    latches: HashMap<TxnId, watch::Sender<TxnStatus>>,
}

impl DbTxnTable {
    fn get(&self, db_id: DbId, txn_id: TxnId) -> TxnResult<&TransactionState> {
        self.txns
            .get(&txn_id)
            .ok_or(TxnError::TxnNotFound { db_id, txn_id })
    }

    fn upsert(&mut self, txn: TransactionState) {
        if let Some(prev) = self.txns.get(&txn.txn_id) {
            if prev.status == TxnStatus::Committed {
                self.committed.remove(&prev.commit_seq);
            }
        }
        if txn.status == TxnStatus::Committed {
            self.committed.insert(txn.commit_seq, txn.txn_id);
        }
        let ids = self.labels.entry(txn.label.clone()).or_default();
        if !ids.contains(&txn.txn_id) {
            ids.push(txn.txn_id);
        }
        let status = txn.status;
        let latch = self
            .latches
            .entry(txn.txn_id)
            .or_insert_with(|| watch::channel(status).0);
        // Re-sending an unchanged status wakes nobody, which keeps VISIBLE
        // release idempotent.
        latch.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        self.txns.insert(txn.txn_id, txn);
    }

    fn remove(&mut self, txn_id: TxnId) -> Option<TransactionState> {
        let txn = self.txns.remove(&txn_id)?;
        self.committed.remove(&txn.commit_seq);
        if let Some(ids) = self.labels.get_mut(&txn.label) {
            ids.retain(|id| *id != txn_id);
            if ids.is_empty() {
                self.labels.remove(&txn.label);
            }
        }
        self.latches.remove(&txn_id);
        Some(txn)
    }
}

struct DbTxnManager {
    db_id: DbId,
    table: RwLock<DbTxnTable>,
}

struct ErrorReplica {
    table_id: TableId,
    partition_id: PartitionId,
    tablet_id: TabletId,
    replica_id: ReplicaId,
    version: Version,
}

#[derive(Default)]
struct CommitPlan {
    versions: BTreeMap<TableId, BTreeMap<PartitionId, Version>>,
    error_replicas: Vec<ErrorReplica>,
    confirmed: HashSet<(TabletId, WorkerId)>,
}

pub struct TransactionStateMachine {
    catalog: Arc<Catalog>,
    journal: Arc<dyn EditLog>,
    callbacks: CallbackRegistry,
    dbs: RwLock<BTreeMap<DbId, Arc<DbTxnManager>>>,
    next_txn_id: AtomicU64,
    next_commit_seq: AtomicU64,
    contiguity_violations: AtomicU64,
    last_warn: Mutex<BTreeMap<String, Instant>>,
    cfg: TxnConfig,
}

impl TransactionStateMachine {
    pub fn new(catalog: Arc<Catalog>, journal: Arc<dyn EditLog>, cfg: TxnConfig) -> Self {
        Self {
            catalog,
            journal,
            callbacks: CallbackRegistry::default(),
            dbs: RwLock::new(BTreeMap::new()),
            next_txn_id: AtomicU64::new(0),
            next_commit_seq: AtomicU64::new(0),
            contiguity_violations: AtomicU64::new(0),
            last_warn: Mutex::new(BTreeMap::new()),
            cfg,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> TxnConfig {
        self.cfg
    }

    pub fn register_callback(&self, callback: Arc<dyn TxnStateChangeCallback>) -> u64 {
        self.callbacks.register(callback)
    }

    pub fn remove_callback(&self, id: u64) {
        self.callbacks.remove(id);
    }

    fn db_mgr(&self, db_id: DbId) -> Arc<DbTxnManager> {
        if let Some(mgr) = self.dbs.read().unwrap().get(&db_id) {
            return mgr.clone();
        }
        self.dbs
            .write()
            .unwrap()
            .entry(db_id)
            .or_insert_with(|| {
                Arc::new(DbTxnManager {
                    db_id,
                    table: RwLock::new(DbTxnTable::default()),
                })
            })
            .clone()
    }

    fn existing_mgr(&self, db_id: DbId, txn_id: TxnId) -> TxnResult<Arc<DbTxnManager>> {
        self.dbs
            .read()
            .unwrap()
            .get(&db_id)
            .cloned()
            .ok_or(TxnError::TxnNotFound { db_id, txn_id })
    }

    fn managers(&self) -> Vec<Arc<DbTxnManager>> {
        self.dbs.read().unwrap().values().cloned().collect()
    }

    fn persist(&self, txn: &TransactionState) -> TxnResult<()> {
        self.journal
            .append(&JournalEntry::UpsertTransaction(txn.clone()))
            .map_err(TxnError::from)
    }

    pub fn begin_transaction(&self, req: BeginRequest) -> TxnResult<TxnId> {
        if self.catalog.get_db(req.db_id).is_none() {
            return Err(TxnError::DbNotFound(req.db_id));
        }
        let mgr = self.db_mgr(req.db_id);
        let mut table = mgr.table.write().unwrap();

        if let Some(ids) = table.labels.get(&req.label) {
            for id in ids {
                let Some(existing) = table.txns.get(id) else {
                    continue;
                };
                if existing.status == TxnStatus::Aborted {
                    continue;
                }
                let retried = existing.status == TxnStatus::Prepare
                    && req.request_id.is_some()
                    && existing.request_id == req.request_id;
                if retried {
                    tracing::info!(
                        txn_id = existing.txn_id,
                        label = %req.label,
                        "begin retried with same request id"
                    );
                    return Ok(existing.txn_id);
                }
                return Err(TxnError::LabelAlreadyUsed {
                    label: req.label.clone(),
                    txn_id: existing.txn_id,
                    status: existing.status,
                });
            }
        }

        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut txn = TransactionState::new(
            req.db_id,
            req.table_ids,
            txn_id,
            req.label,
            req.coordinator,
            req.source_type,
            req.timeout_ms,
            unix_time_ms(),
        );
        txn.global_txn_id = txn_id;
        txn.request_id = req.request_id;
        txn.callback_ids.extend(req.callback_id);
        txn.use_combined_txn_log = req.use_combined_txn_log;
        self.persist(&txn)?;
        tracing::info!(
            txn_id,
            db_id = txn.db_id,
            label = %txn.label,
            source_type = ?txn.source_type,
            "begin transaction"
        );
        table.upsert(txn);
        Ok(txn_id)
    }

    /// PREPARE → PREPARED. Records the tablets the load wrote so far.
    pub fn prepare_transaction(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        tablet_commit_infos: &[TabletCommitInfo],
    ) -> TxnResult<()> {
        let mgr = self.existing_mgr(db_id, txn_id)?;
        let prepared = {
            let mut table = mgr.table.write().unwrap();
            let current = table.get(db_id, txn_id)?;
            match current.status {
                TxnStatus::Prepared => return Ok(()),
                TxnStatus::Prepare => {}
                from => {
                    return Err(TxnError::IllegalStateTransition {
                        txn_id,
                        from,
                        to: TxnStatus::Prepared,
                    })
                }
            }
            let mut next = current.clone();
            self.run_before_hooks(&next, TxnStatus::Prepared)?;
            next.status = TxnStatus::Prepared;
            next.prepared_time = unix_time_ms();
            next.ledger.set_tablet_commit_infos(
                tablet_commit_infos
                    .iter()
                    .map(|info| (info.tablet_id, info.backend_id)),
            );
            self.persist(&next)?;
            table.upsert(next.clone());
            next
        };
        tracing::info!(txn_id, db_id, "prepare transaction");
        self.run_after_hooks(&prepared, TxnStatus::Prepared, true);
        Ok(())
    }

    /// PREPARE/PREPARED → COMMITTED. Committing an already committed or
    /// visible transaction is a no-op.
    pub fn commit_transaction(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        tablet_commit_infos: &[TabletCommitInfo],
        tablet_fail_infos: &[TabletCommitInfo],
        attachment: Option<TxnCommitAttachment>,
    ) -> TxnResult<()> {
        let db = self
            .catalog
            .get_db(db_id)
            .ok_or(TxnError::DbNotFound(db_id))?;
        let mgr = self.existing_mgr(db_id, txn_id)?;
        let result = {
            let mut table = mgr.table.write().unwrap();
            let current = table.get(db_id, txn_id)?;
            match current.status {
                TxnStatus::Committed | TxnStatus::Visible => {
                    tracing::debug!(txn_id, status = ?current.status, "transaction already committed");
                    return Ok(());
                }
                TxnStatus::Aborted => {
                    return Err(TxnError::IllegalStateTransition {
                        txn_id,
                        from: TxnStatus::Aborted,
                        to: TxnStatus::Committed,
                    })
                }
                TxnStatus::Prepare | TxnStatus::Prepared => {}
            }
            let mut next = current.clone();
            if attachment.is_some() {
                next.attachment = attachment;
            }

            let mut meta = db.write();
            let attempt = self
                .plan_commit(&meta, &next, tablet_commit_infos, tablet_fail_infos)
                .and_then(|plan| {
                    self.run_before_hooks(&next, TxnStatus::Committed)?;
                    Ok(plan)
                });
            match attempt {
                Ok(plan) => {
                    for (table_id, partitions) in &plan.versions {
                        let info = next
                            .table_commit_infos
                            .entry(*table_id)
                            .or_insert_with(|| TableCommitInfo::new(*table_id));
                        for (partition_id, version) in partitions {
                            info.partitions.insert(
                                *partition_id,
                                PartitionCommitInfo::new(*partition_id, *version),
                            );
                        }
                    }
                    for err in &plan.error_replicas {
                        next.ledger.record_error(err.replica_id);
                    }
                    next.ledger
                        .set_tablet_commit_infos(plan.confirmed.iter().copied());
                    next.status = TxnStatus::Committed;
                    next.commit_time = unix_time_ms();
                    next.commit_seq = self.next_commit_seq.fetch_add(1, Ordering::SeqCst) + 1;
                    next.error_msg.clear();
                    self.persist(&next)?;

                    for (table_id, partitions) in &plan.versions {
                        for (partition_id, version) in partitions {
                            if let Some(partition) = meta.partition_mut(*table_id, *partition_id) {
                                partition.next_version = version + 1;
                            }
                        }
                    }
                    for err in &plan.error_replicas {
                        let replica = meta
                            .partition_mut(err.table_id, err.partition_id)
                            .and_then(|p| p.tablets_mut().find(|t| t.id == err.tablet_id))
                            .and_then(|t| t.replicas.iter_mut().find(|r| r.id == err.replica_id));
                        if let Some(replica) = replica {
                            replica.mark_failed(err.version);
                        }
                    }
                    drop(meta);
                    table.upsert(next.clone());
                    Ok(next)
                }
                Err(err) => Err((err, next)),
            }
        };

        match result {
            Ok(committed) => {
                tracing::info!(
                    txn_id,
                    db_id,
                    partitions = committed.partition_commit_infos().count(),
                    error_replicas = committed.ledger.error_replicas().len(),
                    "commit transaction"
                );
                self.run_after_hooks(&committed, TxnStatus::Committed, true);
                Ok(())
            }
            Err((err, snapshot)) => {
                tracing::warn!(txn_id, db_id, error = %err, "commit transaction failed");
                self.run_after_hooks(&snapshot, TxnStatus::Committed, false);
                Err(err)
            }
        }
    }

    fn plan_commit(
        &self,
        meta: &DatabaseMeta,
        txn: &TransactionState,
        tablet_commit_infos: &[TabletCommitInfo],
        tablet_fail_infos: &[TabletCommitInfo],
    ) -> TxnResult<CommitPlan> {
        for table_id in &txn.table_ids {
            if !meta.tables.contains_key(table_id) {
                return Err(TxnError::TableNotFound {
                    db_id: txn.db_id,
                    table_id: *table_id,
                });
            }
        }
        let failed: HashSet<(TabletId, WorkerId)> = tablet_fail_infos
            .iter()
            .map(|info| (info.tablet_id, info.backend_id))
            .collect();
        let confirmed: HashSet<(TabletId, WorkerId)> = tablet_commit_infos
            .iter()
            .map(|info| (info.tablet_id, info.backend_id))
            .filter(|key| !failed.contains(key))
            .collect();

        let mut involved: BTreeMap<TableId, BTreeSet<PartitionId>> = BTreeMap::new();
        for (tablet_id, _) in &confirmed {
            let Some(tm) = self.catalog.tablet_meta(*tablet_id) else {
                continue;
            };
            if tm.db_id != txn.db_id || !txn.table_ids.contains(&tm.table_id) {
                continue;
            }
            involved.entry(tm.table_id).or_default().insert(tm.partition_id);
        }

        let mut plan = CommitPlan::default();
        for (table_id, partitions) in &involved {
            for partition_id in partitions {
                let Some(partition) = meta.partition(*table_id, *partition_id) else {
                    continue;
                };
                let version = partition.next_version;
                let (normal, shadow) = partition.tablets_for_txn(txn.txn_id);
                for tablet in normal.into_iter().chain(shadow) {
                    let mut success = 0;
                    for replica in &tablet.replicas {
                        if confirmed.contains(&(tablet.id, replica.backend_id)) {
                            success += 1;
                        } else {
                            plan.error_replicas.push(ErrorReplica {
                                table_id: *table_id,
                                partition_id: *partition_id,
                                tablet_id: tablet.id,
                                replica_id: replica.id,
                                version,
                            });
                        }
                    }
                    if success < tablet.quorum() {
                        return Err(TxnError::CommitFailed(format!(
                            "tablet {} has {success} successful replicas, quorum is {}",
                            tablet.id,
                            tablet.quorum()
                        )));
                    }
                }
                plan.versions
                    .entry(*table_id)
                    .or_default()
                    .insert(*partition_id, version);
            }
        }
        plan.confirmed = confirmed;
        Ok(plan)
    }

    /// Commit, then wait up to `timeout` for the transaction to become
    /// visible. `Ok(false)` means committed but not yet visible.
    pub async fn commit_and_publish(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        tablet_commit_infos: &[TabletCommitInfo],
        tablet_fail_infos: &[TabletCommitInfo],
        attachment: Option<TxnCommitAttachment>,
        timeout: Duration,
    ) -> TxnResult<bool> {
        self.commit_transaction(db_id, txn_id, tablet_commit_infos, tablet_fail_infos, attachment)?;
        self.wait_transaction_visible(db_id, txn_id, Some(timeout))
            .await
    }

    /// COMMITTED → VISIBLE.
    ///
    /// `publish_error_replicas` are replicas whose workers reported a failed
    /// publish; replicas on `unfinished_workers` are recorded as unknown.
    /// Fails with `VersionGap` when a predecessor version is not yet visible
    /// and with `QuorumNotMet` when too few replicas would reach the version;
    /// the transaction then stays COMMITTED.
    pub fn finish_transaction(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        publish_error_replicas: &BTreeSet<ReplicaId>,
        unfinished_workers: &BTreeSet<WorkerId>,
    ) -> TxnResult<()> {
        let mgr = self.existing_mgr(db_id, txn_id)?;
        let visible = {
            let mut table = mgr.table.write().unwrap();
            let current = table.get(db_id, txn_id)?;
            match current.status {
                TxnStatus::Visible => return Ok(()),
                TxnStatus::Committed => {}
                from => {
                    return Err(TxnError::IllegalStateTransition {
                        txn_id,
                        from,
                        to: TxnStatus::Visible,
                    })
                }
            }
            let mut next = current.clone();
            let now = unix_time_ms();

            match self.catalog.get_db(db_id) {
                Some(db) => {
                    let mut meta = db.write();
                    let planned = self
                        .plan_visible(&meta, &mut next, publish_error_replicas, unfinished_workers)
                        .and_then(|()| self.run_before_hooks(&next, TxnStatus::Visible));
                    if let Err(err) = planned {
                        if let Some(stored) = table.txns.get_mut(&txn_id) {
                            stored.set_error_msg(err.to_string(), now);
                        }
                        return Err(err);
                    }
                    next.status = TxnStatus::Visible;
                    next.finish_time = now;
                    next.error_msg.clear();
                    self.persist(&next)?;
                    apply_visible(&mut meta, &next, now);
                }
                None => {
                    tracing::info!(txn_id, db_id, "database dropped, finishing transaction");
                    self.run_before_hooks(&next, TxnStatus::Visible)?;
                    next.status = TxnStatus::Visible;
                    next.finish_time = now;
                    self.persist(&next)?;
                }
            }
            next.ledger.release_tablet_commit_infos();
            table.upsert(next.clone());
            next
        };
        tracing::info!(
            txn_id,
            db_id,
            publish_cost_ms = visible.finish_time - visible.commit_time,
            unknown_replicas = visible.ledger.unknown_replicas().len(),
            "transaction visible"
        );
        self.run_after_hooks(&visible, TxnStatus::Visible, true);
        Ok(())
    }

    fn plan_visible(
        &self,
        meta: &DatabaseMeta,
        next: &mut TransactionState,
        publish_error_replicas: &BTreeSet<ReplicaId>,
        unfinished_workers: &BTreeSet<WorkerId>,
    ) -> TxnResult<()> {
        let mut dropped_tables = Vec::new();
        for (table_id, info) in next.table_commit_infos.iter_mut() {
            let Some(table) = meta.tables.get(table_id) else {
                dropped_tables.push(*table_id);
                continue;
            };
            info.partitions
                .retain(|partition_id, _| table.partitions.contains_key(partition_id));
        }
        for table_id in dropped_tables {
            tracing::info!(txn_id = next.txn_id, table_id, "table dropped before publish");
            next.table_commit_infos.remove(&table_id);
        }
        for replica_id in publish_error_replicas {
            next.ledger.record_error(*replica_id);
        }

        let mut unknown = Vec::new();
        for (table_id, info) in next.partition_commit_infos() {
            let Some(partition) = meta.partition(table_id, info.partition_id) else {
                continue;
            };
            if next.source_type != LoadJobSourceType::Replication
                && partition.visible_version + 1 != info.version
            {
                return Err(TxnError::VersionGap {
                    partition_id: info.partition_id,
                    visible: partition.visible_version,
                    version: info.version,
                });
            }
            let (normal, shadow) = partition.tablets_for_txn(next.txn_id);
            for tablet in normal.into_iter().chain(shadow) {
                for replica in &tablet.replicas {
                    if unfinished_workers.contains(&replica.backend_id)
                        && !next.ledger.error_replicas().contains(&replica.id)
                    {
                        unknown.push(replica.id);
                    }
                }
            }
        }
        for replica_id in unknown {
            next.ledger.record_unknown(replica_id);
        }

        for (table_id, info) in next.partition_commit_infos() {
            let Some(partition) = meta.partition(table_id, info.partition_id) else {
                continue;
            };
            let (normal, shadow) = partition.tablets_for_txn(next.txn_id);
            for tablet in normal.into_iter().chain(shadow) {
                let healthy = tablet
                    .replicas
                    .iter()
                    .filter(|r| {
                        (r.version >= info.version && !next.ledger.is_suspect(r.id))
                            || next.ledger.is_trusted(tablet.id, r, info.version)
                    })
                    .count();
                if healthy < tablet.quorum() {
                    return Err(TxnError::QuorumNotMet {
                        tablet_id: tablet.id,
                        healthy,
                        quorum: tablet.quorum(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Finish every member of a batch in version order.
    pub fn finish_transaction_batch(&self, batch: &TransactionStateBatch) -> TxnResult<()> {
        let none = BTreeSet::new();
        for txn in batch.txns() {
            self.finish_transaction(batch.db_id(), txn.txn_id, &none, &none)?;
        }
        Ok(())
    }

    /// Abort a transaction that is not yet visible. A committed transaction
    /// can only be aborted while it holds the newest version of every
    /// partition it touches; its versions are handed back.
    pub fn abort_transaction(&self, db_id: DbId, txn_id: TxnId, reason: &str) -> TxnResult<()> {
        let mgr = self.existing_mgr(db_id, txn_id)?;
        let aborted = {
            let mut table = mgr.table.write().unwrap();
            let current = table.get(db_id, txn_id)?;
            match current.status {
                TxnStatus::Aborted => return Ok(()),
                TxnStatus::Visible => {
                    return Err(TxnError::IllegalStateTransition {
                        txn_id,
                        from: TxnStatus::Visible,
                        to: TxnStatus::Aborted,
                    })
                }
                _ => {}
            }
            let mut next = current.clone();
            let db = if next.status == TxnStatus::Committed {
                self.catalog.get_db(db_id)
            } else {
                None
            };
            let mut meta = db.as_ref().map(|db| db.write());
            let assigned: Vec<(TableId, PartitionId, Version)> = next
                .partition_commit_infos()
                .map(|(table_id, info)| (table_id, info.partition_id, info.version))
                .collect();
            if let Some(meta) = meta.as_ref() {
                for (table_id, partition_id, version) in &assigned {
                    let Some(partition) = meta.partition(*table_id, *partition_id) else {
                        continue;
                    };
                    if partition.next_version != version + 1 {
                        return Err(TxnError::IllegalStateTransition {
                            txn_id,
                            from: TxnStatus::Committed,
                            to: TxnStatus::Aborted,
                        });
                    }
                }
            }
            self.run_before_hooks(&next, TxnStatus::Aborted)?;
            next.status = TxnStatus::Aborted;
            next.reason = reason.to_string();
            next.finish_time = unix_time_ms();
            self.persist(&next)?;
            if let Some(meta) = meta.as_mut() {
                for (table_id, partition_id, version) in &assigned {
                    if let Some(partition) = meta.partition_mut(*table_id, *partition_id) {
                        partition.next_version = *version;
                    }
                }
            }
            drop(meta);
            next.ledger.release_tablet_commit_infos();
            table.upsert(next.clone());
            next
        };
        tracing::info!(txn_id, db_id, reason, "abort transaction");
        self.run_after_hooks(&aborted, TxnStatus::Aborted, true);
        Ok(())
    }

    /// Wait until the transaction is visible. `Ok(false)` on timeout,
    /// `TxnAborted` if it was aborted instead.
    pub async fn wait_transaction_visible(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        timeout: Option<Duration>,
    ) -> TxnResult<bool> {
        let mut rx = {
            let mgr = self.existing_mgr(db_id, txn_id)?;
            let table = mgr.table.read().unwrap();
            table
                .latches
                .get(&txn_id)
                .map(|latch| latch.subscribe())
                .ok_or(TxnError::TxnNotFound { db_id, txn_id })?
        };
        let wait = async move { rx.wait_for(|status| status.is_final()).await.map(|s| *s) };
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => return Ok(false),
            },
            None => wait.await,
        };
        match outcome {
            Ok(TxnStatus::Visible) => Ok(true),
            Ok(_) => {
                let reason = self
                    .get_transaction(db_id, txn_id)
                    .map(|t| t.reason)
                    .unwrap_or_default();
                Err(TxnError::TxnAborted { txn_id, reason })
            }
            // Latch dropped: the transaction was evicted meanwhile.
            Err(_) => match self.get_transaction(db_id, txn_id) {
                Some(txn) if txn.status == TxnStatus::Visible => Ok(true),
                _ => Err(TxnError::TxnNotFound { db_id, txn_id }),
            },
        }
    }

    pub fn get_transaction(&self, db_id: DbId, txn_id: TxnId) -> Option<TransactionState> {
        let mgr = self.dbs.read().unwrap().get(&db_id).cloned()?;
        let table = mgr.table.read().unwrap();
        table.txns.get(&txn_id).cloned()
    }

    /// Latest non-aborted transaction using `label`.
    pub fn txn_id_by_label(&self, db_id: DbId, label: &str) -> Option<TxnId> {
        let mgr = self.dbs.read().unwrap().get(&db_id).cloned()?;
        let table = mgr.table.read().unwrap();
        table
            .labels
            .get(label)?
            .iter()
            .rev()
            .find(|id| {
                table
                    .txns
                    .get(*id)
                    .is_some_and(|t| t.status != TxnStatus::Aborted)
            })
            .copied()
    }

    pub fn transactions(&self, db_id: DbId) -> Vec<TransactionState> {
        let Some(mgr) = self.dbs.read().unwrap().get(&db_id).cloned() else {
            return Vec::new();
        };
        let table = mgr.table.read().unwrap();
        table.txns.values().cloned().collect()
    }

    /// Committed transactions in commit order.
    pub fn ready_to_publish(&self) -> Vec<TransactionState> {
        let mut ready = Vec::new();
        for mgr in self.managers() {
            let table = mgr.table.read().unwrap();
            ready.extend(
                table
                    .committed
                    .values()
                    .filter_map(|id| table.txns.get(id).cloned()),
            );
        }
        ready.sort_by_key(|t| t.commit_seq);
        ready
    }

    /// Committed transactions grouped for batched publish.
    ///
    /// Consecutive single-table transactions of a table form one batch of at
    /// most `max_txns`. A multi-table transaction is published alone, and
    /// only when none of its tables has an earlier unpublished transaction;
    /// later transactions on its tables wait for it.
    pub fn ready_publish_batches(&self, max_txns: usize) -> Vec<TransactionStateBatch> {
        let max_txns = max_txns.max(1);
        let mut out = Vec::new();
        for mgr in self.managers() {
            let committed: Vec<TransactionState> = {
                let table = mgr.table.read().unwrap();
                table
                    .committed
                    .values()
                    .filter_map(|id| table.txns.get(id).cloned())
                    .collect()
            };
            let mut blocked: HashSet<TableId> = HashSet::new();
            let mut chains: BTreeMap<TableId, Vec<TransactionState>> = BTreeMap::new();
            for txn in committed {
                if txn.table_ids.len() != 1 {
                    let free = txn
                        .table_ids
                        .iter()
                        .all(|t| !blocked.contains(t) && !chains.contains_key(t));
                    blocked.extend(txn.table_ids.iter().copied());
                    if free {
                        let table_id = txn.table_ids.first().copied().unwrap_or_default();
                        match TransactionStateBatch::new(mgr.db_id, table_id, vec![txn]) {
                            Ok(batch) => out.push(batch),
                            Err(err) => tracing::warn!(error = %err, "skip invalid publish batch"),
                        }
                    }
                    continue;
                }
                let table_id = txn.table_ids[0];
                if blocked.contains(&table_id) {
                    continue;
                }
                let chain = chains.entry(table_id).or_default();
                chain.push(txn);
                if chain.len() >= max_txns {
                    blocked.insert(table_id);
                }
            }
            for (table_id, mut chain) in chains {
                while !chain.is_empty() {
                    match TransactionStateBatch::new(mgr.db_id, table_id, chain.clone()) {
                        Ok(batch) => {
                            out.push(batch);
                            break;
                        }
                        Err(err) => {
                            // Commit assigns consecutive versions, so a gap
                            // here means bookkeeping went wrong.
                            self.contiguity_violations.fetch_add(1, Ordering::Relaxed);
                            let key = format!("batch-contiguity-{}-{table_id}", mgr.db_id);
                            if should_warn(
                                &mut self.last_warn.lock().expect("last warn lock"),
                                &key,
                                WARN_INTERVAL,
                            ) {
                                tracing::warn!(
                                    db_id = mgr.db_id,
                                    table_id,
                                    error = %err,
                                    "committed txns are not contiguous, shrinking publish batch"
                                );
                            }
                            chain.pop();
                        }
                    }
                }
            }
        }
        out
    }

    /// Number of times batch assembly found committed transactions with
    /// non-contiguous versions.
    pub fn contiguity_violations(&self) -> u64 {
        self.contiguity_violations.load(Ordering::Relaxed)
    }

    /// Every touched partition's visible version directly precedes the
    /// transaction's version.
    pub fn publish_order_satisfied(&self, txn: &TransactionState) -> bool {
        if txn.source_type == LoadJobSourceType::Replication {
            return true;
        }
        let Some(db) = self.catalog.get_db(txn.db_id) else {
            return true;
        };
        let meta = db.read();
        txn.partition_commit_infos().all(|(table_id, info)| {
            meta.partition(table_id, info.partition_id)
                .map_or(true, |p| p.visible_version + 1 == info.version)
        })
    }

    /// Every touched tablet keeps a quorum of healthy replicas on finished
    /// workers outside the error set.
    pub fn can_txn_finish(
        &self,
        txn: &TransactionState,
        error_replicas: &BTreeSet<ReplicaId>,
        unfinished_workers: &BTreeSet<WorkerId>,
    ) -> bool {
        let Some(db) = self.catalog.get_db(txn.db_id) else {
            return true;
        };
        let meta = db.read();
        for (table_id, info) in txn.partition_commit_infos() {
            let Some(partition) = meta.partition(table_id, info.partition_id) else {
                continue;
            };
            let (normal, shadow) = partition.tablets_for_txn(txn.txn_id);
            for tablet in normal.into_iter().chain(shadow) {
                let healthy = tablet
                    .replicas
                    .iter()
                    .filter(|r| {
                        r.is_healthy_state()
                            && !unfinished_workers.contains(&r.backend_id)
                            && !error_replicas.contains(&r.id)
                            && !txn.ledger.error_replicas().contains(&r.id)
                    })
                    .count();
                if healthy < tablet.quorum() {
                    return false;
                }
            }
        }
        true
    }

    fn update_transaction(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        f: impl FnOnce(&mut TransactionState),
    ) -> TxnResult<()> {
        let mgr = self.existing_mgr(db_id, txn_id)?;
        let mut table = mgr.table.write().unwrap();
        let txn = table
            .txns
            .get_mut(&txn_id)
            .ok_or(TxnError::TxnNotFound { db_id, txn_id })?;
        f(txn);
        Ok(())
    }

    /// Record a partition publish outcome: positive on success, negated on
    /// failure.
    pub fn set_partition_version_time(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        table_id: TableId,
        partition_id: PartitionId,
        version_time: i64,
    ) -> TxnResult<()> {
        self.update_transaction(db_id, txn_id, |txn| {
            if let Some(info) = txn.partition_commit_info_mut(table_id, partition_id) {
                info.version_time = version_time;
            }
        })
    }

    pub fn set_partition_publish_stats(
        &self,
        db_id: DbId,
        txn_id: TxnId,
        table_id: TableId,
        partition_id: PartitionId,
        compaction_score: Option<Quantiles>,
        first_load_rows: BTreeMap<TabletId, u64>,
    ) -> TxnResult<()> {
        self.update_transaction(db_id, txn_id, |txn| {
            if let Some(info) = txn.partition_commit_info_mut(table_id, partition_id) {
                if compaction_score.is_some() {
                    info.compaction_score = compaction_score;
                }
                info.first_load_row_counts.extend(first_load_rows);
            }
        })
    }

    /// Drop a table from an in-flight transaction after it was dropped from
    /// the catalog.
    pub fn remove_table(&self, db_id: DbId, txn_id: TxnId, table_id: TableId) -> TxnResult<()> {
        self.update_transaction(db_id, txn_id, |txn| txn.remove_table(table_id))
    }

    pub fn set_error_msg(&self, db_id: DbId, txn_id: TxnId, msg: impl Into<String>) -> TxnResult<()> {
        let msg = msg.into();
        self.update_transaction(db_id, txn_id, |txn| txn.set_error_msg(msg, unix_time_ms()))
    }

    /// Abort PREPARE/PREPARED transactions past their timeouts.
    pub fn abort_timeout_transactions(&self, now_ms: i64) -> usize {
        let mut timed_out = Vec::new();
        for mgr in self.managers() {
            let table = mgr.table.read().unwrap();
            timed_out.extend(
                table
                    .txns
                    .values()
                    .filter(|t| t.is_timeout(now_ms, self.cfg.prepared_timeout_ms))
                    .map(|t| (t.db_id, t.txn_id)),
            );
        }
        let mut aborted = 0;
        for (db_id, txn_id) in timed_out {
            match self.abort_transaction(db_id, txn_id, ABORT_REASON_TIMEOUT) {
                Ok(()) => aborted += 1,
                Err(err) => {
                    tracing::warn!(txn_id, db_id, error = %err, "abort timed out transaction failed")
                }
            }
        }
        aborted
    }

    /// Evict final transactions older than the label retention window.
    pub fn remove_expired_transactions(&self, now_ms: i64) -> TxnResult<usize> {
        let mut removed = 0;
        for mgr in self.managers() {
            let mut table = mgr.table.write().unwrap();
            let expired: Vec<TxnId> = table
                .txns
                .values()
                .filter(|t| t.is_expired(now_ms, self.cfg.label_keep_max_ms))
                .map(|t| t.txn_id)
                .collect();
            if expired.is_empty() {
                continue;
            }
            self.journal.append(&JournalEntry::RemoveTransactions {
                db_id: mgr.db_id,
                txn_ids: expired.clone(),
            })?;
            for txn_id in &expired {
                table.remove(*txn_id);
            }
            tracing::info!(db_id = mgr.db_id, count = expired.len(), "removed expired transactions");
            removed += expired.len();
        }
        Ok(removed)
    }

    /// Rebuild transaction tables and partition versions from the journal.
    pub fn replay(&self) -> anyhow::Result<usize> {
        let entries = self.journal.load()?;
        for entry in &entries {
            self.replay_entry(entry);
        }
        Ok(entries.len())
    }

    fn replay_entry(&self, entry: &JournalEntry) {
        match entry {
            JournalEntry::UpsertTransaction(txn) => {
                self.next_txn_id.fetch_max(txn.txn_id, Ordering::SeqCst);
                self.next_commit_seq.fetch_max(txn.commit_seq, Ordering::SeqCst);
                let mgr = self.db_mgr(txn.db_id);
                let mut table = mgr.table.write().unwrap();
                let prev_status = table.txns.get(&txn.txn_id).map(|t| t.status);
                if let Some(db) = self.catalog.get_db(txn.db_id) {
                    let mut meta = db.write();
                    for (table_id, info) in txn.partition_commit_infos() {
                        let Some(partition) = meta.partition_mut(table_id, info.partition_id)
                        else {
                            continue;
                        };
                        match txn.status {
                            TxnStatus::Committed => {
                                partition.next_version =
                                    partition.next_version.max(info.version + 1);
                            }
                            TxnStatus::Visible => {
                                if info.version > partition.visible_version {
                                    partition.visible_version = info.version;
                                    partition.visible_version_time = txn.finish_time;
                                }
                                partition.next_version =
                                    partition.next_version.max(info.version + 1);
                            }
                            TxnStatus::Aborted
                                if prev_status == Some(TxnStatus::Committed)
                                    && partition.next_version == info.version + 1 =>
                            {
                                partition.next_version = info.version;
                            }
                            _ => {}
                        }
                    }
                }
                table.upsert(txn.clone());
                drop(table);
                for callback_id in &txn.callback_ids {
                    let Some(cb) = self.callbacks.get(*callback_id) else {
                        continue;
                    };
                    match txn.status {
                        TxnStatus::Committed => cb.replay_on_committed(txn),
                        TxnStatus::Visible => cb.replay_on_visible(txn),
                        TxnStatus::Aborted => cb.replay_on_aborted(txn),
                        _ => {}
                    }
                }
            }
            JournalEntry::RemoveTransactions { db_id, txn_ids } => {
                let Some(mgr) = self.dbs.read().unwrap().get(db_id).cloned() else {
                    return;
                };
                let mut table = mgr.table.write().unwrap();
                for txn_id in txn_ids {
                    table.remove(*txn_id);
                }
            }
        }
    }

    fn run_before_hooks(&self, txn: &TransactionState, target: TxnStatus) -> TxnResult<()> {
        for &callback_id in &txn.callback_ids {
            let Some(cb) = self.callbacks.get(callback_id) else {
                // Stream loads may finish their job before the commit lands.
                if target == TxnStatus::Committed
                    && txn.source_type != LoadJobSourceType::BackendStreaming
                {
                    return Err(TxnError::CallbackMissing {
                        txn_id: txn.txn_id,
                        callback_id,
                    });
                }
                continue;
            };
            let res = match target {
                TxnStatus::Prepare => Ok(()),
                TxnStatus::Prepared => cb.before_prepared(txn),
                TxnStatus::Committed => cb.before_committed(txn),
                TxnStatus::Visible => cb.before_visible(txn),
                TxnStatus::Aborted => cb.before_aborted(txn),
            };
            res.map_err(|err| TxnError::CallbackFailed {
                txn_id: txn.txn_id,
                message: format!("{err:#}"),
            })?;
        }
        Ok(())
    }

    fn run_after_hooks(&self, txn: &TransactionState, target: TxnStatus, txn_operated: bool) {
        for &callback_id in &txn.callback_ids {
            let Some(cb) = self.callbacks.get(callback_id) else {
                continue;
            };
            let res = match target {
                TxnStatus::Prepare => Ok(()),
                TxnStatus::Prepared => cb.after_prepared(txn, txn_operated),
                TxnStatus::Committed => cb.after_committed(txn, txn_operated),
                TxnStatus::Visible => cb.after_visible(txn, txn_operated),
                TxnStatus::Aborted => cb.after_aborted(txn, txn_operated, &txn.reason),
            };
            if let Err(err) = res {
                tracing::warn!(
                    txn_id = txn.txn_id,
                    callback_id,
                    status = ?target,
                    error = ?err,
                    "transaction callback after-hook failed"
                );
            }
        }
    }
}

fn apply_visible(meta: &mut DatabaseMeta, txn: &TransactionState, now_ms: i64) {
    for (table_id, info) in txn.partition_commit_infos() {
        let Some(partition) = meta.partition_mut(table_id, info.partition_id) else {
            continue;
        };
        for index in partition
            .indexes
            .iter_mut()
            .filter(|idx| idx.visible_for_txn(txn.txn_id))
        {
            for tablet in index.tablets.iter_mut() {
                let tablet_id = tablet.id;
                for replica in tablet.replicas.iter_mut() {
                    txn.ledger.apply_publish(tablet_id, replica, info.version);
                }
            }
        }
        partition.visible_version = partition.visible_version.max(info.version);
        partition.visible_version_time = now_ms;
        partition.next_version = partition.next_version.max(info.version + 1);
    }
}

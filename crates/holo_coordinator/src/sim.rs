//! In-process worker fleet.
//!
//! `LocalFleet` answers the coordinator's worker RPCs against the shared
//! catalog and reports task completions back through the completion
//! handler, the way real workers do over the network. It backs the
//! standalone binary and the integration tests, so it carries fault knobs:
//! unreachable workers, hanging or failing publishes, per-tablet errors,
//! and held reports released on demand.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use holo_txn::catalog::{
    MaterializedIndex, Partition, Replica, Table, TableKind, Tablet, PARTITION_INIT_VERSION,
};
use holo_txn::task::PublishVersionTask;
use holo_txn::txn::TabletCommitInfo;
use holo_txn::{AgentTask, Catalog, TabletId, TaskKind, TaskType, TxnId, WorkerId};

use crate::completion::{FinishTaskRequest, TabletInfo, TaskCompletionHandler};
use crate::worker::{
    DeleteTxnLogRequest, PublishLogVersionRequest, PublishVersionRequest, PublishVersionResponse,
    WorkerClient, WorkerRpcError,
};

/// Rows a simulated tablet reports after a publish.
const SIMULATED_TABLET_ROWS: u64 = 100;
/// Compaction score a simulated tablet reports after a publish.
const SIMULATED_COMPACTION_SCORE: f64 = 1.0;

#[derive(Default)]
struct Faults {
    unreachable: BTreeSet<WorkerId>,
    /// Accept publish tasks but never report them.
    hang_publish: BTreeSet<WorkerId>,
    fail_publish: BTreeSet<WorkerId>,
    error_tablets: BTreeSet<(WorkerId, TabletId)>,
    fail_delete_txn_log: bool,
}

#[derive(Default)]
struct HeldReports {
    txns: BTreeSet<TxnId>,
    pending: Vec<(TxnId, FinishTaskRequest)>,
}

/// RPCs the fleet has served, for inspection.
#[derive(Clone, Debug, Default)]
pub struct FleetCalls {
    pub submitted: Vec<(WorkerId, TaskType, u64)>,
    pub publish_version: Vec<(WorkerId, PublishVersionRequest)>,
    pub publish_log_version: Vec<(WorkerId, PublishLogVersionRequest)>,
    pub delete_txn_log: Vec<(WorkerId, DeleteTxnLogRequest)>,
}

pub struct LocalFleet {
    catalog: Arc<Catalog>,
    handler: OnceLock<Weak<TaskCompletionHandler>>,
    report_delay: Duration,
    faults: Mutex<Faults>,
    held: Mutex<HeldReports>,
    calls: Mutex<FleetCalls>,
}

impl LocalFleet {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self::with_report_delay(catalog, Duration::from_millis(1))
    }

    pub fn with_report_delay(catalog: Arc<Catalog>, report_delay: Duration) -> Self {
        Self {
            catalog,
            handler: OnceLock::new(),
            report_delay,
            faults: Mutex::new(Faults::default()),
            held: Mutex::new(HeldReports::default()),
            calls: Mutex::new(FleetCalls::default()),
        }
    }

    /// Route task reports to `handler`. Only the first call takes effect.
    pub fn attach(&self, handler: &Arc<TaskCompletionHandler>) {
        if self.handler.set(Arc::downgrade(handler)).is_err() {
            tracing::debug!("local fleet already attached");
        }
    }

    pub fn set_unreachable(&self, worker_id: WorkerId, unreachable: bool) {
        let mut faults = self.faults();
        toggle(&mut faults.unreachable, worker_id, unreachable);
    }

    pub fn hang_publish(&self, worker_id: WorkerId, hang: bool) {
        let mut faults = self.faults();
        toggle(&mut faults.hang_publish, worker_id, hang);
    }

    pub fn fail_publish(&self, worker_id: WorkerId, fail: bool) {
        let mut faults = self.faults();
        toggle(&mut faults.fail_publish, worker_id, fail);
    }

    /// Report `tablet_id` as failed whenever `worker_id` publishes it.
    pub fn fail_tablet(&self, worker_id: WorkerId, tablet_id: TabletId) {
        self.faults().error_tablets.insert((worker_id, tablet_id));
    }

    pub fn fail_delete_txn_log(&self, fail: bool) {
        self.faults().fail_delete_txn_log = fail;
    }

    /// Keep publish reports of `txn_id` until `release_txn`.
    pub fn hold_txn(&self, txn_id: TxnId) {
        self.held.lock().expect("held reports lock").txns.insert(txn_id);
    }

    /// Deliver the held reports of `txn_id`. Returns how many were sent.
    pub fn release_txn(&self, txn_id: TxnId) -> usize {
        let reports: Vec<FinishTaskRequest> = {
            let mut held = self.held.lock().expect("held reports lock");
            held.txns.remove(&txn_id);
            let (release, keep) = std::mem::take(&mut held.pending)
                .into_iter()
                .partition(|(id, _)| *id == txn_id);
            held.pending = keep;
            release.into_iter().map(|(_, req)| req).collect()
        };
        let Some(handler) = self.handler() else {
            return 0;
        };
        let count = reports.len();
        for req in reports {
            let result = handler.finish_task(req);
            tracing::debug!(txn_id, status = ?result.status, "released held publish report");
        }
        count
    }

    pub fn calls(&self) -> FleetCalls {
        self.calls.lock().expect("fleet calls lock").clone()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().expect("fleet faults lock")
    }

    fn handler(&self) -> Option<Arc<TaskCompletionHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn check_reachable(&self, worker_id: WorkerId) -> Result<(), WorkerRpcError> {
        if self.faults().unreachable.contains(&worker_id) {
            return Err(WorkerRpcError::Unreachable(worker_id));
        }
        Ok(())
    }

    /// What the worker would report after applying a publish task.
    fn publish_report(&self, task: &AgentTask, publish: &PublishVersionTask) -> FinishTaskRequest {
        let worker_id = task.worker_id;
        let req = FinishTaskRequest::new(worker_id, TaskType::PublishVersion, task.signature);
        let error_tablets: BTreeSet<TabletId> = {
            let faults = self.faults();
            if faults.fail_publish.contains(&worker_id) {
                return req.failed(format!("publish version failed on worker {worker_id}"));
            }
            faults
                .error_tablets
                .iter()
                .filter(|(w, _)| *w == worker_id)
                .map(|(_, t)| *t)
                .collect()
        };

        let mut req = req;
        let Some(db) = self.catalog.get_db(task.db_id) else {
            return req;
        };
        let meta = db.read();
        for pv in &publish.partition_versions {
            let Some(partition) = meta.partition(pv.table_id, pv.partition_id) else {
                continue;
            };
            let (normal, shadow) = partition.tablets_for_txn(publish.txn_id);
            for tablet in normal.into_iter().chain(shadow) {
                if tablet.replica_on(worker_id).is_none() {
                    continue;
                }
                if error_tablets.contains(&tablet.id) {
                    req.error_tablet_ids.push(tablet.id);
                } else {
                    req.tablet_versions.push((tablet.id, pv.version));
                }
            }
        }
        req
    }

    fn generic_report(task: &AgentTask) -> FinishTaskRequest {
        let mut req = FinishTaskRequest::new(task.worker_id, task.task_type(), task.signature);
        if let TaskKind::Push {
            tablet_id, version, ..
        } = &task.kind
        {
            req.finish_tablet_infos.push(TabletInfo {
                tablet_id: *tablet_id,
                version: *version,
                row_count: SIMULATED_TABLET_ROWS,
                path_hash: 0,
            });
        }
        req
    }
}

fn toggle(set: &mut BTreeSet<WorkerId>, worker_id: WorkerId, on: bool) {
    if on {
        set.insert(worker_id);
    } else {
        set.remove(&worker_id);
    }
}

#[async_trait]
impl WorkerClient for LocalFleet {
    async fn submit_tasks(
        &self,
        worker_id: WorkerId,
        tasks: Vec<Arc<AgentTask>>,
    ) -> Result<(), WorkerRpcError> {
        self.check_reachable(worker_id)?;
        let hang = self.faults().hang_publish.contains(&worker_id);

        let mut reports = Vec::new();
        {
            let mut calls = self.calls.lock().expect("fleet calls lock");
            for task in &tasks {
                calls
                    .submitted
                    .push((worker_id, task.task_type(), task.signature));
            }
        }
        for task in &tasks {
            match task.publish() {
                Some(_) if hang => {}
                Some(publish) => {
                    let report = self.publish_report(task, publish);
                    let mut held = self.held.lock().expect("held reports lock");
                    if held.txns.contains(&publish.txn_id) {
                        held.pending.push((publish.txn_id, report));
                    } else {
                        reports.push(report);
                    }
                }
                None => reports.push(Self::generic_report(task)),
            }
        }
        if reports.is_empty() {
            return Ok(());
        }

        let Some(handler) = self.handler() else {
            tracing::debug!(worker_id, "local fleet not attached, dropping reports");
            return Ok(());
        };
        let delay = self.report_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            for req in reports {
                let signature = req.signature;
                let result = handler.finish_task(req);
                if !result.status.is_ok() {
                    tracing::debug!(worker_id, signature, status = ?result.status, "task report rejected");
                }
            }
        });
        Ok(())
    }

    async fn publish_version(
        &self,
        worker_id: WorkerId,
        req: PublishVersionRequest,
    ) -> Result<PublishVersionResponse, WorkerRpcError> {
        self.check_reachable(worker_id)?;
        let (fail, error_tablets) = {
            let faults = self.faults();
            let errors: BTreeSet<TabletId> = faults
                .error_tablets
                .iter()
                .filter(|(w, _)| *w == worker_id)
                .map(|(_, t)| *t)
                .collect();
            (faults.fail_publish.contains(&worker_id), errors)
        };
        self.calls
            .lock()
            .expect("fleet calls lock")
            .publish_version
            .push((worker_id, req.clone()));
        if fail {
            return Err(WorkerRpcError::Rejected {
                worker_id,
                message: "publish version failed".to_string(),
            });
        }

        let mut resp = PublishVersionResponse::default();
        for tablet_id in req.tablet_ids {
            if error_tablets.contains(&tablet_id) {
                resp.failed_tablets.push(tablet_id);
                continue;
            }
            resp.compaction_scores
                .insert(tablet_id, SIMULATED_COMPACTION_SCORE);
            resp.tablet_row_nums.insert(tablet_id, SIMULATED_TABLET_ROWS);
        }
        Ok(resp)
    }

    async fn publish_log_version(
        &self,
        worker_id: WorkerId,
        req: PublishLogVersionRequest,
    ) -> Result<(), WorkerRpcError> {
        self.check_reachable(worker_id)?;
        self.calls
            .lock()
            .expect("fleet calls lock")
            .publish_log_version
            .push((worker_id, req));
        Ok(())
    }

    async fn delete_txn_log(
        &self,
        worker_id: WorkerId,
        req: DeleteTxnLogRequest,
    ) -> Result<(), WorkerRpcError> {
        self.check_reachable(worker_id)?;
        let fail = self.faults().fail_delete_txn_log;
        self.calls
            .lock()
            .expect("fleet calls lock")
            .delete_txn_log
            .push((worker_id, req));
        if fail {
            return Err(WorkerRpcError::Rejected {
                worker_id,
                message: "delete txn log failed".to_string(),
            });
        }
        Ok(())
    }
}

/// Seed `catalog` with a demo database (id 1) holding one table (id 10) of
/// two partitions, each with `tablets_per_partition` tablets spread over
/// `workers`. Olap tablets get up to three replicas, lake tablets one.
pub fn seed_demo_catalog(
    catalog: &Catalog,
    workers: &[WorkerId],
    kind: TableKind,
    tablets_per_partition: u64,
) -> Vec<TabletCommitInfo> {
    const DB: u64 = 1;
    const TABLE: u64 = 10;
    catalog.create_database(DB, "demo");
    if workers.is_empty() {
        return Vec::new();
    }
    let copies = match kind {
        TableKind::Olap => workers.len().min(3),
        TableKind::Lake => 1,
    };

    let mut commit_infos = Vec::new();
    let mut table = Table::new(TABLE, "events", kind);
    for (p, partition_id) in [100u64, 101].into_iter().enumerate() {
        let mut tablets = Vec::new();
        for t in 0..tablets_per_partition {
            let tablet_id = partition_id * 100 + t;
            let first = (p as u64 * tablets_per_partition + t) as usize;
            let replicas = (0..copies)
                .map(|c| {
                    let worker_id = workers[(first + c) % workers.len()];
                    commit_infos.push(TabletCommitInfo::new(tablet_id, worker_id));
                    Replica::new(tablet_id * 10 + worker_id, worker_id, PARTITION_INIT_VERSION)
                })
                .collect();
            tablets.push(Tablet::new(tablet_id, replicas));
        }
        let index = MaterializedIndex::new(partition_id * 10, tablets);
        table = table.with_partition(Partition::new(partition_id, PARTITION_INIT_VERSION, vec![index]));
    }
    catalog.create_table(DB, table);
    commit_infos
}

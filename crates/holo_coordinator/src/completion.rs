//! Worker task completion reports.
//!
//! Flow:
//! 1. reject reports when this node is not the leader or the worker is unknown
//! 2. look the task up by `(worker, type, signature)`; late reports are OK
//! 3. failed reports mark the task; only allow-listed types are finished,
//!    the rest stay registered for an external retry
//! 4. finished tasks are routed by kind, deregistered, and the publish
//!    scheduler is woken
//!
//! Finisher errors and panics are reported back to the worker as CANCELLED;
//! a saturated job-progress queue as TOO_MANY_TASKS.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use holo_txn::task::{PushType, TaskKind};
use holo_txn::txn::LoadJobSourceType;
use holo_txn::{
    unix_time_ms, AgentTask, PartitionId, ReplicaId, StatusCode, TableId, TabletId,
    TaskDispatchRegistry, TaskKey, TaskType, TransactionStateMachine, Version, WorkerId,
};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::cluster::ClusterInfo;
use crate::leader::{LeaderRole, LeaderState};

/// Capacity of the push job progress queue.
pub const JOB_PROGRESS_QUEUE_CAPACITY: usize = 4096;

/// Per-tablet state a worker attaches to a finished task.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TabletInfo {
    pub tablet_id: TabletId,
    pub version: Version,
    pub row_count: u64,
    pub path_hash: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinishTaskRequest {
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    pub signature: u64,
    pub status: StatusCode,
    pub error_msgs: Vec<String>,
    pub report_version: Option<i64>,
    pub finish_tablet_infos: Vec<TabletInfo>,
    /// Publish only: tablets the worker failed to publish.
    pub error_tablet_ids: Vec<TabletId>,
    /// Publish only: versions the worker reached per tablet.
    pub tablet_versions: Vec<(TabletId, Version)>,
    /// Publish only: rows of tablets loaded for the first time.
    pub tablet_row_counts: BTreeMap<TabletId, u64>,
}

impl FinishTaskRequest {
    pub fn new(worker_id: WorkerId, task_type: TaskType, signature: u64) -> Self {
        Self {
            worker_id,
            task_type,
            signature,
            status: StatusCode::Ok,
            error_msgs: Vec::new(),
            report_version: None,
            finish_tablet_infos: Vec::new(),
            error_tablet_ids: Vec::new(),
            tablet_versions: Vec::new(),
            tablet_row_counts: BTreeMap::new(),
        }
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = StatusCode::InternalError;
        self.error_msgs.push(message.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResult {
    pub status: StatusCode,
    pub error_msgs: Vec<String>,
}

impl TaskResult {
    pub fn ok() -> Self {
        Self {
            status: StatusCode::Ok,
            error_msgs: Vec::new(),
        }
    }

    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error_msgs: vec![message.into()],
        }
    }
}

/// Replica-level progress of load and delete push jobs.
#[derive(Clone, Debug, PartialEq)]
pub enum JobProgress {
    ReplicaFinished {
        job_id: u64,
        push_type: PushType,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        version: Version,
    },
    ReplicaFailed {
        job_id: u64,
        push_type: PushType,
        tablet_id: TabletId,
        message: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobStatus {
    pub finished_replicas: BTreeSet<ReplicaId>,
    pub failures: Vec<String>,
}

/// Unclaimed job progress is dropped after this long without an update.
pub const JOB_STATUS_KEEP: Duration = Duration::from_secs(30 * 60);

struct TrackedJob {
    status: JobStatus,
    updated: Instant,
}

/// Aggregated push job progress, fed from the completion handler's queue.
///
/// Owners claim a finished job's status with `take`. Anything left
/// unclaimed ages out after the retention period.
pub struct PushJobTracker {
    jobs: Mutex<BTreeMap<u64, TrackedJob>>,
    keep: Duration,
}

impl Default for PushJobTracker {
    fn default() -> Self {
        Self::new(JOB_STATUS_KEEP)
    }
}

impl PushJobTracker {
    pub fn new(keep: Duration) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            keep,
        }
    }

    pub fn apply(&self, progress: JobProgress) {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().expect("push job lock");
        let keep = self.keep;
        let before = jobs.len();
        jobs.retain(|_, job| now.duration_since(job.updated) < keep);
        if jobs.len() < before {
            tracing::debug!(evicted = before - jobs.len(), "dropped stale push job progress");
        }

        let job_id = match &progress {
            JobProgress::ReplicaFinished { job_id, .. } | JobProgress::ReplicaFailed { job_id, .. } => {
                *job_id
            }
        };
        let job = jobs.entry(job_id).or_insert_with(|| TrackedJob {
            status: JobStatus::default(),
            updated: now,
        });
        job.updated = now;
        match progress {
            JobProgress::ReplicaFinished { replica_id, .. } => {
                job.status.finished_replicas.insert(replica_id);
            }
            JobProgress::ReplicaFailed {
                job_id,
                push_type,
                tablet_id,
                message,
            } => {
                tracing::warn!(job_id, tablet_id, push_type = ?push_type, %message, "push replica failed");
                job.status.failures.push(message);
            }
        }
    }

    /// Remove and return a job's progress once its owner is done with it.
    pub fn take(&self, job_id: u64) -> Option<JobStatus> {
        self.jobs
            .lock()
            .expect("push job lock")
            .remove(&job_id)
            .map(|job| job.status)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("push job lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self, job_id: u64) -> Option<JobStatus> {
        self.jobs
            .lock()
            .expect("push job lock")
            .get(&job_id)
            .map(|job| job.status.clone())
    }

    /// Drain the progress queue until every sender is gone.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<JobProgress>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                self.apply(progress);
            }
        })
    }
}

#[derive(Debug, Error)]
enum FinishError {
    #[error("task queue full")]
    QueueFull,

    #[error("{0}")]
    Invalid(String),
}

pub struct TaskCompletionHandler {
    state_machine: Arc<TransactionStateMachine>,
    registry: Arc<TaskDispatchRegistry>,
    cluster: Arc<ClusterInfo>,
    leader: Arc<LeaderState>,
    wake: Arc<Notify>,
    job_progress: mpsc::Sender<JobProgress>,
}

impl TaskCompletionHandler {
    pub fn new(
        state_machine: Arc<TransactionStateMachine>,
        registry: Arc<TaskDispatchRegistry>,
        cluster: Arc<ClusterInfo>,
        leader: Arc<LeaderState>,
        wake: Arc<Notify>,
        job_progress: mpsc::Sender<JobProgress>,
    ) -> Self {
        Self {
            state_machine,
            registry,
            cluster,
            leader,
            wake,
            job_progress,
        }
    }

    pub fn finish_task(&self, req: FinishTaskRequest) -> TaskResult {
        match self.leader.role() {
            LeaderRole::Leader => {}
            LeaderRole::Follower {
                leader_addr: Some(addr),
            } => {
                return TaskResult::error(
                    StatusCode::LeaderTransferred,
                    format!("leader transferred to {addr}"),
                );
            }
            LeaderRole::Follower { leader_addr: None } => {
                return TaskResult::error(StatusCode::InternalError, "current node is not leader");
            }
        }
        if !self.cluster.contains(req.worker_id) {
            tracing::warn!(worker_id = req.worker_id, task_type = ?req.task_type, "report from unknown worker");
            return TaskResult::error(StatusCode::Cancelled, "backend not exist");
        }
        if let Some(version) = req.report_version {
            self.cluster.record_report_version(req.worker_id, version);
        }

        let key = TaskKey {
            worker_id: req.worker_id,
            task_type: req.task_type,
            signature: req.signature,
        };
        let Some(task) = self.registry.get_task(key) else {
            if !req.task_type.missing_is_expected() {
                tracing::warn!(
                    worker_id = req.worker_id,
                    task_type = ?req.task_type,
                    signature = req.signature,
                    "finished task not found"
                );
            }
            return TaskResult::ok();
        };

        let failed = !req.status.is_ok();
        if failed {
            let message = req.error_msgs.join("; ");
            tracing::warn!(
                worker_id = req.worker_id,
                task_type = ?req.task_type,
                signature = req.signature,
                %message,
                "worker reported task failure"
            );
            task.mark_failed(message, unix_time_ms());
            if !req.task_type.handles_failure() {
                return TaskResult::ok();
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(&task, &req, failed)));
        let result = match outcome {
            Ok(Ok(())) => TaskResult::ok(),
            Ok(Err(FinishError::QueueFull)) => {
                TaskResult::error(StatusCode::TooManyTasks, "task queue full")
            }
            Ok(Err(err)) => {
                tracing::warn!(key = ?key, error = %err, "finish agent task failed");
                TaskResult::error(
                    StatusCode::Cancelled,
                    format!("finish agent task error: {err}"),
                )
            }
            Err(_) => {
                tracing::error!(key = ?key, "finish agent task panicked");
                TaskResult::error(StatusCode::Cancelled, "finish agent task error")
            }
        };
        self.wake.notify_one();
        result
    }

    fn dispatch(
        &self,
        task: &Arc<AgentTask>,
        req: &FinishTaskRequest,
        failed: bool,
    ) -> Result<(), FinishError> {
        let catalog = self.state_machine.catalog();
        match &task.kind {
            TaskKind::Push {
                push_type,
                job_id,
                tablet_id,
                replica_id,
                ..
            } => {
                if failed {
                    if *push_type == PushType::Delete {
                        self.send_progress(JobProgress::ReplicaFailed {
                            job_id: *job_id,
                            push_type: *push_type,
                            tablet_id: *tablet_id,
                            message: task.error_msg().unwrap_or_default(),
                        })?;
                    }
                    self.registry.remove_task(task.key());
                    return Ok(());
                }
                let info = req
                    .finish_tablet_infos
                    .iter()
                    .find(|info| info.tablet_id == *tablet_id)
                    .ok_or_else(|| {
                        FinishError::Invalid(format!("push task on tablet {tablet_id} reported no tablet info"))
                    })?;
                catalog.update_replica(*tablet_id, task.worker_id, |replica| {
                    replica.update_version(info.version);
                    replica.row_count = info.row_count;
                });
                self.send_progress(JobProgress::ReplicaFinished {
                    job_id: *job_id,
                    push_type: *push_type,
                    tablet_id: *tablet_id,
                    replica_id: *replica_id,
                    version: info.version,
                })?;
            }
            TaskKind::PublishVersion(publish) => {
                if !failed {
                    let error_replicas: BTreeSet<ReplicaId> = req
                        .error_tablet_ids
                        .iter()
                        .filter_map(|tablet_id| catalog.replica_on(*tablet_id, task.worker_id))
                        .map(|replica| replica.id)
                        .collect();
                    for (tablet_id, version) in &req.tablet_versions {
                        catalog.update_replica(*tablet_id, task.worker_id, |replica| {
                            if *version > replica.version {
                                replica.update_version(*version);
                            }
                        });
                    }
                    self.record_first_load_rows(task, publish.txn_id, &req.tablet_row_counts);
                    publish.set_error_tablets(req.error_tablet_ids.clone());
                    publish.set_error_replicas(error_replicas);
                    publish.set_tablet_versions(req.tablet_versions.clone());
                    publish.set_finished(true);
                }
            }
            TaskKind::CreateReplica { tablet_id, .. }
            | TaskKind::Clone { tablet_id, .. }
            | TaskKind::StorageMediumMigrate { tablet_id } => {
                if !failed {
                    let reported_version = match &task.kind {
                        TaskKind::Clone { version, .. } => Some(*version),
                        _ => None,
                    };
                    if let Some(info) = req
                        .finish_tablet_infos
                        .iter()
                        .find(|info| info.tablet_id == *tablet_id)
                    {
                        catalog.update_replica(*tablet_id, task.worker_id, |replica| {
                            replica.path_hash = info.path_hash;
                            if let Some(version) = reported_version {
                                replica.update_version(info.version.max(version));
                            }
                        });
                    }
                }
            }
            TaskKind::Drop { .. }
            | TaskKind::ClearTransaction { .. }
            | TaskKind::UpdateSchema { .. }
            | TaskKind::UpdateTabletMeta { .. }
            | TaskKind::DropAutoIncrementMap { .. }
            | TaskKind::CheckConsistency { .. }
            | TaskKind::Snapshot { .. } => {}
        }
        if !failed {
            task.mark_applied();
        }
        self.registry.remove_task(task.key());
        Ok(())
    }

    fn send_progress(&self, progress: JobProgress) -> Result<(), FinishError> {
        self.job_progress.try_send(progress).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => FinishError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                FinishError::Invalid("job progress queue closed".to_string())
            }
        })
    }

    /// First-load row counts of streaming inserts feed statistics refresh.
    fn record_first_load_rows(
        &self,
        task: &AgentTask,
        txn_id: u64,
        tablet_row_counts: &BTreeMap<TabletId, u64>,
    ) {
        if tablet_row_counts.is_empty() {
            return;
        }
        let Some(txn) = self.state_machine.get_transaction(task.db_id, txn_id) else {
            return;
        };
        if txn.source_type != LoadJobSourceType::InsertStreaming {
            return;
        }
        let catalog = self.state_machine.catalog();
        let mut grouped: BTreeMap<(TableId, PartitionId), BTreeMap<TabletId, u64>> = BTreeMap::new();
        for (tablet_id, rows) in tablet_row_counts {
            let Some(meta) = catalog.tablet_meta(*tablet_id) else {
                continue;
            };
            grouped
                .entry((meta.table_id, meta.partition_id))
                .or_default()
                .insert(*tablet_id, *rows);
        }
        for ((table_id, partition_id), rows) in grouped {
            if let Err(err) = self.state_machine.set_partition_publish_stats(
                task.db_id,
                txn_id,
                table_id,
                partition_id,
                None,
                rows,
            ) {
                tracing::debug!(txn_id, error = %err, "drop first load rows");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use holo_txn::catalog::{MaterializedIndex, Partition, Replica, Table, TableKind, Tablet};
    use holo_txn::task::{PartitionVersion, PublishVersionTask, TaskState};
    use holo_txn::{Catalog, MemoryEditLog, TxnConfig};

    use crate::cluster::WorkerInfo;

    struct World {
        handler: TaskCompletionHandler,
        registry: Arc<TaskDispatchRegistry>,
        leader: Arc<LeaderState>,
        catalog: Arc<Catalog>,
        wake: Arc<Notify>,
        rx: mpsc::Receiver<JobProgress>,
    }

    fn world(queue: usize) -> World {
        let catalog = Arc::new(Catalog::new());
        catalog.create_database(1, "db");
        let tablet = Tablet::new(
            1000,
            vec![Replica::new(10001, 1, 5), Replica::new(10002, 2, 5)],
        );
        catalog.create_table(
            1,
            Table::new(10, "t", TableKind::Olap).with_partition(Partition::new(
                100,
                5,
                vec![MaterializedIndex::new(1, vec![tablet])],
            )),
        );
        let sm = Arc::new(TransactionStateMachine::new(
            catalog.clone(),
            Arc::new(MemoryEditLog::new()),
            TxnConfig::default(),
        ));
        let registry = Arc::new(TaskDispatchRegistry::new());
        let cluster = Arc::new(ClusterInfo::new());
        cluster.add_worker(WorkerInfo::new(1, "127.0.0.1", 9060));
        cluster.add_worker(WorkerInfo::new(2, "127.0.0.1", 9061));
        let leader = Arc::new(LeaderState::leader());
        let wake = Arc::new(Notify::new());
        let (tx, rx) = mpsc::channel(queue);
        let handler = TaskCompletionHandler::new(
            sm,
            registry.clone(),
            cluster,
            leader.clone(),
            wake.clone(),
            tx,
        );
        World {
            handler,
            registry,
            leader,
            catalog,
            wake,
            rx,
        }
    }

    fn publish_task(worker_id: WorkerId, txn_id: u64) -> Arc<AgentTask> {
        let payload = PublishVersionTask::new(
            txn_id,
            0,
            vec![PartitionVersion {
                table_id: 10,
                partition_id: 100,
                version: 6,
                is_double_write: false,
            }],
        );
        Arc::new(AgentTask::new(
            worker_id,
            txn_id,
            1,
            TaskKind::PublishVersion(payload),
            0,
        ))
    }

    fn push_task(worker_id: WorkerId, job_id: u64, push_type: PushType) -> Arc<AgentTask> {
        Arc::new(AgentTask::new(
            worker_id,
            job_id,
            1,
            TaskKind::Push {
                push_type,
                job_id,
                tablet_id: 1000,
                replica_id: 10000 + worker_id,
                version: 6,
            },
            0,
        ))
    }

    #[test]
    fn followers_reject_reports() {
        let w = world(8);
        w.leader.step_down(None);
        let res = w
            .handler
            .finish_task(FinishTaskRequest::new(1, TaskType::PublishVersion, 7));
        assert_eq!(res.status, StatusCode::InternalError);
        assert_eq!(res.error_msgs, vec!["current node is not leader".to_string()]);

        w.leader.step_down(Some("10.0.0.9:9020".to_string()));
        let res = w
            .handler
            .finish_task(FinishTaskRequest::new(1, TaskType::PublishVersion, 7));
        assert_eq!(res.status, StatusCode::LeaderTransferred);
    }

    #[test]
    fn unknown_worker_and_missing_task() {
        let w = world(8);
        let res = w
            .handler
            .finish_task(FinishTaskRequest::new(9, TaskType::PublishVersion, 7));
        assert_eq!(res.status, StatusCode::Cancelled);
        assert_eq!(res.error_msgs, vec!["backend not exist".to_string()]);

        let res = w
            .handler
            .finish_task(FinishTaskRequest::new(1, TaskType::PublishVersion, 7));
        assert_eq!(res, TaskResult::ok());
    }

    #[tokio::test]
    async fn publish_report_maps_error_tablets_to_replicas() {
        let w = world(8);
        let task = publish_task(2, 7);
        assert!(w.registry.add_task(task.clone()));

        let mut req = FinishTaskRequest::new(2, TaskType::PublishVersion, 7);
        req.error_tablet_ids = vec![1000];
        req.report_version = Some(42);
        assert_eq!(w.handler.finish_task(req.clone()), TaskResult::ok());

        let publish = task.publish().expect("publish payload");
        assert!(publish.is_finished());
        assert_eq!(publish.error_replicas(), BTreeSet::from([10002]));
        assert_eq!(task.state(), TaskState::Applied);
        assert!(w.registry.get_task(task.key()).is_none());
        tokio::time::timeout(Duration::from_secs(1), w.wake.notified())
            .await
            .expect("scheduler woken");

        // A duplicate report finds nothing and is still OK.
        assert_eq!(w.handler.finish_task(req), TaskResult::ok());
    }

    #[test]
    fn failures_outside_allow_list_stay_registered() {
        let w = world(8);
        let task = Arc::new(AgentTask::new(
            1,
            55,
            1,
            TaskKind::CheckConsistency {
                tablet_id: 1000,
                version: 5,
            },
            0,
        ));
        w.registry.add_task(task.clone());
        let req = FinishTaskRequest::new(1, TaskType::CheckConsistency, 55).failed("disk error");
        assert_eq!(w.handler.finish_task(req), TaskResult::ok());
        assert!(w.registry.get_task(task.key()).is_some());
        assert_eq!(task.error_msg().as_deref(), Some("disk error"));
        assert_eq!(task.failed_times(), 1);
    }

    #[test]
    fn failed_publish_is_deregistered_but_not_finished() {
        let w = world(8);
        let task = publish_task(1, 7);
        w.registry.add_task(task.clone());
        let req = FinishTaskRequest::new(1, TaskType::PublishVersion, 7).failed("tablet busy");
        assert_eq!(w.handler.finish_task(req), TaskResult::ok());
        assert!(w.registry.get_task(task.key()).is_none());
        assert!(!task.publish().expect("payload").is_finished());
        assert!(task.failed_at_ms() > 0);
    }

    #[test]
    fn push_reports_feed_job_progress() {
        let mut w = world(8);
        let load = push_task(1, 77, PushType::Load);
        w.registry.add_task(load.clone());
        let res = w
            .handler
            .finish_task(FinishTaskRequest::new(1, TaskType::RealtimePush, 77));
        assert_eq!(res.status, StatusCode::Cancelled);
        assert!(w.registry.get_task(load.key()).is_some());

        let mut req = FinishTaskRequest::new(1, TaskType::RealtimePush, 77);
        req.finish_tablet_infos = vec![TabletInfo {
            tablet_id: 1000,
            version: 6,
            row_count: 10,
            path_hash: 3,
        }];
        assert_eq!(w.handler.finish_task(req), TaskResult::ok());
        assert_eq!(w.catalog.replica_on(1000, 1).map(|r| r.version), Some(6));
        assert!(matches!(
            w.rx.try_recv(),
            Ok(JobProgress::ReplicaFinished { job_id: 77, .. })
        ));

        let delete = push_task(2, 78, PushType::Delete);
        w.registry.add_task(delete.clone());
        let req = FinishTaskRequest::new(2, TaskType::RealtimePush, 78).failed("bad predicate");
        assert_eq!(w.handler.finish_task(req), TaskResult::ok());
        assert!(w.registry.get_task(delete.key()).is_none());
        match w.rx.try_recv() {
            Ok(JobProgress::ReplicaFailed { job_id, message, .. }) => {
                assert_eq!((job_id, message.as_str()), (78, "bad predicate"));
            }
            other => panic!("unexpected progress: {other:?}"),
        }
    }

    #[test]
    fn saturated_job_queue_reports_too_many_tasks() {
        let w = world(1);
        for (worker_id, job_id) in [(1, 80), (2, 81)] {
            w.registry.add_task(push_task(worker_id, job_id, PushType::Load));
        }
        let finish = |worker_id: WorkerId, job_id: u64| {
            let mut req = FinishTaskRequest::new(worker_id, TaskType::RealtimePush, job_id);
            req.finish_tablet_infos = vec![TabletInfo {
                tablet_id: 1000,
                version: 6,
                ..TabletInfo::default()
            }];
            w.handler.finish_task(req)
        };
        assert_eq!(finish(1, 80), TaskResult::ok());
        let res = finish(2, 81);
        assert_eq!(res.status, StatusCode::TooManyTasks);
        assert_eq!(res.error_msgs, vec!["task queue full".to_string()]);
    }

    #[test]
    fn tracker_aggregates_progress() {
        let tracker = PushJobTracker::default();
        tracker.apply(JobProgress::ReplicaFinished {
            job_id: 1,
            push_type: PushType::Load,
            tablet_id: 5,
            replica_id: 50,
            version: 2,
        });
        tracker.apply(JobProgress::ReplicaFailed {
            job_id: 1,
            push_type: PushType::Load,
            tablet_id: 6,
            message: "oom".to_string(),
        });
        let status = tracker.status(1).expect("job");
        assert_eq!(status.finished_replicas, BTreeSet::from([50]));
        assert_eq!(status.failures, vec!["oom".to_string()]);

        assert_eq!(tracker.take(1), Some(status));
        assert!(tracker.status(1).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn unclaimed_jobs_age_out() {
        let tracker = PushJobTracker::new(Duration::from_millis(20));
        for job_id in 1..=5 {
            tracker.apply(JobProgress::ReplicaFinished {
                job_id,
                push_type: PushType::Load,
                tablet_id: 5,
                replica_id: 50,
                version: 2,
            });
        }
        assert_eq!(tracker.len(), 5);

        std::thread::sleep(Duration::from_millis(30));
        tracker.apply(JobProgress::ReplicaFailed {
            job_id: 9,
            push_type: PushType::Delete,
            tablet_id: 6,
            message: "disk error".to_string(),
        });
        assert_eq!(tracker.len(), 1);
        assert!(tracker.status(1).is_none());
        assert_eq!(
            tracker.status(9).map(|s| s.failures),
            Some(vec!["disk error".to_string()])
        );
    }
}

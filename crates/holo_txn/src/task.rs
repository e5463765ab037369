//! Worker task variants and the dispatch registry.
//!
//! A task is identified by `(worker, type, signature)`; publish-version tasks
//! use the transaction id as signature, so a transaction has at most one
//! publish task per worker. The registry only indexes tasks. The
//! publish scheduler keeps its own handles to the same `Arc<AgentTask>`s, so
//! a deregistered task's final state stays readable.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::{DbId, PartitionId, ReplicaId, TableId, TabletId, TxnId, Version, WorkerId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Create,
    Drop,
    RealtimePush,
    Clone,
    StorageMediumMigrate,
    PublishVersion,
    ClearTransaction,
    UpdateSchema,
    UpdateTabletMetaInfo,
    DropAutoIncrementMap,
    CheckConsistency,
    MakeSnapshot,
    ReleaseSnapshot,
    Upload,
    Download,
    Move,
    RemoteSnapshot,
    ReplicateSnapshot,
}

impl TaskType {
    /// Types whose completion report may legitimately arrive after the task
    /// was already dropped from the registry.
    pub fn missing_is_expected(self) -> bool {
        matches!(
            self,
            TaskType::Drop
                | TaskType::StorageMediumMigrate
                | TaskType::ReleaseSnapshot
                | TaskType::ClearTransaction
        )
    }

    /// Types whose failure reports are processed and deregistered instead of
    /// being left for external retry.
    pub fn handles_failure(self) -> bool {
        matches!(
            self,
            TaskType::Create
                | TaskType::RealtimePush
                | TaskType::Clone
                | TaskType::PublishVersion
                | TaskType::UpdateSchema
                | TaskType::UpdateTabletMetaInfo
                | TaskType::DropAutoIncrementMap
                | TaskType::StorageMediumMigrate
                | TaskType::MakeSnapshot
                | TaskType::Upload
                | TaskType::Download
                | TaskType::Move
                | TaskType::RemoteSnapshot
                | TaskType::ReplicateSnapshot
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushType {
    Load,
    Delete,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotOp {
    Make,
    Release,
    Upload,
    Download,
    Move,
    Remote,
    Replicate,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionVersion {
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub version: Version,
    pub is_double_write: bool,
}

/// Publish payload plus what the worker reported back.
#[derive(Debug)]
pub struct PublishVersionTask {
    pub txn_id: TxnId,
    pub commit_time: i64,
    pub partition_versions: Vec<PartitionVersion>,
    finished: AtomicBool,
    error_tablet_ids: Mutex<Vec<TabletId>>,
    error_replica_ids: Mutex<BTreeSet<ReplicaId>>,
    tablet_versions: Mutex<Vec<(TabletId, Version)>>,
}

impl PublishVersionTask {
    pub fn new(txn_id: TxnId, commit_time: i64, partition_versions: Vec<PartitionVersion>) -> Self {
        Self {
            txn_id,
            commit_time,
            partition_versions,
            finished: AtomicBool::new(false),
            error_tablet_ids: Mutex::new(Vec::new()),
            error_replica_ids: Mutex::new(BTreeSet::new()),
            tablet_versions: Mutex::new(Vec::new()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::Release);
    }

    pub fn set_error_tablets(&self, tablets: Vec<TabletId>) {
        *self.error_tablet_ids.lock().expect("publish task lock") = tablets;
    }

    pub fn error_tablets(&self) -> Vec<TabletId> {
        self.error_tablet_ids.lock().expect("publish task lock").clone()
    }

    pub fn set_error_replicas(&self, replicas: BTreeSet<ReplicaId>) {
        *self.error_replica_ids.lock().expect("publish task lock") = replicas;
    }

    pub fn error_replicas(&self) -> BTreeSet<ReplicaId> {
        self.error_replica_ids.lock().expect("publish task lock").clone()
    }

    pub fn set_tablet_versions(&self, versions: Vec<(TabletId, Version)>) {
        *self.tablet_versions.lock().expect("publish task lock") = versions;
    }

    pub fn tablet_versions(&self) -> Vec<(TabletId, Version)> {
        self.tablet_versions.lock().expect("publish task lock").clone()
    }

    /// Clear worker-reported results ahead of a re-dispatch.
    pub fn reset(&self) {
        self.set_finished(false);
        self.set_error_tablets(Vec::new());
        self.set_error_replicas(BTreeSet::new());
        self.set_tablet_versions(Vec::new());
    }
}

/// Per-kind task payload.
#[derive(Debug)]
pub enum TaskKind {
    CreateReplica {
        tablet_id: TabletId,
        replica_id: ReplicaId,
        version: Version,
    },
    Drop {
        tablet_id: TabletId,
    },
    Push {
        push_type: PushType,
        job_id: u64,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        version: Version,
    },
    Clone {
        tablet_id: TabletId,
        src_worker: WorkerId,
        version: Version,
    },
    StorageMediumMigrate {
        tablet_id: TabletId,
    },
    PublishVersion(PublishVersionTask),
    ClearTransaction {
        txn_ids: Vec<TxnId>,
    },
    UpdateSchema {
        tablet_ids: Vec<TabletId>,
    },
    UpdateTabletMeta {
        tablet_ids: Vec<TabletId>,
    },
    DropAutoIncrementMap {
        table_id: TableId,
    },
    CheckConsistency {
        tablet_id: TabletId,
        version: Version,
    },
    Snapshot {
        op: SnapshotOp,
        job_id: u64,
        tablet_id: TabletId,
    },
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::CreateReplica { .. } => TaskType::Create,
            TaskKind::Drop { .. } => TaskType::Drop,
            TaskKind::Push { .. } => TaskType::RealtimePush,
            TaskKind::Clone { .. } => TaskType::Clone,
            TaskKind::StorageMediumMigrate { .. } => TaskType::StorageMediumMigrate,
            TaskKind::PublishVersion(_) => TaskType::PublishVersion,
            TaskKind::ClearTransaction { .. } => TaskType::ClearTransaction,
            TaskKind::UpdateSchema { .. } => TaskType::UpdateSchema,
            TaskKind::UpdateTabletMeta { .. } => TaskType::UpdateTabletMetaInfo,
            TaskKind::DropAutoIncrementMap { .. } => TaskType::DropAutoIncrementMap,
            TaskKind::CheckConsistency { .. } => TaskType::CheckConsistency,
            TaskKind::Snapshot { op, .. } => match op {
                SnapshotOp::Make => TaskType::MakeSnapshot,
                SnapshotOp::Release => TaskType::ReleaseSnapshot,
                SnapshotOp::Upload => TaskType::Upload,
                SnapshotOp::Download => TaskType::Download,
                SnapshotOp::Move => TaskType::Move,
                SnapshotOp::Remote => TaskType::RemoteSnapshot,
                SnapshotOp::Replicate => TaskType::ReplicateSnapshot,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    pub signature: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Dispatched,
    Applied,
    Failed { message: String },
}

#[derive(Debug)]
pub struct AgentTask {
    pub worker_id: WorkerId,
    pub signature: u64,
    pub db_id: DbId,
    pub kind: TaskKind,
    pub created_at_ms: i64,
    state: Mutex<TaskState>,
    failed_times: AtomicU32,
    /// Last failed submission or failed report, 0 when none.
    failed_at_ms: AtomicI64,
}

impl AgentTask {
    pub fn new(worker_id: WorkerId, signature: u64, db_id: DbId, kind: TaskKind, now_ms: i64) -> Self {
        Self {
            worker_id,
            signature,
            db_id,
            kind,
            created_at_ms: now_ms,
            state: Mutex::new(TaskState::Dispatched),
            failed_times: AtomicU32::new(0),
            failed_at_ms: AtomicI64::new(0),
        }
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            worker_id: self.worker_id,
            task_type: self.task_type(),
            signature: self.signature,
        }
    }

    pub fn publish(&self) -> Option<&PublishVersionTask> {
        match &self.kind {
            TaskKind::PublishVersion(task) => Some(task),
            _ => None,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().expect("task state lock").clone()
    }

    pub fn mark_applied(&self) {
        *self.state.lock().expect("task state lock") = TaskState::Applied;
    }

    pub fn mark_failed(&self, message: impl Into<String>, now_ms: i64) {
        *self.state.lock().expect("task state lock") = TaskState::Failed {
            message: message.into(),
        };
        self.failed_times.fetch_add(1, Ordering::Relaxed);
        self.failed_at_ms.store(now_ms, Ordering::Release);
    }

    /// The worker never received the task; it stays dispatched.
    pub fn mark_submit_failed(&self, now_ms: i64) {
        self.failed_times.fetch_add(1, Ordering::Relaxed);
        self.failed_at_ms.store(now_ms, Ordering::Release);
    }

    pub fn failed_times(&self) -> u32 {
        self.failed_times.load(Ordering::Relaxed)
    }

    pub fn failed_at_ms(&self) -> i64 {
        self.failed_at_ms.load(Ordering::Acquire)
    }

    /// Put a failed task back into the dispatched state for a resend.
    pub fn reset_for_retry(&self) {
        *self.state.lock().expect("task state lock") = TaskState::Dispatched;
        self.failed_at_ms.store(0, Ordering::Release);
        if let Some(publish) = self.publish() {
            publish.reset();
        }
    }

    pub fn error_msg(&self) -> Option<String> {
        match self.state() {
            TaskState::Failed { message } => Some(message),
            _ => None,
        }
    }
}

/// Outstanding tasks indexed by worker, type and signature.
#[derive(Default)]
pub struct TaskDispatchRegistry {
    tasks: Mutex<HashMap<WorkerId, HashMap<TaskType, HashMap<u64, Arc<AgentTask>>>>>,
}

impl TaskDispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task; false if one with the same key is already present.
    pub fn add_task(&self, task: Arc<AgentTask>) -> bool {
        let mut tasks = self.tasks.lock().expect("task registry lock");
        let by_sig = tasks
            .entry(task.worker_id)
            .or_default()
            .entry(task.task_type())
            .or_default();
        if by_sig.contains_key(&task.signature) {
            return false;
        }
        by_sig.insert(task.signature, task);
        true
    }

    pub fn get_task(&self, key: TaskKey) -> Option<Arc<AgentTask>> {
        let tasks = self.tasks.lock().expect("task registry lock");
        tasks
            .get(&key.worker_id)?
            .get(&key.task_type)?
            .get(&key.signature)
            .cloned()
    }

    pub fn remove_task(&self, key: TaskKey) -> Option<Arc<AgentTask>> {
        let mut tasks = self.tasks.lock().expect("task registry lock");
        let by_type = tasks.get_mut(&key.worker_id)?;
        let by_sig = by_type.get_mut(&key.task_type)?;
        let removed = by_sig.remove(&key.signature);
        if by_sig.is_empty() {
            by_type.remove(&key.task_type);
        }
        if by_type.is_empty() {
            tasks.remove(&key.worker_id);
        }
        removed
    }

    /// Drop a transaction's publish tasks on the given workers.
    pub fn remove_publish_tasks(&self, txn_id: TxnId, workers: impl IntoIterator<Item = WorkerId>) {
        for worker_id in workers {
            self.remove_task(TaskKey {
                worker_id,
                task_type: TaskType::PublishVersion,
                signature: txn_id,
            });
        }
    }

    pub fn task_num(&self, worker_id: Option<WorkerId>, task_type: Option<TaskType>) -> usize {
        let tasks = self.tasks.lock().expect("task registry lock");
        tasks
            .iter()
            .filter(|(w, _)| worker_id.map_or(true, |id| id == **w))
            .flat_map(|(_, by_type)| by_type.iter())
            .filter(|(t, _)| task_type.map_or(true, |ty| ty == **t))
            .map(|(_, by_sig)| by_sig.len())
            .sum()
    }

    pub fn tasks_of(&self, worker_id: WorkerId) -> Vec<Arc<AgentTask>> {
        let tasks = self.tasks.lock().expect("task registry lock");
        tasks
            .get(&worker_id)
            .map(|by_type| by_type.values().flat_map(|m| m.values().cloned()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_task(worker_id: WorkerId, txn_id: TxnId) -> Arc<AgentTask> {
        Arc::new(AgentTask::new(
            worker_id,
            txn_id,
            1,
            TaskKind::PublishVersion(PublishVersionTask::new(txn_id, 0, Vec::new())),
            0,
        ))
    }

    #[test]
    fn registration_is_idempotent() {
        let registry = TaskDispatchRegistry::new();
        assert!(registry.add_task(publish_task(1, 10)));
        assert!(!registry.add_task(publish_task(1, 10)));
        assert!(registry.add_task(publish_task(2, 10)));
        assert_eq!(registry.task_num(None, Some(TaskType::PublishVersion)), 2);
        assert_eq!(registry.task_num(Some(1), None), 1);
    }

    #[test]
    fn removal_is_idempotent() {
        let registry = TaskDispatchRegistry::new();
        let task = publish_task(1, 10);
        let key = task.key();
        registry.add_task(task);
        assert!(registry.remove_task(key).is_some());
        assert!(registry.remove_task(key).is_none());
        assert!(registry.get_task(key).is_none());
        assert_eq!(registry.task_num(None, None), 0);
    }

    #[test]
    fn publish_tasks_removed_per_transaction() {
        let registry = TaskDispatchRegistry::new();
        for worker in 1..=3 {
            registry.add_task(publish_task(worker, 10));
            registry.add_task(publish_task(worker, 11));
        }
        registry.remove_publish_tasks(10, 1..=3);
        assert_eq!(registry.task_num(None, None), 3);
        assert!(registry
            .tasks_of(2)
            .iter()
            .all(|t| t.signature == 11));
    }

    #[test]
    fn retry_resets_reported_state() {
        let task = publish_task(1, 10);
        let publish = task.publish().expect("publish payload");
        publish.set_error_tablets(vec![5]);
        publish.set_finished(true);
        task.mark_failed("disk error", 100);
        assert_eq!(task.error_msg().as_deref(), Some("disk error"));
        assert_eq!(task.failed_at_ms(), 100);

        task.reset_for_retry();
        assert_eq!(task.state(), TaskState::Dispatched);
        assert!(!publish.is_finished());
        assert!(publish.error_tablets().is_empty());
        assert_eq!(task.failed_times(), 1);
    }

    #[test]
    fn failure_allow_list() {
        assert!(TaskType::PublishVersion.handles_failure());
        assert!(TaskType::RealtimePush.handles_failure());
        assert!(!TaskType::Drop.handles_failure());
        assert!(!TaskType::ClearTransaction.handles_failure());
        assert!(TaskType::Drop.missing_is_expected());
        assert!(!TaskType::PublishVersion.missing_is_expected());
    }
}

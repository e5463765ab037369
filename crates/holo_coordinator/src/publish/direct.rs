//! Direct (shared-nothing) publish.
//!
//! Each committed transaction gets one publish-version task per worker that
//! holds a replica of a touched tablet. The task signature is the txn id.
//! Reports come back through the completion handler; this module only
//! dispatches, resends, and decides when a transaction can finish.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use holo_txn::task::{PartitionVersion, PublishVersionTask};
use holo_txn::txn::PUBLISH_RETRY_INTERVAL_MS;
use holo_txn::{
    unix_time_ms, AgentTask, DbId, ReplicaId, TaskKind, TransactionState, TxnId, WorkerId,
};

use super::PublishScheduler;
use crate::config::PublishConfig;

struct DirectPublishTracker {
    db_id: DbId,
    tasks: BTreeMap<WorkerId, Arc<AgentTask>>,
    last_send_ms: i64,
}

#[derive(Default)]
pub(super) struct DirectPublishState {
    trackers: Mutex<HashMap<TxnId, DirectPublishTracker>>,
}

impl DirectPublishState {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TxnId, DirectPublishTracker>> {
        self.trackers.lock().expect("direct publish lock")
    }
}

/// What the finish phase learned from a transaction's tasks.
struct TaskSummary {
    all_finished: bool,
    error_replicas: BTreeSet<ReplicaId>,
    unfinished_workers: BTreeSet<WorkerId>,
}

fn summarize(tasks: &BTreeMap<WorkerId, Arc<AgentTask>>) -> TaskSummary {
    let mut summary = TaskSummary {
        all_finished: true,
        error_replicas: BTreeSet::new(),
        unfinished_workers: BTreeSet::new(),
    };
    for (worker_id, task) in tasks {
        match task.publish() {
            Some(publish) if publish.is_finished() => {
                summary.error_replicas.extend(publish.error_replicas());
            }
            _ => {
                summary.all_finished = false;
                summary.unfinished_workers.insert(*worker_id);
            }
        }
    }
    summary
}

impl PublishScheduler {
    pub(super) fn publish_direct(&self, ready: Vec<TransactionState>, cfg: PublishConfig) {
        let now = unix_time_ms();
        self.drop_stale_trackers(&ready);

        let mut outgoing: BTreeMap<WorkerId, Vec<Arc<AgentTask>>> = BTreeMap::new();
        for txn in &ready {
            let resend = {
                let trackers = self.direct.lock();
                trackers.get(&txn.txn_id).map(|tracker| {
                    tracker
                        .tasks
                        .values()
                        .filter(|task| {
                            let failed_at = task.failed_at_ms();
                            failed_at > 0 && now - failed_at >= PUBLISH_RETRY_INTERVAL_MS
                        })
                        .cloned()
                        .collect::<Vec<_>>()
                })
            };
            match resend {
                Some(tasks) => {
                    for task in tasks {
                        tracing::debug!(
                            txn_id = txn.txn_id,
                            worker_id = task.worker_id,
                            failed_times = task.failed_times(),
                            "resending publish task"
                        );
                        task.reset_for_retry();
                        self.registry.add_task(task.clone());
                        outgoing.entry(task.worker_id).or_default().push(task);
                    }
                }
                None => {
                    let tasks = self.create_publish_tasks(txn, now);
                    for task in tasks.values() {
                        self.registry.add_task(task.clone());
                        outgoing.entry(task.worker_id).or_default().push(task.clone());
                    }
                    tracing::debug!(txn_id = txn.txn_id, workers = tasks.len(), "dispatching publish tasks");
                    self.direct.lock().insert(
                        txn.txn_id,
                        DirectPublishTracker {
                            db_id: txn.db_id,
                            tasks,
                            last_send_ms: now,
                        },
                    );
                }
            }
        }
        self.submit(outgoing);

        for txn in &ready {
            self.try_finish_direct(txn, now, &cfg);
        }
    }

    fn drop_stale_trackers(&self, ready: &[TransactionState]) {
        let ready_ids: HashSet<TxnId> = ready.iter().map(|t| t.txn_id).collect();
        let stale: Vec<(TxnId, DirectPublishTracker)> = {
            let mut trackers = self.direct.lock();
            let ids: Vec<TxnId> = trackers
                .keys()
                .filter(|id| !ready_ids.contains(id))
                .copied()
                .collect();
            ids.into_iter()
                .filter_map(|id| trackers.remove(&id).map(|t| (id, t)))
                .collect()
        };
        for (txn_id, tracker) in stale {
            tracing::debug!(txn_id, db_id = tracker.db_id, "dropping publish tracker of settled txn");
            self.registry
                .remove_publish_tasks(txn_id, tracker.tasks.keys().copied());
        }
    }

    fn create_publish_tasks(&self, txn: &TransactionState, now: i64) -> BTreeMap<WorkerId, Arc<AgentTask>> {
        let mut workers = BTreeSet::new();
        let mut partition_versions = Vec::new();
        if let Some(db) = self.state_machine.catalog().get_db(txn.db_id) {
            let meta = db.read();
            for (table_id, info) in txn.partition_commit_infos() {
                partition_versions.push(PartitionVersion {
                    table_id,
                    partition_id: info.partition_id,
                    version: info.version,
                    is_double_write: info.is_double_write,
                });
                let Some(partition) = meta.partition(table_id, info.partition_id) else {
                    continue;
                };
                let (normal, shadow) = partition.tablets_for_txn(txn.txn_id);
                for tablet in normal.into_iter().chain(shadow) {
                    workers.extend(tablet.replicas.iter().map(|r| r.backend_id));
                }
            }
        }

        workers
            .into_iter()
            .map(|worker_id| {
                let task = AgentTask::new(
                    worker_id,
                    txn.txn_id,
                    txn.db_id,
                    TaskKind::PublishVersion(PublishVersionTask::new(
                        txn.txn_id,
                        txn.commit_time,
                        partition_versions.clone(),
                    )),
                    now,
                );
                (worker_id, Arc::new(task))
            })
            .collect()
    }

    fn submit(&self, outgoing: BTreeMap<WorkerId, Vec<Arc<AgentTask>>>) {
        for (worker_id, tasks) in outgoing {
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(err) = client.submit_tasks(worker_id, tasks.clone()).await {
                    tracing::warn!(worker_id, tasks = tasks.len(), error = %err, "submit publish tasks failed");
                    let now = unix_time_ms();
                    for task in &tasks {
                        task.mark_submit_failed(now);
                    }
                }
            });
        }
    }

    fn try_finish_direct(&self, txn: &TransactionState, now: i64, cfg: &PublishConfig) {
        let Some(tasks) = self
            .direct
            .lock()
            .get(&txn.txn_id)
            .map(|tracker| tracker.tasks.clone())
        else {
            return;
        };
        let summary = summarize(&tasks);

        let waited_ms = now - txn.commit_time;
        let can_finish = summary.all_finished
            || (waited_ms > cfg.quorum_wait_ms
                && self.state_machine.can_txn_finish(
                    txn,
                    &summary.error_replicas,
                    &summary.unfinished_workers,
                ));
        if !can_finish {
            return;
        }
        if !self.state_machine.publish_order_satisfied(txn) {
            tracing::debug!(txn_id = txn.txn_id, "waiting for earlier versions to become visible");
            return;
        }

        match self.state_machine.finish_transaction(
            txn.db_id,
            txn.txn_id,
            &summary.error_replicas,
            &summary.unfinished_workers,
        ) {
            Ok(()) => {
                self.registry
                    .remove_publish_tasks(txn.txn_id, tasks.keys().copied());
                self.direct.lock().remove(&txn.txn_id);
            }
            Err(err) => {
                let last_send_ms = {
                    let mut trackers = self.direct.lock();
                    trackers.get_mut(&txn.txn_id).map(|tracker| {
                        std::mem::replace(&mut tracker.last_send_ms, now)
                    })
                };
                if self.should_warn(&format!("finish-{}", txn.txn_id)) {
                    tracing::warn!(
                        txn_id = txn.txn_id,
                        db_id = txn.db_id,
                        waited_ms,
                        last_send_ms = ?last_send_ms,
                        unfinished_workers = ?summary.unfinished_workers,
                        error = %err,
                        "finish transaction failed, retrying"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holo_txn::task::TaskState;

    fn publish_task(worker_id: WorkerId) -> Arc<AgentTask> {
        Arc::new(AgentTask::new(
            worker_id,
            7,
            1,
            TaskKind::PublishVersion(PublishVersionTask::new(7, 0, Vec::new())),
            0,
        ))
    }

    #[test]
    fn summary_splits_finished_and_unfinished_workers() {
        let mut tasks = BTreeMap::new();
        for worker_id in 1..=3 {
            tasks.insert(worker_id, publish_task(worker_id));
        }
        let finished = tasks[&1].publish().expect("publish task");
        finished.set_error_replicas(BTreeSet::from([11]));
        finished.set_finished(true);
        tasks[&2].publish().expect("publish task").set_finished(true);
        tasks[&3].mark_failed("disk error", 5);

        let summary = summarize(&tasks);
        assert!(!summary.all_finished);
        assert_eq!(summary.error_replicas, BTreeSet::from([11]));
        assert_eq!(summary.unfinished_workers, BTreeSet::from([3]));
        assert!(matches!(tasks[&3].state(), TaskState::Failed { .. }));
    }

    #[test]
    fn no_tasks_counts_as_finished() {
        let summary = summarize(&BTreeMap::new());
        assert!(summary.all_finished);
        assert!(summary.unfinished_workers.is_empty());
    }
}

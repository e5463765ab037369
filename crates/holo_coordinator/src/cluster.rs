//! Worker membership as seen by the coordinator.

use std::collections::BTreeMap;
use std::sync::RwLock;

use holo_txn::WorkerId;
use serde::{Deserialize, Serialize};

/// Worker liveness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerState {
    Alive,
    Dead,
    Decommissioned,
}

/// Storage worker descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub host: String,
    pub port: u16,
    pub state: WorkerState,
    /// Last report version the worker acknowledged in a task report.
    pub report_version: i64,
}

impl WorkerInfo {
    pub fn new(worker_id: WorkerId, host: impl Into<String>, port: u16) -> Self {
        Self {
            worker_id,
            host: host.into(),
            port,
            state: WorkerState::Alive,
            report_version: 0,
        }
    }
}

#[derive(Default, Debug)]
pub struct ClusterInfo {
    workers: RwLock<BTreeMap<WorkerId, WorkerInfo>>,
}

impl ClusterInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, info: WorkerInfo) {
        tracing::info!(worker_id = info.worker_id, host = %info.host, "worker added");
        self.workers.write().unwrap().insert(info.worker_id, info);
    }

    pub fn remove_worker(&self, worker_id: WorkerId) -> Option<WorkerInfo> {
        let removed = self.workers.write().unwrap().remove(&worker_id);
        if removed.is_some() {
            tracing::info!(worker_id, "worker removed");
        }
        removed
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> Option<WorkerInfo> {
        self.workers.read().unwrap().get(&worker_id).cloned()
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.read().unwrap().contains_key(&worker_id)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().unwrap().is_empty()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.read().unwrap().keys().copied().collect()
    }

    pub fn alive_worker_ids(&self) -> Vec<WorkerId> {
        self.workers
            .read()
            .unwrap()
            .values()
            .filter(|w| w.state == WorkerState::Alive)
            .map(|w| w.worker_id)
            .collect()
    }

    pub fn set_state(&self, worker_id: WorkerId, state: WorkerState) -> bool {
        let mut workers = self.workers.write().unwrap();
        let Some(worker) = workers.get_mut(&worker_id) else {
            return false;
        };
        if worker.state != state {
            tracing::info!(worker_id, from = ?worker.state, to = ?state, "worker state changed");
            worker.state = state;
        }
        true
    }

    /// Keep the highest report version seen from the worker.
    pub fn record_report_version(&self, worker_id: WorkerId, version: i64) {
        if let Some(worker) = self.workers.write().unwrap().get_mut(&worker_id) {
            worker.report_version = worker.report_version.max(version);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_tracks_state_and_report_versions() {
        let cluster = ClusterInfo::new();
        cluster.add_worker(WorkerInfo::new(1, "10.0.0.1", 9060));
        cluster.add_worker(WorkerInfo::new(2, "10.0.0.2", 9060));
        assert!(cluster.set_state(2, WorkerState::Dead));
        assert!(!cluster.set_state(9, WorkerState::Dead));
        assert_eq!(cluster.alive_worker_ids(), vec![1]);
        assert_eq!(cluster.worker_ids(), vec![1, 2]);

        cluster.record_report_version(1, 7);
        cluster.record_report_version(1, 3);
        assert_eq!(cluster.get_worker(1).map(|w| w.report_version), Some(7));

        assert!(cluster.remove_worker(2).is_some());
        assert!(!cluster.contains(2));
    }
}

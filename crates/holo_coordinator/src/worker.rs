//! Coordinator → worker RPC contract.
//!
//! The publish scheduler is transport-agnostic; a deployment plugs in a
//! network client, the standalone binary and the tests use `LocalFleet`.
//! Per-tablet failures travel inside responses; an `Err` means the RPC as a
//! whole did not complete.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use holo_txn::txn::TxnInfo;
use holo_txn::{AgentTask, PartitionId, TabletId, TxnId, Version, WorkerId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerRpcError {
    #[error("worker {0} unreachable")]
    Unreachable(WorkerId),

    #[error("worker {0} rpc timed out")]
    Timeout(WorkerId),

    #[error("worker {worker_id} rejected request: {message}")]
    Rejected { worker_id: WorkerId, message: String },
}

/// Apply `txn_infos` to lake tablets, moving them from `base_version` to
/// `new_version`.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishVersionRequest {
    pub tablet_ids: Vec<TabletId>,
    pub txn_infos: Vec<TxnInfo>,
    pub base_version: Version,
    pub new_version: Version,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishVersionResponse {
    pub compaction_scores: BTreeMap<TabletId, f64>,
    pub tablet_row_nums: BTreeMap<TabletId, u64>,
    pub failed_tablets: Vec<TabletId>,
}

/// Record txn logs against shadow-index tablets without applying them.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishLogVersionRequest {
    pub tablet_ids: Vec<TabletId>,
    pub txn_infos: Vec<TxnInfo>,
    pub versions: Vec<Version>,
}

/// Remove txn logs after a batch became visible. Combined logs are
/// addressed per partition through `txn_infos`; normal logs per tablet.
#[derive(Clone, Debug, PartialEq)]
pub struct DeleteTxnLogRequest {
    pub partition_id: PartitionId,
    pub tablet_ids: Vec<TabletId>,
    pub txn_ids: Vec<TxnId>,
    pub txn_infos: Vec<TxnInfo>,
}

#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// Hand agent tasks to a worker. Completion arrives later through the
    /// task completion handler.
    async fn submit_tasks(
        &self,
        worker_id: WorkerId,
        tasks: Vec<Arc<AgentTask>>,
    ) -> Result<(), WorkerRpcError>;

    async fn publish_version(
        &self,
        worker_id: WorkerId,
        req: PublishVersionRequest,
    ) -> Result<PublishVersionResponse, WorkerRpcError>;

    async fn publish_log_version(
        &self,
        worker_id: WorkerId,
        req: PublishLogVersionRequest,
    ) -> Result<(), WorkerRpcError>;

    async fn delete_txn_log(
        &self,
        worker_id: WorkerId,
        req: DeleteTxnLogRequest,
    ) -> Result<(), WorkerRpcError>;
}

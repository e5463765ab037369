//! Client-facing transaction RPCs.
//!
//! Only the leader mutates transaction state. A follower forwards the
//! request verbatim through a `LeaderForwarder` and relays the leader's
//! answer; a forwarding failure becomes INTERNAL_ERROR.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use holo_txn::txn::{LoadJobSourceType, TabletCommitInfo, TxnCommitAttachment, TxnCoordinator};
use holo_txn::{
    BeginRequest, DbId, StatusCode, TableId, TransactionStateMachine, TxnError, TxnId,
};
use serde::{Deserialize, Serialize};

const FORWARD_FAILED: &str = "forward request to leader failed";
const COMMIT_TIMEOUT_MSG: &str = "commit and publish txn timeout";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderRole {
    Leader,
    /// `leader_addr` is known once leadership moved to another node.
    Follower { leader_addr: Option<String> },
}

#[derive(Debug)]
pub struct LeaderState {
    role: RwLock<LeaderRole>,
}

impl LeaderState {
    pub fn leader() -> Self {
        Self {
            role: RwLock::new(LeaderRole::Leader),
        }
    }

    pub fn follower(leader_addr: Option<String>) -> Self {
        Self {
            role: RwLock::new(LeaderRole::Follower { leader_addr }),
        }
    }

    pub fn role(&self) -> LeaderRole {
        self.role.read().unwrap().clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(*self.role.read().unwrap(), LeaderRole::Leader)
    }

    pub fn step_down(&self, leader_addr: Option<String>) {
        tracing::info!(leader_addr = ?leader_addr, "stepping down from leader");
        *self.role.write().unwrap() = LeaderRole::Follower { leader_addr };
    }

    pub fn become_leader(&self) {
        tracing::info!("became leader");
        *self.role.write().unwrap() = LeaderRole::Leader;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeginRemoteTxnRequest {
    pub db_id: DbId,
    pub table_ids: Vec<TableId>,
    pub label: String,
    #[serde(default)]
    pub request_id: Option<String>,
    pub source_type: LoadJobSourceType,
    pub timeout_ms: i64,
    /// Host of the requesting frontend.
    pub coordinator_host: String,
    #[serde(default)]
    pub use_combined_txn_log: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeginRemoteTxnResponse {
    pub status: StatusCode,
    pub error_msgs: Vec<String>,
    pub txn_id: TxnId,
    pub txn_label: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitRemoteTxnRequest {
    pub db_id: DbId,
    pub txn_id: TxnId,
    pub commit_infos: Vec<TabletCommitInfo>,
    #[serde(default)]
    pub fail_infos: Vec<TabletCommitInfo>,
    /// Overrides the service default bound on the visibility wait.
    #[serde(default)]
    pub commit_timeout_ms: Option<u64>,
    #[serde(default)]
    pub attachment: Option<TxnCommitAttachment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteTxnResponse {
    pub status: StatusCode,
    pub error_msgs: Vec<String>,
}

impl RemoteTxnResponse {
    fn ok() -> Self {
        Self {
            status: StatusCode::Ok,
            error_msgs: Vec::new(),
        }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error_msgs: vec![message.into()],
        }
    }

    fn from_txn_error(err: &TxnError) -> Self {
        Self::error(err.status_code(), err.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbortRemoteTxnRequest {
    pub db_id: DbId,
    pub txn_id: TxnId,
    pub error_msg: String,
}

/// Carries a client request to the current leader.
#[async_trait]
pub trait LeaderForwarder: Send + Sync + 'static {
    async fn begin_remote_txn(
        &self,
        req: BeginRemoteTxnRequest,
    ) -> anyhow::Result<BeginRemoteTxnResponse>;

    async fn commit_remote_txn(
        &self,
        req: CommitRemoteTxnRequest,
    ) -> anyhow::Result<RemoteTxnResponse>;

    async fn abort_remote_txn(
        &self,
        req: AbortRemoteTxnRequest,
    ) -> anyhow::Result<RemoteTxnResponse>;
}

pub struct LeaderService {
    state_machine: Arc<TransactionStateMachine>,
    leader: Arc<LeaderState>,
    forwarder: Option<Arc<dyn LeaderForwarder>>,
    commit_timeout: Duration,
}

impl LeaderService {
    pub fn new(
        state_machine: Arc<TransactionStateMachine>,
        leader: Arc<LeaderState>,
        forwarder: Option<Arc<dyn LeaderForwarder>>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            state_machine,
            leader,
            forwarder,
            commit_timeout,
        }
    }

    pub async fn begin_remote_txn(&self, req: BeginRemoteTxnRequest) -> BeginRemoteTxnResponse {
        if !self.leader.is_leader() {
            let label = req.label.clone();
            return match &self.forwarder {
                Some(forwarder) => match forwarder.begin_remote_txn(req).await {
                    Ok(resp) => resp,
                    Err(err) => {
                        tracing::warn!(error = ?err, label = %label, "forward begin txn failed");
                        begin_error(StatusCode::InternalError, FORWARD_FAILED, label)
                    }
                },
                None => begin_error(StatusCode::InternalError, FORWARD_FAILED, label),
            };
        }

        if req.label.is_empty() {
            return begin_error(StatusCode::InternalError, "missing label", req.label);
        }
        let label = req.label.clone();
        let begin = BeginRequest {
            db_id: req.db_id,
            table_ids: req.table_ids,
            label: req.label,
            request_id: req.request_id,
            coordinator: TxnCoordinator::fe(req.coordinator_host),
            source_type: req.source_type,
            timeout_ms: req.timeout_ms,
            callback_id: None,
            use_combined_txn_log: req.use_combined_txn_log,
        };
        match self.state_machine.begin_transaction(begin) {
            Ok(txn_id) => BeginRemoteTxnResponse {
                status: StatusCode::Ok,
                error_msgs: Vec::new(),
                txn_id,
                txn_label: label,
            },
            Err(err) => {
                tracing::warn!(label = %label, error = %err, "begin remote txn failed");
                begin_error(err.status_code(), err.to_string(), label)
            }
        }
    }

    /// Commit and wait, bounded, for the transaction to become visible. A
    /// timeout leaves the commit in place.
    pub async fn commit_remote_txn(&self, req: CommitRemoteTxnRequest) -> RemoteTxnResponse {
        if !self.leader.is_leader() {
            let txn_id = req.txn_id;
            return match &self.forwarder {
                Some(forwarder) => forwarder
                    .commit_remote_txn(req)
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(error = ?err, txn_id, "forward commit txn failed");
                        RemoteTxnResponse::error(StatusCode::InternalError, FORWARD_FAILED)
                    }),
                None => RemoteTxnResponse::error(StatusCode::InternalError, FORWARD_FAILED),
            };
        }

        let timeout = req
            .commit_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.commit_timeout);
        let visible = self
            .state_machine
            .commit_and_publish(
                req.db_id,
                req.txn_id,
                &req.commit_infos,
                &req.fail_infos,
                req.attachment,
                timeout,
            )
            .await;
        match visible {
            Ok(true) => RemoteTxnResponse::ok(),
            Ok(false) => {
                tracing::info!(txn_id = req.txn_id, timeout_ms = timeout.as_millis() as u64, "remote commit not yet visible");
                RemoteTxnResponse::error(StatusCode::Timeout, COMMIT_TIMEOUT_MSG)
            }
            Err(err) => {
                tracing::warn!(txn_id = req.txn_id, error = %err, "commit remote txn failed");
                RemoteTxnResponse::from_txn_error(&err)
            }
        }
    }

    pub async fn abort_remote_txn(&self, req: AbortRemoteTxnRequest) -> RemoteTxnResponse {
        if !self.leader.is_leader() {
            let txn_id = req.txn_id;
            return match &self.forwarder {
                Some(forwarder) => forwarder
                    .abort_remote_txn(req)
                    .await
                    .unwrap_or_else(|err| {
                        tracing::warn!(error = ?err, txn_id, "forward abort txn failed");
                        RemoteTxnResponse::error(StatusCode::InternalError, FORWARD_FAILED)
                    }),
                None => RemoteTxnResponse::error(StatusCode::InternalError, FORWARD_FAILED),
            };
        }
        match self
            .state_machine
            .abort_transaction(req.db_id, req.txn_id, &req.error_msg)
        {
            Ok(()) => RemoteTxnResponse::ok(),
            Err(err) => RemoteTxnResponse::from_txn_error(&err),
        }
    }
}

fn begin_error(status: StatusCode, message: impl Into<String>, label: String) -> BeginRemoteTxnResponse {
    BeginRemoteTxnResponse {
        status,
        error_msgs: vec![message.into()],
        txn_id: 0,
        txn_label: label,
    }
}

//! Error and status taxonomy shared by the coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::txn::TxnStatus;
use crate::{DbId, PartitionId, TableId, TabletId, TxnId, Version};

pub type TxnResult<T> = Result<T, TxnError>;

/// Status codes returned to workers and clients.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    NotFound,
    InternalError,
    Timeout,
    TooManyTasks,
    Cancelled,
    LeaderTransferred,
}

impl StatusCode {
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("database {0} does not exist")]
    DbNotFound(DbId),
    #[error("table {table_id} does not exist in database {db_id}")]
    TableNotFound { db_id: DbId, table_id: TableId },
    #[error("transaction {txn_id} not found in database {db_id}")]
    TxnNotFound { db_id: DbId, txn_id: TxnId },
    #[error("label {label} has already been used by transaction {txn_id} ({status:?})")]
    LabelAlreadyUsed {
        label: String,
        txn_id: TxnId,
        status: TxnStatus,
    },
    #[error("transaction {txn_id} cannot move from {from:?} to {to:?}")]
    IllegalStateTransition {
        txn_id: TxnId,
        from: TxnStatus,
        to: TxnStatus,
    },
    #[error("transaction {txn_id} was aborted: {reason}")]
    TxnAborted { txn_id: TxnId, reason: String },
    #[error("callback {callback_id} of transaction {txn_id} is missing")]
    CallbackMissing { txn_id: TxnId, callback_id: u64 },
    #[error("callback rejected transaction {txn_id}: {message}")]
    CallbackFailed { txn_id: TxnId, message: String },
    #[error(
        "partition {partition_id} visible version {visible} does not precede publish version {version}"
    )]
    VersionGap {
        partition_id: PartitionId,
        visible: Version,
        version: Version,
    },
    #[error("partition {partition_id} versions are not contiguous: {prev} followed by {next}")]
    BatchNotContiguous {
        partition_id: PartitionId,
        prev: Version,
        next: Version,
    },
    #[error("invalid publish batch: {0}")]
    InvalidBatch(String),
    #[error("tablet {tablet_id} has {healthy} healthy replicas, quorum is {quorum}")]
    QuorumNotMet {
        tablet_id: TabletId,
        healthy: usize,
        quorum: usize,
    },
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("too many pending tasks")]
    TooManyTasks,
    #[error("journal write failed: {0}")]
    Journal(String),
}

impl TxnError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TxnError::DbNotFound(_)
            | TxnError::TableNotFound { .. }
            | TxnError::TxnNotFound { .. } => StatusCode::NotFound,
            TxnError::TooManyTasks => StatusCode::TooManyTasks,
            _ => StatusCode::InternalError,
        }
    }
}

impl From<anyhow::Error> for TxnError {
    fn from(err: anyhow::Error) -> Self {
        TxnError::Journal(format!("{err:#}"))
    }
}

//! Transaction bookkeeping for the holo commit and publish coordinator.
//!
//! This crate owns the durable half of the protocol:
//! - `txn`: the transaction record and its commit graph
//! - `batch`: contiguous groups of committed transactions on one table
//! - `ledger`: per-transaction replica error/unknown bookkeeping
//! - `task`: worker task variants and the dispatch registry
//! - `catalog`: the minimal metadata model the coordinator reads and writes
//! - `journal`: the edit log transaction state is persisted through
//! - `state_machine`: the lifecycle driver tying all of the above together
//!
//! The async scheduling half (publish strategies, completion reports,
//! client RPCs) lives in `holo_coordinator`.

pub mod batch;
pub mod callback;
pub mod catalog;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod state_machine;
pub mod task;
pub mod txn;
pub mod warn;

use std::time::{SystemTime, UNIX_EPOCH};

pub use batch::{PartitionPublishVersionData, TransactionStateBatch};
pub use callback::TxnStateChangeCallback;
pub use catalog::Catalog;
pub use error::{StatusCode, TxnError, TxnResult};
pub use journal::{EditLog, FileEditLog, JournalEntry, MemoryEditLog};
pub use ledger::ReplicaVersionLedger;
pub use state_machine::{BeginRequest, TransactionStateMachine, TxnConfig};
pub use task::{AgentTask, TaskDispatchRegistry, TaskKey, TaskKind, TaskType};
pub use txn::{TransactionState, TxnStatus};

pub type DbId = u64;
pub type TableId = u64;
pub type PartitionId = u64;
pub type IndexId = u64;
pub type TabletId = u64;
pub type ReplicaId = u64;
pub type WorkerId = u64;
pub type TxnId = u64;
pub type Version = i64;

/// Wall clock in epoch milliseconds.
///
/// Signed because partition publish outcomes are encoded in the sign of a
/// timestamp.
pub fn unix_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

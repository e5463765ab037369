//! Commit and version-publish coordinator.
//!
//! Drives committed `holo_txn` transactions to visibility across a fleet of
//! storage workers:
//! - `publish`: the scheduler with its direct and lake strategies
//! - `completion`: worker task reports
//! - `leader`: client transaction RPCs and follower forwarding
//! - `worker`: the coordinator → worker RPC contract
//! - `sim`: an in-process worker fleet
//! - `node`: wiring and the node runtime

pub mod cluster;
pub mod completion;
pub mod config;
pub mod leader;
pub mod node;
pub mod publish;
pub mod sim;
pub mod worker;

pub use cluster::{ClusterInfo, WorkerInfo, WorkerState};
pub use completion::{FinishTaskRequest, TaskCompletionHandler, TaskResult};
pub use config::{CoordinatorArgs, CoordinatorConfig, PublishConfig, RunMode, SweepConfig};
pub use leader::{LeaderForwarder, LeaderService, LeaderState};
pub use node::{run_node, run_node_with_shutdown, Coordinator, CoordinatorTasks};
pub use publish::PublishScheduler;
pub use sim::LocalFleet;
pub use worker::{WorkerClient, WorkerRpcError};

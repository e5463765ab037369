//! Command line and environment configuration.
//!
//! `CoordinatorArgs` is the clap surface; the runtime only sees the plain
//! `Copy` structs derived from it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use holo_txn::TxnConfig;

/// Default size of the lake publish executor.
pub const DEFAULT_LAKE_PUBLISH_THREADS: usize = 512;
/// Default size of the txn-log cleanup executor.
pub const DEFAULT_TXNLOG_CLEANUP_THREADS: usize = 16;

/// Storage architecture of the cluster, selecting the publish strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RunMode {
    /// Tablets replicated on worker local disks; publish per replica.
    #[default]
    SharedNothing,
    /// Tablets on shared storage; publish per partition through one worker.
    SharedData,
}

/// Publish scheduler knobs.
#[derive(Clone, Copy, Debug)]
pub struct PublishConfig {
    pub interval: Duration,
    /// Finish on a quorum once a txn has waited this long after commit.
    pub quorum_wait_ms: i64,
    pub run_mode: RunMode,
    pub lake_batch_publish: bool,
    pub lake_batch_max_txns: usize,
    /// Raw requested executor size. Invalid values fall back to the default.
    pub lake_publish_threads: i64,
    pub lake_txnlog_cleanup_threads: i64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(10),
            quorum_wait_ms: 5_000,
            run_mode: RunMode::SharedNothing,
            lake_batch_publish: false,
            lake_batch_max_txns: 10,
            lake_publish_threads: DEFAULT_LAKE_PUBLISH_THREADS as i64,
            lake_txnlog_cleanup_threads: DEFAULT_TXNLOG_CLEANUP_THREADS as i64,
        }
    }
}

impl PublishConfig {
    pub fn uses_lake_batches(&self) -> bool {
        self.run_mode == RunMode::SharedData && self.lake_batch_publish
    }
}

/// Timeout/expiry sweeper knobs.
#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1_000),
        }
    }
}

/// Everything a `Coordinator` needs besides its collaborators.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorConfig {
    pub publish: PublishConfig,
    pub txn: TxnConfig,
    pub sweep: SweepConfig,
    /// Default bound on commit-and-publish waits of remote commits.
    pub commit_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            publish: PublishConfig::default(),
            txn: TxnConfig::default(),
            sweep: SweepConfig::default(),
            commit_timeout: Duration::from_secs(30),
        }
    }
}

/// CLI options for running a coordinator node.
#[derive(Parser, Debug, Clone)]
pub struct CoordinatorArgs {
    #[arg(long)]
    pub node_id: u64,

    /// Directory holding the transaction journal.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// fsync the journal after every append.
    #[arg(long, env = "HOLO_JOURNAL_SYNC", default_value_t = true, action = clap::ArgAction::Set)]
    pub journal_sync: bool,

    #[arg(long, env = "HOLO_RUN_MODE", value_enum, default_value = "shared-nothing")]
    pub run_mode: RunMode,

    /// Publish scheduler polling interval.
    #[arg(long, env = "HOLO_PUBLISH_VERSION_INTERVAL_MS", default_value_t = 10)]
    pub publish_version_interval_ms: u64,

    /// How long direct publish waits for every replica before settling for a
    /// quorum.
    #[arg(long, env = "HOLO_QUORUM_PUBLISH_WAIT_TIME_MS", default_value_t = 5_000)]
    pub quorum_publish_wait_time_ms: i64,

    #[arg(
        long,
        env = "HOLO_LAKE_ENABLE_BATCH_PUBLISH_VERSION",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub lake_enable_batch_publish_version: bool,

    #[arg(long, env = "HOLO_LAKE_BATCH_PUBLISH_MAX_VERSION_NUM", default_value_t = 10)]
    pub lake_batch_publish_max_version_num: usize,

    /// Concurrent lake partition publishes. Values outside (0, 4096] fall back
    /// to the default.
    #[arg(long, env = "HOLO_LAKE_PUBLISH_VERSION_MAX_THREADS", default_value_t = 512)]
    pub lake_publish_version_max_threads: i64,

    #[arg(long, env = "HOLO_LAKE_PUBLISH_DELETE_TXNLOG_MAX_THREADS", default_value_t = 16)]
    pub lake_publish_delete_txnlog_max_threads: i64,

    /// Retention of finished transactions and their labels.
    #[arg(long, env = "HOLO_LABEL_KEEP_MAX_SECOND", default_value_t = 3 * 24 * 3600)]
    pub label_keep_max_second: i64,

    #[arg(
        long,
        env = "HOLO_PREPARED_TRANSACTION_DEFAULT_TIMEOUT_SECOND",
        default_value_t = 24 * 3600
    )]
    pub prepared_transaction_default_timeout_second: i64,

    #[arg(long, env = "HOLO_TXN_SWEEP_INTERVAL_MS", default_value_t = 1_000)]
    pub txn_sweep_interval_ms: u64,

    /// Bound on the visibility wait of remote commits.
    #[arg(long, env = "HOLO_COMMIT_TIMEOUT_MS", default_value_t = 30_000)]
    pub commit_timeout_ms: u64,

    /// Attach this many in-process workers and a demo catalog. 0 disables.
    #[arg(long, env = "HOLO_STANDALONE_WORKERS", default_value_t = 0)]
    pub standalone_workers: usize,

    /// Generate a steady trickle of load transactions (standalone only).
    #[arg(long)]
    pub demo_load: bool,
}

impl CoordinatorArgs {
    pub fn publish_config(&self) -> PublishConfig {
        PublishConfig {
            // Clamp to at least 1ms so the ticker never spins.
            interval: Duration::from_millis(self.publish_version_interval_ms.max(1)),
            quorum_wait_ms: self.quorum_publish_wait_time_ms.max(0),
            run_mode: self.run_mode,
            lake_batch_publish: self.lake_enable_batch_publish_version,
            lake_batch_max_txns: self.lake_batch_publish_max_version_num.max(1),
            lake_publish_threads: self.lake_publish_version_max_threads,
            lake_txnlog_cleanup_threads: self.lake_publish_delete_txnlog_max_threads,
        }
    }

    pub fn txn_config(&self) -> TxnConfig {
        TxnConfig {
            label_keep_max_ms: self.label_keep_max_second.max(0) * 1_000,
            prepared_timeout_ms: self.prepared_transaction_default_timeout_second.max(0) * 1_000,
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_millis(self.txn_sweep_interval_ms.max(1)),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            publish: self.publish_config(),
            txn: self.txn_config(),
            sweep: self.sweep_config(),
            commit_timeout: Duration::from_millis(self.commit_timeout_ms.max(1)),
        }
    }
}

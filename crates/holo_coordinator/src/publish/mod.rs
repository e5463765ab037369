//! Publish scheduler.
//!
//! A single loop polls committed transactions and drives them to VISIBLE
//! with one of two strategies:
//! - direct: one publish-version task per worker holding a replica, finished
//!   by completion reports and a quorum policy (`direct`)
//! - lake: per-partition publish RPCs run on a bounded executor, either per
//!   transaction or per contiguous batch (`lake`)
//!
//! The completion handler wakes the loop early through `waker()`.

mod direct;
pub mod executor;
mod lake;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use holo_txn::warn::{prune_warnings, should_warn, WARN_INTERVAL};
use holo_txn::{TaskDispatchRegistry, TransactionStateMachine};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cluster::ClusterInfo;
use crate::config::{PublishConfig, RunMode};
use crate::worker::WorkerClient;

use direct::DirectPublishState;
use lake::LakePublishState;

pub struct PublishScheduler {
    state_machine: Arc<TransactionStateMachine>,
    registry: Arc<TaskDispatchRegistry>,
    cluster: Arc<ClusterInfo>,
    client: Arc<dyn WorkerClient>,
    cfg: RwLock<PublishConfig>,
    wake: Arc<Notify>,
    tick_lock: tokio::sync::Mutex<()>,
    direct: DirectPublishState,
    lake: LakePublishState,
    last_warn: Mutex<BTreeMap<String, Instant>>,
}

impl PublishScheduler {
    pub fn new(
        state_machine: Arc<TransactionStateMachine>,
        registry: Arc<TaskDispatchRegistry>,
        cluster: Arc<ClusterInfo>,
        client: Arc<dyn WorkerClient>,
        cfg: PublishConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            state_machine,
            registry,
            cluster,
            client,
            lake: LakePublishState::new(&cfg),
            cfg: RwLock::new(cfg),
            wake: Arc::new(Notify::new()),
            tick_lock: tokio::sync::Mutex::new(()),
            direct: DirectPublishState::default(),
            last_warn: Mutex::new(BTreeMap::new()),
        })
    }

    /// Notifier the completion handler uses to trigger an early tick.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn config(&self) -> PublishConfig {
        *self.cfg.read().unwrap()
    }

    /// Apply a new configuration. Invalid executor sizes keep the current
    /// size.
    pub fn reconfigure(&self, cfg: PublishConfig) {
        self.lake.executor.resize(cfg.lake_publish_threads);
        self.lake.cleanup_executor.resize(cfg.lake_txnlog_cleanup_threads);
        *self.cfg.write().unwrap() = cfg;
        tracing::info!(
            run_mode = ?cfg.run_mode,
            lake_batch_publish = cfg.lake_batch_publish,
            interval_ms = cfg.interval.as_millis() as u64,
            "publish scheduler reconfigured"
        );
        self.wake();
    }

    /// Current size of the lake publish executor.
    pub fn publish_executor_size(&self) -> usize {
        self.lake.executor.size()
    }

    pub fn cleanup_executor_size(&self) -> usize {
        self.lake.cleanup_executor.size()
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = this.config().interval;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.wake.notified() => {}
                }
                this.tick().await;

                let current = this.config().interval;
                if current != interval {
                    interval = current;
                    ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
            }
        })
    }

    /// One scheduling pass. Overlapping calls return immediately.
    pub async fn tick(self: &Arc<Self>) {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            return;
        };
        prune_warnings(
            &mut self.last_warn.lock().expect("last warn lock"),
            WARN_INTERVAL,
            Instant::now(),
        );
        if self.cluster.is_empty() {
            if self.should_warn("no-workers") {
                tracing::warn!("no workers registered, skipping publish");
            }
            return;
        }

        let cfg = self.config();
        if cfg.uses_lake_batches() {
            let batches = self
                .state_machine
                .ready_publish_batches(cfg.lake_batch_max_txns);
            if !batches.is_empty() {
                self.publish_lake_batches(batches);
            }
            return;
        }

        let ready = self.state_machine.ready_to_publish();
        match cfg.run_mode {
            RunMode::SharedNothing => self.publish_direct(ready, cfg),
            RunMode::SharedData => {
                if !ready.is_empty() {
                    self.publish_lake_individually(ready);
                }
            }
        }
    }

    fn should_warn(&self, key: &str) -> bool {
        should_warn(&mut self.last_warn.lock().expect("last warn lock"), key, WARN_INTERVAL)
    }
}

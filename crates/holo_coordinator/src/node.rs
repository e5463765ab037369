//! Coordinator wiring.
//!
//! `Coordinator` owns every long-lived component as an explicit context
//! object: the state machine, the task registry, the publish scheduler, the
//! completion handler, and the client RPC service. `start` launches the
//! background loops.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use holo_txn::catalog::TableKind;
use holo_txn::txn::{LoadJobSourceType, TabletCommitInfo};
use holo_txn::{
    unix_time_ms, Catalog, EditLog, FileEditLog, StatusCode, TaskDispatchRegistry,
    TransactionStateMachine, WorkerId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cluster::{ClusterInfo, WorkerInfo};
use crate::completion::{
    JobProgress, PushJobTracker, TaskCompletionHandler, JOB_PROGRESS_QUEUE_CAPACITY,
};
use crate::config::{CoordinatorArgs, CoordinatorConfig, RunMode, SweepConfig};
use crate::leader::{
    BeginRemoteTxnRequest, CommitRemoteTxnRequest, LeaderForwarder, LeaderService, LeaderState,
};
use crate::publish::PublishScheduler;
use crate::sim::{seed_demo_catalog, LocalFleet};
use crate::worker::WorkerClient;

/// Journal file name under the data directory.
pub const JOURNAL_FILE: &str = "txn_journal.log";
/// Base port reported for in-process workers.
const STANDALONE_WORKER_PORT: u16 = 9060;

pub struct Coordinator {
    pub catalog: Arc<Catalog>,
    pub state_machine: Arc<TransactionStateMachine>,
    pub registry: Arc<TaskDispatchRegistry>,
    pub cluster: Arc<ClusterInfo>,
    pub leader: Arc<LeaderState>,
    pub scheduler: Arc<PublishScheduler>,
    pub completion: Arc<TaskCompletionHandler>,
    pub service: LeaderService,
    pub job_tracker: Arc<PushJobTracker>,
    job_progress_rx: Mutex<Option<mpsc::Receiver<JobProgress>>>,
    cfg: CoordinatorConfig,
}

/// Handles of the loops started by `Coordinator::start`.
pub struct CoordinatorTasks {
    pub scheduler: JoinHandle<()>,
    pub sweeper: JoinHandle<()>,
    pub job_tracker: Option<JoinHandle<()>>,
}

impl CoordinatorTasks {
    pub fn abort(&self) {
        self.scheduler.abort();
        self.sweeper.abort();
        if let Some(handle) = &self.job_tracker {
            handle.abort();
        }
    }
}

impl Coordinator {
    /// Build a coordinator and replay `journal` into it.
    pub fn new(
        catalog: Arc<Catalog>,
        journal: Arc<dyn EditLog>,
        client: Arc<dyn WorkerClient>,
        cluster: Arc<ClusterInfo>,
        leader: Arc<LeaderState>,
        forwarder: Option<Arc<dyn LeaderForwarder>>,
        cfg: CoordinatorConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let state_machine = Arc::new(TransactionStateMachine::new(catalog.clone(), journal, cfg.txn));
        let replayed = state_machine.replay().context("replay transaction journal")?;
        tracing::info!(entries = replayed, "transaction journal replayed");

        let registry = Arc::new(TaskDispatchRegistry::new());
        let scheduler = PublishScheduler::new(
            state_machine.clone(),
            registry.clone(),
            cluster.clone(),
            client,
            cfg.publish,
        );
        let (progress_tx, progress_rx) = mpsc::channel(JOB_PROGRESS_QUEUE_CAPACITY);
        let completion = Arc::new(TaskCompletionHandler::new(
            state_machine.clone(),
            registry.clone(),
            cluster.clone(),
            leader.clone(),
            scheduler.waker(),
            progress_tx,
        ));
        let service = LeaderService::new(
            state_machine.clone(),
            leader.clone(),
            forwarder,
            cfg.commit_timeout,
        );

        Ok(Arc::new(Self {
            catalog,
            state_machine,
            registry,
            cluster,
            leader,
            scheduler,
            completion,
            service,
            job_tracker: Arc::new(PushJobTracker::default()),
            job_progress_rx: Mutex::new(Some(progress_rx)),
            cfg,
        }))
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.cfg
    }

    /// Start the publish scheduler, the txn sweeper and the job tracker.
    pub fn start(&self) -> CoordinatorTasks {
        let scheduler = self.scheduler.spawn();
        let sweeper = spawn_sweeper(self.state_machine.clone(), self.cfg.sweep);
        let job_tracker = self
            .job_progress_rx
            .lock()
            .expect("job progress lock")
            .take()
            .map(|rx| self.job_tracker.clone().spawn(rx));
        tracing::info!(
            run_mode = ?self.cfg.publish.run_mode,
            leader = self.leader.is_leader(),
            "coordinator started"
        );
        CoordinatorTasks {
            scheduler,
            sweeper,
            job_tracker,
        }
    }
}

/// Abort timed-out transactions and evict expired ones on a fixed interval.
fn spawn_sweeper(state_machine: Arc<TransactionStateMachine>, cfg: SweepConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        loop {
            ticker.tick().await;
            let now = unix_time_ms();
            let aborted = state_machine.abort_timeout_transactions(now);
            if aborted > 0 {
                tracing::info!(aborted, "aborted timed out transactions");
            }
            if let Err(err) = state_machine.remove_expired_transactions(now) {
                tracing::warn!(error = ?err, "remove expired transactions failed");
            }
        }
    })
}

/// Run a coordinator node until ctrl-c.
pub async fn run_node(args: CoordinatorArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Open the journal, wire the coordinator and run until `shutdown`
/// resolves. This binary always acts as leader.
pub async fn run_node_with_shutdown<F>(args: CoordinatorArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let journal_path = args.data_dir.join(JOURNAL_FILE);
    let journal: Arc<dyn EditLog> = Arc::new(
        FileEditLog::open(&journal_path, args.journal_sync).context("open transaction journal")?,
    );
    let cfg = args.coordinator_config();
    let catalog = Arc::new(Catalog::new());
    let cluster = Arc::new(ClusterInfo::new());

    let workers: Vec<WorkerId> = (1..=args.standalone_workers as WorkerId).collect();
    let kind = match cfg.publish.run_mode {
        RunMode::SharedNothing => TableKind::Olap,
        RunMode::SharedData => TableKind::Lake,
    };
    let demo_tablets = seed_demo_catalog(&catalog, &workers, kind, 4);
    for worker_id in &workers {
        cluster.add_worker(WorkerInfo::new(
            *worker_id,
            "127.0.0.1",
            STANDALONE_WORKER_PORT + *worker_id as u16,
        ));
    }
    let fleet = Arc::new(LocalFleet::new(catalog.clone()));

    let coordinator = Coordinator::new(
        catalog,
        journal,
        fleet.clone(),
        cluster,
        Arc::new(LeaderState::leader()),
        None,
        cfg,
    )?;
    fleet.attach(&coordinator.completion);
    let tasks = coordinator.start();
    tracing::info!(
        node_id = args.node_id,
        data_dir = %args.data_dir.display(),
        workers = workers.len(),
        "coordinator node running"
    );

    let demo = (args.demo_load && !demo_tablets.is_empty())
        .then(|| spawn_demo_load(coordinator.clone(), demo_tablets));

    shutdown.await.context("wait for shutdown signal")?;
    tracing::info!(node_id = args.node_id, "shutting down");
    if let Some(handle) = demo {
        handle.abort();
    }
    tasks.abort();
    Ok(())
}

/// Begin and commit a small load transaction every half second.
fn spawn_demo_load(coordinator: Arc<Coordinator>, tablets: Vec<TabletCommitInfo>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        let mut seq: u64 = 0;
        loop {
            ticker.tick().await;
            seq += 1;
            let label = format!("demo-load-{}-{seq}", unix_time_ms());
            let begin = coordinator
                .service
                .begin_remote_txn(BeginRemoteTxnRequest {
                    db_id: 1,
                    table_ids: vec![10],
                    label: label.clone(),
                    request_id: None,
                    source_type: LoadJobSourceType::Frontend,
                    timeout_ms: 60_000,
                    coordinator_host: "127.0.0.1".to_string(),
                    use_combined_txn_log: false,
                })
                .await;
            if begin.status != StatusCode::Ok {
                tracing::warn!(%label, errors = ?begin.error_msgs, "demo begin failed");
                continue;
            }
            let commit = coordinator
                .service
                .commit_remote_txn(CommitRemoteTxnRequest {
                    db_id: 1,
                    txn_id: begin.txn_id,
                    commit_infos: tablets.clone(),
                    fail_infos: Vec::new(),
                    commit_timeout_ms: None,
                    attachment: None,
                })
                .await;
            match commit.status {
                StatusCode::Ok => tracing::info!(txn_id = begin.txn_id, %label, "demo load visible"),
                status => tracing::warn!(
                    txn_id = begin.txn_id,
                    ?status,
                    errors = ?commit.error_msgs,
                    "demo commit not visible"
                ),
            }
        }
    })
}

//! Shared helpers for coordinator integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use holo_coordinator::{
    ClusterInfo, Coordinator, CoordinatorConfig, CoordinatorTasks, LeaderForwarder, LeaderState,
    LocalFleet, PublishConfig, RunMode, WorkerInfo,
};
use holo_txn::catalog::{MaterializedIndex, Partition, Replica, Table, TableKind, Tablet};
use holo_txn::txn::TabletCommitInfo;
use holo_txn::{
    BeginRequest, Catalog, DbId, MemoryEditLog, PartitionId, ReplicaId, TableId, TabletId,
    TransactionState, TxnId, TxnStatus, WorkerId,
};

/// Upper bound for anything the tests wait on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DB: DbId = 1;
pub const TABLE: TableId = 10;
pub const PARTITION: PartitionId = 100;
/// Second table, used by multi-table and first-load cases.
pub const OTHER_TABLE: TableId = 11;
pub const OTHER_PARTITION: PartitionId = 110;
pub const WORKERS: [WorkerId; 3] = [1, 2, 3];

pub fn replica_id(tablet_id: TabletId, worker_id: WorkerId) -> ReplicaId {
    tablet_id * 10 + worker_id
}

fn replicas(tablet_id: TabletId, workers: &[WorkerId], version: i64) -> Tablet {
    Tablet::new(
        tablet_id,
        workers
            .iter()
            .map(|w| Replica::new(replica_id(tablet_id, *w), *w, version))
            .collect(),
    )
}

/// Table 10 / partition 100 at visible version 5 with tablets 1000 and 1001
/// replicated on workers 1..=3.
pub fn olap_catalog() -> Arc<Catalog> {
    let catalog = Arc::new(Catalog::new());
    catalog.create_database(DB, "db1");
    let index = MaterializedIndex::new(
        1,
        vec![replicas(1000, &WORKERS, 5), replicas(1001, &WORKERS, 5)],
    );
    catalog.create_table(
        DB,
        Table::new(TABLE, "orders", TableKind::Olap).with_partition(Partition::new(PARTITION, 5, vec![index])),
    );
    catalog
}

/// Lake table 10 / partition 100 at version 5 (tablet 1000 on worker 1,
/// 1001 on worker 2) and lake table 11 / partition 110 never loaded
/// (tablet 1100 on worker 1).
pub fn lake_catalog() -> Arc<Catalog> {
    let catalog = Arc::new(Catalog::new());
    catalog.create_database(DB, "db1");
    let index = MaterializedIndex::new(1, vec![replicas(1000, &[1], 5), replicas(1001, &[2], 5)]);
    catalog.create_table(
        DB,
        Table::new(TABLE, "events", TableKind::Lake).with_partition(Partition::new(PARTITION, 5, vec![index])),
    );
    let index = MaterializedIndex::new(2, vec![replicas(1100, &[1], 1)]);
    catalog.create_table(
        DB,
        Table::new(OTHER_TABLE, "users", TableKind::Lake)
            .with_partition(Partition::new(OTHER_PARTITION, 1, vec![index])),
    );
    catalog
}

pub fn direct_config() -> CoordinatorConfig {
    let mut cfg = CoordinatorConfig::default();
    cfg.publish.interval = Duration::from_millis(10);
    cfg
}

pub fn lake_config(batch: bool) -> CoordinatorConfig {
    let mut cfg = direct_config();
    cfg.publish = PublishConfig {
        run_mode: RunMode::SharedData,
        lake_batch_publish: batch,
        ..cfg.publish
    };
    cfg
}

pub struct Harness {
    pub coordinator: Arc<Coordinator>,
    pub fleet: Arc<LocalFleet>,
    pub catalog: Arc<Catalog>,
    pub journal: Arc<MemoryEditLog>,
    tasks: Option<CoordinatorTasks>,
}

impl Harness {
    /// Wire a leader coordinator over `catalog` without starting its loops.
    pub fn new(catalog: Arc<Catalog>, cfg: CoordinatorConfig) -> Self {
        Self::with_role(catalog, cfg, Arc::new(LeaderState::leader()), None)
    }

    pub fn with_role(
        catalog: Arc<Catalog>,
        cfg: CoordinatorConfig,
        leader: Arc<LeaderState>,
        forwarder: Option<Arc<dyn LeaderForwarder>>,
    ) -> Self {
        Self::build(catalog, cfg, leader, forwarder, Arc::new(MemoryEditLog::new()))
    }

    /// A fresh leader over `catalog` that replays this harness's journal.
    pub fn restart(&self, catalog: Arc<Catalog>, cfg: CoordinatorConfig) -> Self {
        Self::build(
            catalog,
            cfg,
            Arc::new(LeaderState::leader()),
            None,
            self.journal.clone(),
        )
    }

    fn build(
        catalog: Arc<Catalog>,
        cfg: CoordinatorConfig,
        leader: Arc<LeaderState>,
        forwarder: Option<Arc<dyn LeaderForwarder>>,
        journal: Arc<MemoryEditLog>,
    ) -> Self {
        let cluster = Arc::new(ClusterInfo::new());
        for worker_id in WORKERS {
            cluster.add_worker(WorkerInfo::new(worker_id, "127.0.0.1", 9060 + worker_id as u16));
        }
        let fleet = Arc::new(LocalFleet::new(catalog.clone()));
        let coordinator = Coordinator::new(
            catalog.clone(),
            journal.clone(),
            fleet.clone(),
            cluster,
            leader,
            forwarder,
            cfg,
        )
        .expect("build coordinator");
        fleet.attach(&coordinator.completion);
        Self {
            coordinator,
            fleet,
            catalog,
            journal,
            tasks: None,
        }
    }

    /// Wire and start every background loop.
    pub fn start(catalog: Arc<Catalog>, cfg: CoordinatorConfig) -> Self {
        let mut harness = Self::new(catalog, cfg);
        harness.run();
        harness
    }

    pub fn run(&mut self) {
        if self.tasks.is_none() {
            self.tasks = Some(self.coordinator.start());
        }
    }

    pub fn begin(&self, tables: &[TableId], label: &str) -> TxnId {
        self.coordinator
            .state_machine
            .begin_transaction(BeginRequest::new(DB, tables.to_vec(), label))
            .expect("begin transaction")
    }

    /// Begin a txn whose workers write one combined txn log per partition.
    pub fn begin_combined_log(&self, tables: &[TableId], label: &str) -> TxnId {
        let mut req = BeginRequest::new(DB, tables.to_vec(), label);
        req.use_combined_txn_log = true;
        self.coordinator
            .state_machine
            .begin_transaction(req)
            .expect("begin transaction")
    }

    /// Every replica of every tablet of `tables`, as confirmed by workers.
    pub fn commit_infos(&self, tables: &[TableId]) -> Vec<TabletCommitInfo> {
        let db = self.catalog.get_db(DB).expect("database");
        let meta = db.read();
        let mut infos = Vec::new();
        for table_id in tables {
            let Some(table) = meta.tables.get(table_id) else {
                continue;
            };
            for partition in table.partitions.values() {
                for tablet in partition.tablets() {
                    for replica in &tablet.replicas {
                        infos.push(TabletCommitInfo::new(tablet.id, replica.backend_id));
                    }
                }
            }
        }
        infos
    }

    pub fn commit(&self, txn_id: TxnId, tables: &[TableId]) {
        let infos = self.commit_infos(tables);
        self.coordinator
            .state_machine
            .commit_transaction(DB, txn_id, &infos, &[], None)
            .expect("commit transaction");
    }

    pub fn begin_and_commit(&self, tables: &[TableId], label: &str) -> TxnId {
        let txn_id = self.begin(tables, label);
        self.commit(txn_id, tables);
        txn_id
    }

    pub fn txn(&self, txn_id: TxnId) -> TransactionState {
        self.coordinator
            .state_machine
            .get_transaction(DB, txn_id)
            .expect("transaction")
    }

    pub fn status(&self, txn_id: TxnId) -> TxnStatus {
        self.txn(txn_id).status
    }

    pub fn visible_version(&self, table_id: TableId, partition_id: PartitionId) -> i64 {
        let db = self.catalog.get_db(DB).expect("database");
        let meta = db.read();
        meta.partition(table_id, partition_id)
            .map(|p| p.visible_version)
            .expect("partition")
    }

    pub async fn wait_visible(&self, txn_id: TxnId) -> bool {
        wait_for_condition(WAIT_TIMEOUT, || self.status(txn_id) == TxnStatus::Visible).await
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(tasks) = &self.tasks {
            tasks.abort();
        }
    }
}

/// Poll `predicate` until it holds or `timeout` passes.
pub async fn wait_for_condition(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

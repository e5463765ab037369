//! Minimal in-memory metadata model read and written by the transaction core.
//!
//! Only what publishing needs is modelled: partition versions, index
//! visibility, tablets and their replicas. Every database carries one
//! `RwLock` guarding its tables; readers take it for lookups and the state
//! machine takes it exclusively while applying commit or visible edits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::{DbId, IndexId, PartitionId, ReplicaId, TableId, TabletId, TxnId, Version, WorkerId};

/// First version every partition starts from.
pub const PARTITION_INIT_VERSION: Version = 1;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    /// Replicated tablets stored on worker local disks.
    Olap,
    /// Tablets on shared storage, one serving worker each.
    Lake,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexState {
    Normal,
    /// Index under construction by a schema change.
    Shadow,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    Normal,
    Clone,
    Alter,
    SchemaChange,
    Decommission,
}

/// Where a tablet lives in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TabletMeta {
    pub db_id: DbId,
    pub table_id: TableId,
    pub partition_id: PartitionId,
    pub index_id: IndexId,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Replica {
    pub id: ReplicaId,
    pub backend_id: WorkerId,
    pub state: ReplicaState,
    pub version: Version,
    #[serde(default)]
    pub last_failed_version: Version,
    #[serde(default)]
    pub last_success_version: Version,
    #[serde(default)]
    pub path_hash: i64,
    #[serde(default)]
    pub row_count: u64,
}

impl Replica {
    pub fn new(id: ReplicaId, backend_id: WorkerId, version: Version) -> Self {
        Self {
            id,
            backend_id,
            state: ReplicaState::Normal,
            version,
            last_failed_version: -1,
            last_success_version: version,
            path_hash: -1,
            row_count: 0,
        }
    }

    pub fn is_healthy_state(&self) -> bool {
        matches!(self.state, ReplicaState::Normal | ReplicaState::Clone)
    }

    /// Advance the replica after a successful publish of `version`.
    pub fn update_version(&mut self, version: Version) {
        if version > self.version {
            self.version = version;
        }
        if version > self.last_success_version {
            self.last_success_version = version;
        }
        if self.last_failed_version <= self.version {
            self.last_failed_version = -1;
        }
    }

    /// Record that the replica missed `version`.
    pub fn mark_failed(&mut self, version: Version) {
        if version > self.last_failed_version {
            self.last_failed_version = version;
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Tablet {
    pub id: TabletId,
    pub replicas: Vec<Replica>,
}

impl Tablet {
    pub fn new(id: TabletId, replicas: Vec<Replica>) -> Self {
        Self { id, replicas }
    }

    /// Majority of the tablet's replicas.
    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    pub fn replica_on(&self, worker_id: WorkerId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.backend_id == worker_id)
    }

    pub fn replica_on_mut(&mut self, worker_id: WorkerId) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.backend_id == worker_id)
    }

    /// Worker serving a lake tablet: the first replica's backend.
    pub fn primary_worker(&self) -> Option<WorkerId> {
        self.replicas.first().map(|r| r.backend_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MaterializedIndex {
    pub id: IndexId,
    pub state: IndexState,
    /// Transactions with an id below this do not write to the index.
    #[serde(default)]
    pub visible_txn_id: TxnId,
    pub tablets: Vec<Tablet>,
}

impl MaterializedIndex {
    pub fn new(id: IndexId, tablets: Vec<Tablet>) -> Self {
        Self {
            id,
            state: IndexState::Normal,
            visible_txn_id: 0,
            tablets,
        }
    }

    pub fn shadow(id: IndexId, visible_txn_id: TxnId, tablets: Vec<Tablet>) -> Self {
        Self {
            id,
            state: IndexState::Shadow,
            visible_txn_id,
            tablets,
        }
    }

    pub fn visible_for_txn(&self, txn_id: TxnId) -> bool {
        self.state == IndexState::Normal || txn_id >= self.visible_txn_id
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub id: PartitionId,
    pub visible_version: Version,
    pub visible_version_time: i64,
    /// Next version handed out at commit.
    pub next_version: Version,
    pub indexes: Vec<MaterializedIndex>,
}

impl Partition {
    pub fn new(id: PartitionId, visible_version: Version, indexes: Vec<MaterializedIndex>) -> Self {
        Self {
            id,
            visible_version,
            visible_version_time: 0,
            next_version: visible_version + 1,
            indexes,
        }
    }

    pub fn tablets(&self) -> impl Iterator<Item = &Tablet> {
        self.indexes.iter().flat_map(|idx| idx.tablets.iter())
    }

    pub fn tablets_mut(&mut self) -> impl Iterator<Item = &mut Tablet> {
        self.indexes.iter_mut().flat_map(|idx| idx.tablets.iter_mut())
    }

    /// Tablets a transaction writes to, split into normal and shadow indexes.
    pub fn tablets_for_txn(&self, txn_id: TxnId) -> (Vec<&Tablet>, Vec<&Tablet>) {
        let mut normal = Vec::new();
        let mut shadow = Vec::new();
        for index in self.indexes.iter().filter(|idx| idx.visible_for_txn(txn_id)) {
            match index.state {
                IndexState::Normal => normal.extend(index.tablets.iter()),
                IndexState::Shadow => shadow.extend(index.tablets.iter()),
            }
        }
        (normal, shadow)
    }

    pub fn workers(&self) -> BTreeSet<WorkerId> {
        self.tablets()
            .flat_map(|t| t.replicas.iter().map(|r| r.backend_id))
            .collect()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub kind: TableKind,
    pub partitions: BTreeMap<PartitionId, Partition>,
}

impl Table {
    pub fn new(id: TableId, name: impl Into<String>, kind: TableKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            partitions: BTreeMap::new(),
        }
    }

    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.partitions.insert(partition.id, partition);
        self
    }

    pub fn is_lake(&self) -> bool {
        self.kind == TableKind::Lake
    }
}

#[derive(Default, Debug)]
pub struct DatabaseMeta {
    pub tables: BTreeMap<TableId, Table>,
}

impl DatabaseMeta {
    pub fn partition(&self, table_id: TableId, partition_id: PartitionId) -> Option<&Partition> {
        self.tables.get(&table_id)?.partitions.get(&partition_id)
    }

    pub fn partition_mut(
        &mut self,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Option<&mut Partition> {
        self.tables
            .get_mut(&table_id)?
            .partitions
            .get_mut(&partition_id)
    }
}

#[derive(Debug)]
pub struct Database {
    pub id: DbId,
    pub name: String,
    meta: RwLock<DatabaseMeta>,
}

impl Database {
    pub fn read(&self) -> RwLockReadGuard<'_, DatabaseMeta> {
        self.meta.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DatabaseMeta> {
        self.meta.write().unwrap()
    }
}

/// Databases plus a tablet inverted index for resolving worker reports.
#[derive(Default, Debug)]
pub struct Catalog {
    dbs: RwLock<BTreeMap<DbId, Arc<Database>>>,
    tablets: RwLock<HashMap<TabletId, TabletMeta>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_database(&self, id: DbId, name: impl Into<String>) -> Arc<Database> {
        let mut dbs = self.dbs.write().unwrap();
        dbs.entry(id)
            .or_insert_with(|| {
                Arc::new(Database {
                    id,
                    name: name.into(),
                    meta: RwLock::new(DatabaseMeta::default()),
                })
            })
            .clone()
    }

    pub fn drop_database(&self, id: DbId) -> Option<Arc<Database>> {
        let db = self.dbs.write().unwrap().remove(&id)?;
        self.tablets.write().unwrap().retain(|_, meta| meta.db_id != id);
        Some(db)
    }

    pub fn get_db(&self, id: DbId) -> Option<Arc<Database>> {
        self.dbs.read().unwrap().get(&id).cloned()
    }

    pub fn db_ids(&self) -> Vec<DbId> {
        self.dbs.read().unwrap().keys().copied().collect()
    }

    /// Add (or replace) a table and index its tablets.
    pub fn create_table(&self, db_id: DbId, table: Table) -> bool {
        let Some(db) = self.get_db(db_id) else {
            return false;
        };
        let mut entries = Vec::new();
        for partition in table.partitions.values() {
            for mat in &partition.indexes {
                for tablet in &mat.tablets {
                    let meta = TabletMeta {
                        db_id,
                        table_id: table.id,
                        partition_id: partition.id,
                        index_id: mat.id,
                    };
                    entries.push((tablet.id, meta));
                }
            }
        }
        // Database lock is never held while taking the index lock here; the
        // commit path takes them in the opposite order.
        db.write().tables.insert(table.id, table);
        self.tablets.write().unwrap().extend(entries);
        true
    }

    pub fn drop_table(&self, db_id: DbId, table_id: TableId) -> Option<Table> {
        let db = self.get_db(db_id)?;
        let table = db.write().tables.remove(&table_id)?;
        self.tablets
            .write()
            .unwrap()
            .retain(|_, meta| !(meta.db_id == db_id && meta.table_id == table_id));
        Some(table)
    }

    pub fn drop_partition(
        &self,
        db_id: DbId,
        table_id: TableId,
        partition_id: PartitionId,
    ) -> Option<Partition> {
        let db = self.get_db(db_id)?;
        let partition = db
            .write()
            .tables
            .get_mut(&table_id)?
            .partitions
            .remove(&partition_id)?;
        self.tablets
            .write()
            .unwrap()
            .retain(|_, meta| meta.partition_id != partition_id);
        Some(partition)
    }

    pub fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMeta> {
        self.tablets.read().unwrap().get(&tablet_id).copied()
    }

    /// Replica of `tablet_id` hosted on `worker_id`, if both still exist.
    pub fn replica_on(&self, tablet_id: TabletId, worker_id: WorkerId) -> Option<Replica> {
        let meta = self.tablet_meta(tablet_id)?;
        let db = self.get_db(meta.db_id)?;
        let guard = db.read();
        let replica = guard
            .partition(meta.table_id, meta.partition_id)?
            .tablets()
            .find(|t| t.id == tablet_id)?
            .replica_on(worker_id)
            .cloned();
        replica
    }

    /// Apply `f` to the replica of `tablet_id` on `worker_id` under the
    /// database write lock.
    pub fn update_replica<R>(
        &self,
        tablet_id: TabletId,
        worker_id: WorkerId,
        f: impl FnOnce(&mut Replica) -> R,
    ) -> Option<R> {
        let meta = self.tablet_meta(tablet_id)?;
        let db = self.get_db(meta.db_id)?;
        let mut guard = db.write();
        let replica = guard
            .partition_mut(meta.table_id, meta.partition_id)?
            .tablets_mut()
            .find(|t| t.id == tablet_id)?
            .replica_on_mut(worker_id)?;
        Some(f(replica))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn olap_table(table_id: TableId, partition_id: PartitionId) -> Table {
        let tablets = vec![
            Tablet::new(100, vec![Replica::new(1000, 1, 1), Replica::new(1001, 2, 1)]),
            Tablet::new(101, vec![Replica::new(1010, 1, 1), Replica::new(1011, 3, 1)]),
        ];
        Table::new(table_id, "t", TableKind::Olap).with_partition(Partition::new(
            partition_id,
            1,
            vec![MaterializedIndex::new(10, tablets)],
        ))
    }

    #[test]
    fn inverted_index_follows_ddl() {
        let catalog = Catalog::new();
        catalog.create_database(1, "db");
        assert!(catalog.create_table(1, olap_table(2, 3)));
        let meta = catalog.tablet_meta(101).expect("tablet indexed");
        assert_eq!(meta.partition_id, 3);
        assert_eq!(catalog.replica_on(101, 3).map(|r| r.id), Some(1011));

        catalog.drop_partition(1, 2, 3).expect("partition dropped");
        assert!(catalog.tablet_meta(101).is_none());
        assert!(catalog.replica_on(101, 3).is_none());
    }

    #[test]
    fn create_table_requires_database() {
        let catalog = Catalog::new();
        assert!(!catalog.create_table(9, olap_table(2, 3)));
    }

    #[test]
    fn shadow_index_visibility_depends_on_txn_id() {
        let partition = Partition::new(
            1,
            1,
            vec![
                MaterializedIndex::new(10, vec![Tablet::new(1, vec![])]),
                MaterializedIndex::shadow(11, 50, vec![Tablet::new(2, vec![])]),
            ],
        );
        let (normal, shadow) = partition.tablets_for_txn(49);
        assert_eq!(normal.len(), 1);
        assert!(shadow.is_empty());
        let (_, shadow) = partition.tablets_for_txn(50);
        assert_eq!(shadow.iter().map(|t| t.id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn replica_version_updates_clear_failures() {
        let mut replica = Replica::new(1, 1, 3);
        replica.mark_failed(4);
        assert_eq!(replica.last_failed_version, 4);
        replica.update_version(4);
        assert_eq!(replica.version, 4);
        assert_eq!(replica.last_failed_version, -1);
        replica.update_version(2);
        assert_eq!(replica.version, 4);
    }

    #[test]
    fn update_replica_mutates_in_place() {
        let catalog = Catalog::new();
        catalog.create_database(1, "db");
        catalog.create_table(1, olap_table(2, 3));
        let updated = catalog.update_replica(100, 2, |r| {
            r.path_hash = 77;
            r.id
        });
        assert_eq!(updated, Some(1001));
        assert_eq!(catalog.replica_on(100, 2).map(|r| r.path_hash), Some(77));
    }
}

//! Per-transaction replica bookkeeping.
//!
//! A replica is trusted to have applied a transaction's data only when it is
//! healthy, absent from both the error and the unknown sets, confirmed by
//! the per-tablet commit report when one is still held, and not yet at the
//! target version. Trusted replicas are advanced at publish time; replicas
//! in the error or unknown sets are marked as having missed the version.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::catalog::Replica;
use crate::{ReplicaId, TabletId, Version, WorkerId};

/// What publishing did to a single replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaOutcome {
    Advanced,
    Failed,
    Unchanged,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaVersionLedger {
    #[serde(default)]
    error_replicas: BTreeSet<ReplicaId>,
    #[serde(default)]
    unknown_replicas: BTreeSet<ReplicaId>,
    /// Leader-only confirmations from the commit report. Released once the
    /// transaction is visible and never persisted.
    #[serde(skip)]
    tablet_commit_infos: Option<HashSet<(TabletId, WorkerId)>>,
}

impl ReplicaVersionLedger {
    pub fn record_error(&mut self, replica_id: ReplicaId) {
        self.error_replicas.insert(replica_id);
    }

    pub fn record_unknown(&mut self, replica_id: ReplicaId) {
        self.unknown_replicas.insert(replica_id);
    }

    pub fn error_replicas(&self) -> &BTreeSet<ReplicaId> {
        &self.error_replicas
    }

    pub fn unknown_replicas(&self) -> &BTreeSet<ReplicaId> {
        &self.unknown_replicas
    }

    pub fn is_suspect(&self, replica_id: ReplicaId) -> bool {
        self.error_replicas.contains(&replica_id) || self.unknown_replicas.contains(&replica_id)
    }

    pub fn set_tablet_commit_infos(
        &mut self,
        infos: impl IntoIterator<Item = (TabletId, WorkerId)>,
    ) {
        self.tablet_commit_infos = Some(infos.into_iter().collect());
    }

    pub fn release_tablet_commit_infos(&mut self) {
        self.tablet_commit_infos = None;
    }

    pub fn has_tablet_commit_infos(&self) -> bool {
        self.tablet_commit_infos.is_some()
    }

    fn is_confirmed(&self, tablet_id: TabletId, backend_id: WorkerId) -> bool {
        match &self.tablet_commit_infos {
            Some(infos) => infos.contains(&(tablet_id, backend_id)),
            None => true,
        }
    }

    pub fn is_trusted(&self, tablet_id: TabletId, replica: &Replica, target: Version) -> bool {
        replica.is_healthy_state()
            && !self.is_suspect(replica.id)
            && self.is_confirmed(tablet_id, replica.backend_id)
            && replica.version < target
    }

    /// Move `replica` according to the trust predicate for `target`.
    pub fn apply_publish(
        &self,
        tablet_id: TabletId,
        replica: &mut Replica,
        target: Version,
    ) -> ReplicaOutcome {
        if self.is_trusted(tablet_id, replica, target) {
            replica.update_version(target);
            return ReplicaOutcome::Advanced;
        }
        if replica.version < target && self.is_suspect(replica.id) {
            replica.mark_failed(target);
            return ReplicaOutcome::Failed;
        }
        ReplicaOutcome::Unchanged
    }
}

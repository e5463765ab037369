//! Transaction state-change observers.
//!
//! Load jobs register a callback with the state machine and hand the
//! returned id to `begin_transaction`. Before-hooks may veto a transition;
//! after-hooks are informational and their failures are only logged.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::txn::TransactionState;

pub trait TxnStateChangeCallback: Send + Sync + 'static {
    fn before_prepared(&self, _txn: &TransactionState) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_committed(&self, _txn: &TransactionState) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_visible(&self, _txn: &TransactionState) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_aborted(&self, _txn: &TransactionState) -> anyhow::Result<()> {
        Ok(())
    }

    /// `txn_operated` is false when the transition did not happen.
    fn after_prepared(&self, _txn: &TransactionState, _txn_operated: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_committed(&self, _txn: &TransactionState, _txn_operated: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_visible(&self, _txn: &TransactionState, _txn_operated: bool) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_aborted(
        &self,
        _txn: &TransactionState,
        _txn_operated: bool,
        _reason: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn replay_on_committed(&self, _txn: &TransactionState) {}

    fn replay_on_visible(&self, _txn: &TransactionState) {}

    fn replay_on_aborted(&self, _txn: &TransactionState) {}
}

/// Registered callbacks keyed by id.
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: RwLock<BTreeMap<u64, Arc<dyn TxnStateChangeCallback>>>,
}

impl CallbackRegistry {
    pub fn register(&self, callback: Arc<dyn TxnStateChangeCallback>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.callbacks.write().unwrap().insert(id, callback);
        id
    }

    pub fn remove(&self, id: u64) -> Option<Arc<dyn TxnStateChangeCallback>> {
        self.callbacks.write().unwrap().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<dyn TxnStateChangeCallback>> {
        self.callbacks.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

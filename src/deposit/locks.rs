//! Per-address sweep lock and evaluation gate
//!
//! A sweep marks its address as sweeping, then takes the address gate, which
//! waits out any watcher evaluation already running. The watcher only
//! try-locks the gate and skips the address while it is sweeping, so it never
//! observes the balance drop of an in-flight sweep.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct AddressLocks {
    sweeping: DashSet<String>,
    gates: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of one sweep; releases the lock on drop
#[derive(Debug)]
pub struct SweepGuard {
    locks: Arc<AddressLocks>,
    address_id: String,
}

/// Held while the watcher evaluates one address
#[derive(Debug)]
pub struct EvaluationGuard {
    _gate: OwnedMutexGuard<()>,
}

impl AddressLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gate(&self, address_id: &str) -> Arc<Mutex<()>> {
        self.gates
            .entry(address_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the sweep lock, None when a sweep already holds it
    pub fn begin_sweep(self: &Arc<Self>, address_id: &str) -> Option<SweepGuard> {
        if !self.sweeping.insert(address_id.to_string()) {
            return None;
        }
        Some(SweepGuard {
            locks: Arc::clone(self),
            address_id: address_id.to_string(),
        })
    }

    /// Gate for one evaluation, None while the address is sweeping or busy
    pub fn try_evaluate(&self, address_id: &str) -> Option<EvaluationGuard> {
        if self.is_sweeping(address_id) {
            return None;
        }
        let gate = self.gate(address_id).try_lock_owned().ok()?;
        if self.is_sweeping(address_id) {
            return None;
        }
        Some(EvaluationGuard { _gate: gate })
    }

    pub fn is_sweeping(&self, address_id: &str) -> bool {
        self.sweeping.contains(address_id)
    }

    /// Drop the gate of a deleted address
    pub fn forget(&self, address_id: &str) {
        if !self.is_sweeping(address_id) {
            self.gates.remove(address_id);
        }
    }
}

impl SweepGuard {
    /// Wait for any in-flight evaluation, then hold the gate
    pub async fn exclusive(&self) -> OwnedMutexGuard<()> {
        self.locks.gate(&self.address_id).lock_owned().await
    }

    pub fn address_id(&self) -> &str {
        &self.address_id
    }
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.locks.sweeping.remove(&self.address_id);
    }
}

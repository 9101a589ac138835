//! Per-identity write serialization.
//!
//! # Responsibility
//! - Serialize read-decide-write-collect sequences for one food identity.
//! - Let different identities proceed without sharing a lock.
//!
//! # Invariants
//! - At most one closure runs per identity at a time within one registry.
//! - Slots are dropped once no caller holds or waits on them.
//! - A panicked holder does not wedge the identity; the slot is recovered.

use crate::model::food::FoodId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Registry of per-identity mutexes. Share one registry (via `Arc`) between
/// every store that writes to the same database.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    slots: Mutex<HashMap<FoodId, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `op` while holding the lock for `food_id`.
    pub fn with_identity<T>(&self, food_id: FoodId, op: impl FnOnce() -> T) -> T {
        let slot = self.slot(food_id);
        let value = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            op()
        };
        self.release(food_id, slot);
        value
    }

    /// Number of identities currently holding or waiting on a slot.
    pub fn active_identities(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn slot(&self, food_id: FoodId) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(food_id).or_default())
    }

    fn release(&self, food_id: FoodId, slot: Arc<Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry + our handle: nobody else is holding or waiting.
        if Arc::strong_count(&slot) == 2 {
            slots.remove(&food_id);
        }
    }
}

//! Process-wide memory accounting for admitted tasks
//!
//! The ledger is pure bookkeeping. Pools reserve a task's estimated memory when
//! they admit it and release it when the task reaches a terminal state; the
//! ledger only answers whether more work may be admitted.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DEFAULT_MEMORY_BUDGET_BYTES;
use crate::worker::TaskId;

/// Owner of a memory reservation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub pool_id: Uuid,
    pub task_id: TaskId,
}

impl ReservationKey {
    pub fn new(pool_id: Uuid, task_id: TaskId) -> Self {
        Self { pool_id, task_id }
    }
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub budget_bytes: u64,
    pub current_bytes: u64,
    pub reservations: usize,
}

struct LedgerState {
    budget: u64,
    current: u64,
    reservations: HashMap<ReservationKey, u64>,
}

/// Memory budget shared by every pool in the process
///
/// Admission is checked against *current* usage rather than usage projected
/// after adding the candidate task, and is unconditional when nothing is
/// active, so a single oversized task can always run.
///
/// # Example
///
/// ```
/// use inkshelf_taskpool::{MemoryLedger, ReservationKey};
/// use uuid::Uuid;
///
/// let ledger = MemoryLedger::new(100);
/// let key = ReservationKey::new(Uuid::now_v7(), "task-1".into());
///
/// assert!(ledger.can_admit(false));
/// ledger.reserve(key.clone(), 150);
/// assert!(!ledger.can_admit(true));
/// ledger.release(&key);
/// assert_eq!(ledger.current_bytes(), 0);
/// ```
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    /// Create a ledger with the given budget
    ///
    /// A zero budget is treated as a configuration error and replaced by the
    /// default budget.
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                budget: sanitize_budget(budget_bytes),
                current: 0,
                reservations: HashMap::new(),
            }),
        }
    }

    /// Reserve memory for a task; always succeeds
    ///
    /// Reserving twice under the same key accumulates.
    pub fn reserve(&self, key: ReservationKey, amount_bytes: u64) {
        let mut state = self.state.lock();
        let entry = state.reservations.entry(key).or_insert(0);
        *entry = entry.saturating_add(amount_bytes);
        state.current = state.current.saturating_add(amount_bytes);
        debug!(
            amount_bytes,
            current_bytes = state.current,
            budget_bytes = state.budget,
            "Reserved task memory"
        );
    }

    /// Release the reservation held under `key`
    ///
    /// Returns the released amount; unknown keys are a no-op returning 0.
    pub fn release(&self, key: &ReservationKey) -> u64 {
        let mut state = self.state.lock();
        let Some(amount) = state.reservations.remove(key) else {
            return 0;
        };
        state.current = state.current.saturating_sub(amount);
        debug!(
            amount_bytes = amount,
            current_bytes = state.current,
            "Released task memory"
        );
        amount
    }

    /// Release every reservation owned by a pool
    pub fn release_pool(&self, pool_id: Uuid) -> u64 {
        let mut state = self.state.lock();
        let mut released = 0u64;
        state.reservations.retain(|key, amount| {
            if key.pool_id == pool_id {
                released = released.saturating_add(*amount);
                false
            } else {
                true
            }
        });
        state.current = state.current.saturating_sub(released);
        if released > 0 {
            debug!(%pool_id, released_bytes = released, "Released pool memory");
        }
        released
    }

    /// Whether a new task may be admitted
    ///
    /// Always true when there is no active work, guaranteeing forward
    /// progress; otherwise true while current usage is within budget.
    pub fn can_admit(&self, has_active_work: bool) -> bool {
        if !has_active_work {
            return true;
        }
        let state = self.state.lock();
        state.current <= state.budget
    }

    /// Update the budget live; existing reservations are kept
    pub fn set_budget(&self, budget_bytes: u64) {
        let budget = sanitize_budget(budget_bytes);
        let mut state = self.state.lock();
        if state.budget != budget {
            debug!(old = state.budget, new = budget, "Memory budget updated");
        }
        state.budget = budget;
    }

    pub fn budget_bytes(&self) -> u64 {
        self.state.lock().budget
    }

    pub fn current_bytes(&self) -> u64 {
        self.state.lock().current
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().reservations.len()
    }

    /// Amount reserved under `key`, if any
    pub fn reserved_for(&self, key: &ReservationKey) -> Option<u64> {
        self.state.lock().reservations.get(key).copied()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            budget_bytes: state.budget,
            current_bytes: state.current,
            reservations: state.reservations.len(),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_BUDGET_BYTES)
    }
}

fn sanitize_budget(budget_bytes: u64) -> u64 {
    if budget_bytes == 0 {
        warn!("Memory budget of 0 bytes requested, using default");
        DEFAULT_MEMORY_BUDGET_BYTES
    } else {
        budget_bytes
    }
}

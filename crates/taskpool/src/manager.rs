//! Pool lifecycle management
//!
//! [`PoolManager`] owns the single shared [`WorkerPool`], builds it lazily on
//! first use and tears it down when the last user leaves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{hardware_concurrency, PoolSizing, SettingsProvider};
use crate::ledger::MemoryLedger;
use crate::worker::{WorkerPool, WorkerPoolConfig};

type PoolCell<O> = Arc<OnceCell<Arc<WorkerPool<O>>>>;

/// Reference-counted owner of the shared worker pool
///
/// Concurrent first calls to [`acquire_pool`](Self::acquire_pool) share a
/// single construction. Dropping the user count to zero terminates the pool
/// and clears the slot, so the next acquisition builds a fresh one.
///
/// # Example
///
/// ```ignore
/// let manager = PoolManager::new(ledger, Arc::new(StaticSettings::default()));
///
/// manager.increment_users();
/// let pool = manager.acquire_pool().await;
/// pool.add_task(task)?;
///
/// // ...once the queue drains
/// manager.decrement_users(); // terminates the pool
/// ```
pub struct PoolManager<O> {
    name: String,
    ledger: Arc<MemoryLedger>,
    settings: Arc<dyn SettingsProvider>,
    hardware_concurrency: usize,
    cell: Mutex<PoolCell<O>>,
    users: Mutex<usize>,
    pools_built: AtomicUsize,
}

impl<O: Send + 'static> PoolManager<O> {
    pub fn new(ledger: Arc<MemoryLedger>, settings: Arc<dyn SettingsProvider>) -> Self {
        Self {
            name: "transfer".to_string(),
            ledger,
            settings,
            hardware_concurrency: hardware_concurrency(),
            cell: Mutex::new(Arc::new(OnceCell::new())),
            users: Mutex::new(0),
            pools_built: AtomicUsize::new(0),
        }
    }

    /// Override the hardware concurrency hint used to cap the unit count
    pub fn with_hardware_concurrency(mut self, hint: usize) -> Self {
        self.hardware_concurrency = hint.max(1);
        self
    }

    /// Set the name given to pools built by this manager
    pub fn with_pool_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Return the shared pool, building it if necessary
    ///
    /// Sizing is sampled from the settings provider at construction only.
    /// Callers register with [`increment_users`](Self::increment_users) first;
    /// only the last user leaving tears the pool down.
    pub async fn acquire_pool(&self) -> Arc<WorkerPool<O>> {
        if self.users() == 0 {
            warn!(pool = %self.name, "Pool acquired without registered users");
        }

        loop {
            let cell = self.cell.lock().clone();
            let pool = Arc::clone(cell.get_or_init(|| self.build_pool()).await);

            if pool.is_terminated() {
                debug!(pool_id = %pool.id(), "Shared pool was terminated, rebuilding");
                self.reset_cell(&cell);
                continue;
            }

            // Torn down while we were building or waiting
            if !Arc::ptr_eq(&cell, &self.cell.lock()) {
                pool.terminate();
                continue;
            }

            return pool;
        }
    }

    /// Register a pool user; returns the new count
    pub fn increment_users(&self) -> usize {
        let mut users = self.users.lock();
        *users += 1;
        debug!(users = *users, "Pool user registered");
        *users
    }

    /// Unregister a pool user; returns the remaining count
    ///
    /// Reaching zero terminates the pool synchronously. Decrementing at zero
    /// is clamped.
    pub fn decrement_users(&self) -> usize {
        let mut users = self.users.lock();
        if *users == 0 {
            warn!("Pool user count decremented below zero, clamping");
            return 0;
        }

        *users -= 1;
        debug!(users = *users, "Pool user unregistered");
        if *users == 0 {
            let previous = std::mem::replace(&mut *self.cell.lock(), Arc::new(OnceCell::new()));
            if let Some(pool) = previous.get() {
                info!(pool_id = %pool.id(), "Last pool user left, terminating pool");
                pool.terminate();
            }
        }
        *users
    }

    /// Re-sample settings and apply the budget to the ledger live
    pub async fn refresh_budget(&self) -> u64 {
        let settings = self.settings.current().await;
        let sizing = PoolSizing::resolve(&settings, self.hardware_concurrency);
        self.ledger.set_budget(sizing.memory_budget_bytes);
        sizing.memory_budget_bytes
    }

    pub fn users(&self) -> usize {
        *self.users.lock()
    }

    /// The pool currently installed, if one was built
    pub fn current_pool(&self) -> Option<Arc<WorkerPool<O>>> {
        self.cell.lock().get().cloned()
    }

    /// Number of pools built over the manager's lifetime
    pub fn pools_built(&self) -> usize {
        self.pools_built.load(Ordering::Relaxed)
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    async fn build_pool(&self) -> Arc<WorkerPool<O>> {
        let settings = self.settings.current().await;
        let sizing = PoolSizing::resolve(&settings, self.hardware_concurrency);
        self.ledger.set_budget(sizing.memory_budget_bytes);

        let config = WorkerPoolConfig::new(sizing.unit_count).with_name(self.name.clone());
        let pool = Arc::new(WorkerPool::new(config, Arc::clone(&self.ledger)));
        self.pools_built.fetch_add(1, Ordering::Relaxed);
        info!(
            pool_id = %pool.id(),
            unit_count = sizing.unit_count,
            budget_bytes = sizing.memory_budget_bytes,
            "Built shared worker pool"
        );
        pool
    }

    fn reset_cell(&self, stale: &PoolCell<O>) {
        let mut cell = self.cell.lock();
        if Arc::ptr_eq(&cell, stale) {
            *cell = Arc::new(OnceCell::new());
        }
    }
}

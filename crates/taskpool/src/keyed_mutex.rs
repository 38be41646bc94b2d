//! Keyed async mutual exclusion
//!
//! One lock per arbitrary string key (e.g. `"drive:One Piece"`). Used to make
//! "ensure the series folder exists" happen once under concurrent callers, and
//! to space out rate-limited remote calls such as share-link creation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

/// Which path a [`KeyedMutexRegistry::with_lock`] caller took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPath {
    /// First holder of a fresh entry: perform the full operation
    Created,

    /// A previous holder completed successfully: a cheap idempotent lookup
    /// is enough
    Existing,
}

#[derive(Debug, Default)]
struct SlotState {
    /// A holder completed successfully
    settled: bool,
    /// A holder failed; the slot is no longer in the registry
    evicted: bool,
}

type Slot = Arc<AsyncMutex<SlotState>>;
type ThrottleSlot = Arc<AsyncMutex<Option<Instant>>>;

/// Registry of per-key async locks
///
/// Only the registry mutates its maps; callers interact through
/// [`with_lock`](Self::with_lock) and [`with_throttle`](Self::with_throttle).
///
/// # Example
///
/// ```
/// use inkshelf_taskpool::{KeyedMutexRegistry, LockPath};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let locks = KeyedMutexRegistry::new();
///
/// let first = locks
///     .with_lock("drive:Berserk", |path| async move { Ok::<_, ()>(path) })
///     .await;
/// assert_eq!(first, Ok(LockPath::Created));
///
/// let second = locks
///     .with_lock("drive:Berserk", |path| async move { Ok::<_, ()>(path) })
///     .await;
/// assert_eq!(second, Ok(LockPath::Existing));
/// # }
/// ```
#[derive(Default)]
pub struct KeyedMutexRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    throttles: Mutex<HashMap<String, ThrottleSlot>>,
}

impl KeyedMutexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`
    ///
    /// At most one `f` runs per key at any instant. `f` receives
    /// [`LockPath::Created`] unless a previous holder succeeded, in which case
    /// it receives [`LockPath::Existing`]. On success the entry stays installed;
    /// on failure it is evicted so the next caller starts from scratch.
    pub async fn with_lock<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(LockPath) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (slot, mut guard) = loop {
            let slot = self.slot_for(key);
            let guard = slot.clone().lock_owned().await;
            // A failed holder evicted this slot while we waited
            if !guard.evicted {
                break (slot, guard);
            }
        };

        let path = if guard.settled {
            LockPath::Existing
        } else {
            LockPath::Created
        };
        debug!(key, ?path, "Acquired keyed lock");

        match f(path).await {
            Ok(value) => {
                guard.settled = true;
                Ok(value)
            }
            Err(err) => {
                guard.settled = false;
                guard.evicted = true;
                self.evict(key, &slot);
                debug!(key, "Keyed lock holder failed, entry evicted");
                Err(err)
            }
        }
    }

    /// Run `f` serialized per key, spaced at least `min_interval` after the
    /// previous holder released
    pub async fn with_throttle<F, Fut, T>(&self, key: &str, min_interval: Duration, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = {
            let mut throttles = self.throttles.lock();
            throttles
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };

        let mut last_release = slot.lock().await;
        if let Some(previous) = *last_release {
            let ready_at = previous + min_interval;
            if ready_at > Instant::now() {
                debug!(key, "Throttling keyed call");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let value = f().await;
        *last_release = Some(Instant::now());
        value
    }

    /// Whether a holder has completed successfully for `key`
    pub fn is_settled(&self, key: &str) -> bool {
        let slot = self.slots.lock().get(key).cloned();
        match slot {
            Some(slot) => slot.try_lock().map(|state| state.settled).unwrap_or(false),
            None => false,
        }
    }

    /// Whether an entry is installed for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of installed entries
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn slot_for(&self, key: &str) -> Slot {
        let mut slots = self.slots.lock();
        slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(SlotState::default())))
            .clone()
    }

    fn evict(&self, key: &str, slot: &Slot) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }
}

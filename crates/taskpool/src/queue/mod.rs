//! Queue orchestrators
//!
//! A [`QueueOrchestrator`] turns application intents ("back up this chapter",
//! "download this archive") into worker pool tasks. It owns the per-item state
//! machine, deduplication, and the mutation lock that serializes every change
//! to queue state, while task submission runs outside the lock.
//!
//! Domain behaviour is supplied by a [`TransferHandler`]; see [`backup`] and
//! [`download`] for the two built-in handlers.
//!
//! ```text
//!  enqueue ──▶ [Queued] ──process_queue──▶ [Active] ──▶ submit ──▶ WorkerPool
//!                                              │
//!              removed ◀── reconcile / notify ◀┘ on_complete | on_error
//! ```

pub mod backup;
pub mod download;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::collaborators::{ArchiveEntry, Notification, ProgressEntry, ProgressSink};
use crate::manager::PoolManager;
use crate::worker::{
    PrepareFn, ReleaseHandle, ResourceClass, Task, TaskCallbacks, TaskError, TaskId,
    TaskProgress, UnitJob,
};

/// Status of an item inside a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Active,
}

/// How a queue activates its items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingPolicy {
    /// One active item at a time, in submission order
    OrderPreserving,
    /// Every queued item activated at once; the pool throttles
    FanOut,
}

/// Deduplication key of a queue item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Stable identity, e.g. a chapter id or remote file id
    pub identity: String,
    /// Provider and operation, e.g. `drive:backup`
    pub routing: String,
}

impl ItemKey {
    pub fn new(identity: impl Into<String>, routing: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            routing: routing.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.routing, self.identity)
    }
}

/// Item accepted by a [`QueueOrchestrator`]
///
/// Items carry a reference to their payload, never the payload itself.
pub trait QueueItem: Clone + Send + Sync + 'static {
    fn key(&self) -> ItemKey;

    /// Human-readable description shown in progress entries
    fn description(&self) -> String;
}

/// Everything the pool needs to run one item
pub struct TaskPlan<O> {
    estimated_memory_bytes: u64,
    resource_class: Option<ResourceClass>,
    prepare: PrepareFn<O>,
}

impl<O: Send + 'static> TaskPlan<O> {
    /// Plan whose job is produced lazily by `prepare`
    pub fn new<P, Fut>(prepare: P) -> Self
    where
        P: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Box<dyn UnitJob<O>>, TaskError>>
            + Send
            + 'static,
    {
        Self {
            estimated_memory_bytes: 0,
            resource_class: None,
            prepare: Box::new(move || prepare().boxed()),
        }
    }

    pub fn with_estimated_memory(mut self, bytes: u64) -> Self {
        self.estimated_memory_bytes = bytes;
        self
    }

    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = Some(class);
        self
    }

    fn into_task(self, id: TaskId, callbacks: Arc<dyn TaskCallbacks<O>>) -> Task<O> {
        let task = Task::from_prepare_fn(id, callbacks, self.prepare)
            .with_estimated_memory(self.estimated_memory_bytes);
        match self.resource_class {
            Some(class) => task.with_resource_class(class),
            None => task,
        }
    }
}

/// Domain behaviour plugged into a [`QueueOrchestrator`]
#[async_trait]
pub trait TransferHandler<I: QueueItem>: Send + Sync + 'static {
    /// Output produced by the unit job
    type Output: Send + 'static;

    /// Verb used in notifications and logs, e.g. `Backup`
    fn label(&self) -> &'static str;

    /// Pre-flight work run before the item's task is submitted
    async fn before_submit(&self, _item: &I) -> Result<(), TaskError> {
        Ok(())
    }

    /// Build the task plan for an item
    fn build_task(&self, item: &I) -> TaskPlan<Self::Output>;

    /// Reconcile catalog state after a successful job
    async fn reconcile(&self, item: &I, output: Self::Output) -> Result<(), TaskError>;
}

/// Output of the built-in transfer jobs
///
/// Backups and downloads share one worker pool, so they share one output type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutput {
    /// Archive uploaded to a remote provider
    Uploaded {
        remote_id: String,
        remote_path: String,
        size_bytes: u64,
    },
    /// Archive downloaded and decompressed
    Extracted { entries: Vec<ArchiveEntry> },
}

/// Point-in-time view of one queued item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub key: ItemKey,
    pub description: String,
    pub status: ItemStatus,
}

struct Slot<I> {
    key: ItemKey,
    item: I,
    status: ItemStatus,
}

struct QueueState<I> {
    items: VecDeque<Slot<I>>,
    /// Whether this queue currently holds a pool user registration
    registered: bool,
}

struct Inner<I: QueueItem, H: TransferHandler<I>> {
    name: String,
    policy: ProcessingPolicy,
    handler: Arc<H>,
    manager: Arc<PoolManager<H::Output>>,
    progress: Arc<dyn ProgressSink>,
    state: Mutex<QueueState<I>>,
    idle: watch::Sender<bool>,
}

/// In-memory work queue feeding the shared worker pool
///
/// Cloning is cheap; clones share the same queue.
pub struct QueueOrchestrator<I: QueueItem, H: TransferHandler<I>> {
    inner: Arc<Inner<I, H>>,
}

impl<I: QueueItem, H: TransferHandler<I>> Clone for QueueOrchestrator<I, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: QueueItem, H: TransferHandler<I>> QueueOrchestrator<I, H> {
    pub fn new(
        name: impl Into<String>,
        policy: ProcessingPolicy,
        handler: Arc<H>,
        manager: Arc<PoolManager<H::Output>>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                policy,
                handler,
                manager,
                progress,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    registered: false,
                }),
                idle,
            }),
        }
    }

    /// Add an item and trigger processing
    ///
    /// Returns `false` without doing anything if an item with the same key is
    /// already queued or active.
    pub async fn enqueue(&self, item: I) -> bool {
        let key = item.key();
        let description = item.description();
        {
            let mut state = self.inner.state.lock().await;
            if state.items.iter().any(|slot| slot.key == key) {
                debug!(queue = %self.inner.name, %key, "Ignoring duplicate item");
                return false;
            }
            state.items.push_back(Slot {
                key: key.clone(),
                item,
                status: ItemStatus::Queued,
            });
            self.inner.idle.send_replace(false);
            debug!(queue = %self.inner.name, %key, len = state.items.len(), "Item queued");
        }

        self.inner
            .progress
            .update(ProgressEntry::new(key.to_string(), description, 0, "Queued"));
        self.inner.process_queue().await;
        true
    }

    /// Activate items according to the queue's policy and submit them
    pub async fn process_queue(&self) {
        self.inner.process_queue().await;
    }

    /// Resolves once the queue is empty
    pub async fn wait_until_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // Sender lives in `inner`, which we hold
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.state.lock().await.items.is_empty()
    }

    /// Items in submission order
    pub async fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner
            .state
            .lock()
            .await
            .items
            .iter()
            .map(|slot| QueueEntry {
                key: slot.key.clone(),
                description: slot.item.description(),
                status: slot.status,
            })
            .collect()
    }

    pub async fn status_of(&self, key: &ItemKey) -> Option<ItemStatus> {
        self.inner
            .state
            .lock()
            .await
            .items
            .iter()
            .find(|slot| &slot.key == key)
            .map(|slot| slot.status)
    }

    pub fn policy(&self) -> ProcessingPolicy {
        self.inner.policy
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }
}

impl<I: QueueItem, H: TransferHandler<I>> Inner<I, H> {
    fn process_queue(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let this = Arc::clone(self);
        async move {
            let activated = {
                let mut state = this.state.lock().await;
                let picked: Vec<usize> = match this.policy {
                    ProcessingPolicy::OrderPreserving => {
                        if state.items.iter().any(|s| s.status == ItemStatus::Active) {
                            Vec::new()
                        } else {
                            state
                                .items
                                .iter()
                                .position(|s| s.status == ItemStatus::Queued)
                                .into_iter()
                                .collect()
                        }
                    }
                    ProcessingPolicy::FanOut => state
                        .items
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.status == ItemStatus::Queued)
                        .map(|(index, _)| index)
                        .collect(),
                };

                if picked.is_empty() {
                    return;
                }

                if !state.registered {
                    state.registered = true;
                    let users = this.manager.increment_users();
                    debug!(queue = %this.name, users, "Queue registered as pool user");
                }

                picked
                    .into_iter()
                    .map(|index| {
                        let slot = &mut state.items[index];
                        slot.status = ItemStatus::Active;
                        slot.item.clone()
                    })
                    .collect::<Vec<_>>()
            };

            debug!(queue = %this.name, count = activated.len(), "Activated items");
            join_all(activated.into_iter().map(|item| this.submit(item))).await;
        }
        .boxed()
    }

    async fn submit(self: &Arc<Self>, item: I) {
        let key = item.key();

        if let Err(error) = self.handler.before_submit(&item).await {
            self.fail(&key, &item, error).await;
            return;
        }

        let pool = self.manager.acquire_pool().await;
        let callbacks: Arc<dyn TaskCallbacks<H::Output>> = Arc::new(ItemCallbacks {
            queue: Arc::clone(self),
            key: key.clone(),
            item: item.clone(),
        });
        let task_id = TaskId::generate(&key.routing);
        let task = self
            .handler
            .build_task(&item)
            .into_task(task_id.clone(), callbacks);

        debug!(queue = %self.name, %key, %task_id, "Submitting task");
        if let Err(err) = pool.add_task(task) {
            self.fail(&key, &item, TaskError::execution(err)).await;
        }
    }

    async fn succeed(self: &Arc<Self>, key: &ItemKey, item: &I) {
        info!(queue = %self.name, %key, "{} finished", self.handler.label());
        self.progress.notify(Notification::info(
            format!("{} finished", self.handler.label()),
            item.description(),
        ));
        self.finish(key).await;
    }

    async fn fail(self: &Arc<Self>, key: &ItemKey, item: &I, error: TaskError) {
        warn!(queue = %self.name, %key, %error, "{} failed", self.handler.label());
        self.progress.notify(Notification::error(
            format!("{} failed", self.handler.label()),
            format!("{}: {}", item.description(), error),
        ));
        self.finish(key).await;
    }

    /// Remove a terminal item and advance the queue
    async fn finish(self: &Arc<Self>, key: &ItemKey) {
        let drained = {
            let mut state = self.state.lock().await;
            if let Some(index) = state.items.iter().position(|slot| &slot.key == key) {
                state.items.remove(index);
            }

            if state.items.is_empty() {
                if state.registered {
                    state.registered = false;
                    let users = self.manager.decrement_users();
                    debug!(queue = %self.name, users, "Queue unregistered as pool user");
                }
                self.idle.send_replace(true);
                true
            } else {
                false
            }
        };

        self.progress.remove(&key.to_string());
        if !drained {
            self.process_queue().await;
        }
    }
}

/// Routes pool callbacks for one item back into its queue
struct ItemCallbacks<I: QueueItem, H: TransferHandler<I>> {
    queue: Arc<Inner<I, H>>,
    key: ItemKey,
    item: I,
}

impl<I: QueueItem, H: TransferHandler<I>> TaskCallbacks<H::Output> for ItemCallbacks<I, H> {
    fn on_progress(&self, _task_id: &TaskId, progress: TaskProgress) {
        self.queue.progress.update(ProgressEntry::new(
            self.key.to_string(),
            self.item.description(),
            progress.percent,
            progress.status,
        ));
    }

    fn on_complete(&self, task_id: &TaskId, output: H::Output, release: ReleaseHandle) {
        debug!(%task_id, key = %self.key, "Task completed, reconciling");
        let queue = Arc::clone(&self.queue);
        let key = self.key.clone();
        let item = self.item.clone();
        tokio::spawn(async move {
            let reconciled = queue.handler.reconcile(&item, output).await;
            release.release();
            match reconciled {
                Ok(()) => queue.succeed(&key, &item).await,
                Err(error) => queue.fail(&key, &item, error).await,
            }
        });
    }

    fn on_error(&self, _task_id: &TaskId, error: TaskError) {
        let queue = Arc::clone(&self.queue);
        let key = self.key.clone();
        let item = self.item.clone();
        tokio::spawn(async move { queue.fail(&key, &item, error).await });
    }
}

//! Task definitions for the worker pool
//!
//! A [`Task`] carries everything the pool needs to admit, dispatch and report
//! on one unit of work: an id, a memory estimate, an optional resource class,
//! a lazy `prepare` producer and the callbacks that receive unit messages.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier of a task within a pool
///
/// Used to route unit messages back to the task's callbacks. Must not collide
/// with another queued or active task in the same pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a unique id with a readable prefix (e.g. `backup-0192...`)
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Secondary concurrency dimension with its own ceiling
///
/// For example "provider X uploads: max 8 concurrent", independent of how
/// many units the pool owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceClass {
    /// Class name shared by all tasks competing for the ceiling
    pub name: String,

    /// Maximum number of admitted tasks of this class (at least 1)
    pub concurrency_limit: usize,
}

impl ResourceClass {
    pub fn new(name: impl Into<String>, concurrency_limit: usize) -> Self {
        Self {
            name: name.into(),
            concurrency_limit: concurrency_limit.max(1),
        }
    }
}

/// Progress reported by a unit while executing a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Completion percentage, 0-100
    pub percent: u8,

    /// Human-readable status text
    pub status: String,
}

impl TaskProgress {
    pub fn new(percent: u8, status: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            status: status.into(),
        }
    }
}

/// Errors delivered to [`TaskCallbacks::on_error`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Loading the task payload failed before any unit work began
    #[error("failed to prepare task data: {0}")]
    Prepare(String),

    /// The unit reported a failure (network, auth, codec, ...)
    #[error("{0}")]
    Execution(String),

    /// The job panicked inside its unit
    #[error("worker unit panicked: {0}")]
    Panicked(String),

    /// Another queued or active task already uses this id
    #[error("task {0} is already queued or active in this pool")]
    DuplicateTask(TaskId),

    /// The unit assigned to the task is no longer running
    #[error("worker unit {0} is not running")]
    UnitUnavailable(usize),

    /// The pool was terminated
    #[error("worker pool was terminated")]
    PoolTerminated,
}

impl TaskError {
    /// Create a preparation error
    pub fn prepare(message: impl fmt::Display) -> Self {
        Self::Prepare(message.to_string())
    }

    /// Create an execution error
    pub fn execution(message: impl fmt::Display) -> Self {
        Self::Execution(message.to_string())
    }
}

/// Result of a unit job
pub type TaskResult<O> = Result<O, TaskError>;

/// Receives unit messages for one task
///
/// Invoked from the pool's coordinator; implementations must not block.
/// Long follow-up work should be spawned.
pub trait TaskCallbacks<O>: Send + Sync {
    /// Progress message forwarded verbatim from the unit
    fn on_progress(&self, _task_id: &TaskId, _progress: TaskProgress) {}

    /// Successful completion
    ///
    /// The task's memory reservation and resource-class slot stay held until
    /// `release` is invoked or dropped.
    fn on_complete(&self, task_id: &TaskId, output: O, release: ReleaseHandle);

    /// Terminal failure; the pool has already released the task's resources
    fn on_error(&self, task_id: &TaskId, error: TaskError);
}

/// Work executed inside a worker unit
#[async_trait]
pub trait UnitJob<O>: Send {
    /// Run the job to completion
    async fn run(self: Box<Self>, ctx: UnitContext) -> TaskResult<O>;
}

/// Future returned by a task's `prepare` producer
pub type PrepareFuture<O> = BoxFuture<'static, TaskResult<Box<dyn UnitJob<O>>>>;

/// Lazy producer of a task's job, invoked once a unit is about to run it
pub type PrepareFn<O> = Box<dyn FnOnce() -> PrepareFuture<O> + Send>;

/// Job built from a closure
pub struct FnJob<O> {
    run: Box<dyn FnOnce(UnitContext) -> BoxFuture<'static, TaskResult<O>> + Send>,
}

/// Wrap a closure as a [`UnitJob`]
///
/// # Example
///
/// ```
/// use inkshelf_taskpool::worker::{job_fn, TaskError, UnitJob};
///
/// let job: Box<dyn UnitJob<u32>> = job_fn(|ctx| async move {
///     ctx.report_progress(50, "halfway")?;
///     Ok::<_, TaskError>(42)
/// });
/// ```
pub fn job_fn<O, F, Fut>(f: F) -> Box<dyn UnitJob<O>>
where
    O: Send + 'static,
    F: FnOnce(UnitContext) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<O>> + Send + 'static,
{
    Box::new(FnJob {
        run: Box::new(move |ctx| f(ctx).boxed()),
    })
}

#[async_trait]
impl<O: Send + 'static> UnitJob<O> for FnJob<O> {
    async fn run(self: Box<Self>, ctx: UnitContext) -> TaskResult<O> {
        (self.run)(ctx).await
    }
}

type ProgressFn = Arc<dyn Fn(TaskProgress) -> TaskResult<()> + Send + Sync>;

/// Context handed to a job while it runs inside a unit
///
/// Provides progress reporting back to the coordinator and cancellation
/// detection when the pool is terminated.
#[derive(Clone)]
pub struct UnitContext {
    task_id: TaskId,
    unit_index: usize,
    progress: ProgressFn,
    cancel: CancellationToken,
}

impl UnitContext {
    pub(crate) fn new(
        task_id: TaskId,
        unit_index: usize,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            unit_index,
            progress,
            cancel,
        }
    }

    /// Task being executed
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Index of the executing unit
    pub fn unit_index(&self) -> usize {
        self.unit_index
    }

    /// Report progress to the task's `on_progress` callback
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::PoolTerminated`] once the pool has shut down.
    pub fn report_progress(&self, percent: u8, status: impl Into<String>) -> TaskResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::PoolTerminated);
        }
        (self.progress)(TaskProgress::new(percent, status))
    }

    /// Check if the pool was terminated
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the pool is terminated
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("task_id", &self.task_id)
            .field("unit_index", &self.unit_index)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Releases a completed task's memory reservation and class slot
///
/// Releasing happens exactly once: either through [`ReleaseHandle::release`]
/// or when the handle is dropped.
pub struct ReleaseHandle {
    task_id: TaskId,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ReleaseHandle {
    pub(crate) fn new(task_id: TaskId, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            task_id,
            release: Some(Box::new(release)),
        }
    }

    /// Task this handle belongs to
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Release the reservation and let the pool admit more work
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("task_id", &self.task_id)
            .field("released", &self.release.is_none())
            .finish()
    }
}

/// Unit of work submitted to the [`WorkerPool`](super::WorkerPool)
///
/// # Example
///
/// ```ignore
/// let task = Task::new("backup-1", callbacks, || async move {
///     let files = catalog.load_chapter_files("ch-1").await?;
///     Ok(job_fn(move |ctx| async move { compress_and_upload(ctx, files).await }))
/// })
/// .with_estimated_memory(64 * 1024 * 1024)
/// .with_resource_class(ResourceClass::new("drive:upload", 8));
/// ```
pub struct Task<O> {
    pub(crate) id: TaskId,
    pub(crate) estimated_memory_bytes: u64,
    pub(crate) resource_class: Option<ResourceClass>,
    pub(crate) prepare: PrepareFn<O>,
    pub(crate) callbacks: Arc<dyn TaskCallbacks<O>>,
}

impl<O: Send + 'static> Task<O> {
    /// Create a task whose job is produced lazily by `prepare`
    pub fn new<P, Fut>(
        id: impl Into<TaskId>,
        callbacks: Arc<dyn TaskCallbacks<O>>,
        prepare: P,
    ) -> Self
    where
        P: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<Box<dyn UnitJob<O>>>> + Send + 'static,
    {
        Self::from_prepare_fn(id, callbacks, Box::new(move || prepare().boxed()))
    }

    /// Create a task from an already boxed producer
    pub fn from_prepare_fn(
        id: impl Into<TaskId>,
        callbacks: Arc<dyn TaskCallbacks<O>>,
        prepare: PrepareFn<O>,
    ) -> Self {
        Self {
            id: id.into(),
            estimated_memory_bytes: 0,
            resource_class: None,
            prepare,
            callbacks,
        }
    }

    /// Set the memory estimate used for admission
    pub fn with_estimated_memory(mut self, bytes: u64) -> Self {
        self.estimated_memory_bytes = bytes;
        self
    }

    /// Set the resource class
    pub fn with_resource_class(mut self, class: ResourceClass) -> Self {
        self.resource_class = Some(class);
        self
    }
}

impl<O> Task<O> {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn estimated_memory_bytes(&self) -> u64 {
        self.estimated_memory_bytes
    }

    pub fn resource_class(&self) -> Option<&ResourceClass> {
        self.resource_class.as_ref()
    }
}

impl<O> fmt::Debug for Task<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("estimated_memory_bytes", &self.estimated_memory_bytes)
            .field("resource_class", &self.resource_class)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_task_id_generate_is_unique() {
        let a = TaskId::generate("backup");
        let b = TaskId::generate("backup");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("backup-"));
    }

    #[test]
    fn test_resource_class_limit_is_at_least_one() {
        let class = ResourceClass::new("drive:upload", 0);
        assert_eq!(class.concurrency_limit, 1);
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(TaskProgress::new(250, "done").percent, 100);
    }

    #[test]
    fn test_release_handle_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = ReleaseHandle::new(TaskId::new("t"), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_handle_releases_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        {
            let _handle = ReleaseHandle::new(TaskId::new("t"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    fn noop_progress() -> ProgressFn {
        Arc::new(|_: TaskProgress| -> TaskResult<()> { Ok(()) })
    }

    #[tokio::test]
    async fn test_report_progress_after_cancel() {
        let token = CancellationToken::new();
        let ctx = UnitContext::new(TaskId::new("t"), 0, noop_progress(), token.clone());
        assert!(ctx.report_progress(10, "working").is_ok());

        token.cancel();
        assert_eq!(
            ctx.report_progress(20, "working"),
            Err(TaskError::PoolTerminated)
        );
        ctx.cancelled().await;
    }

    #[tokio::test]
    async fn test_job_fn_runs_closure() {
        let job = job_fn(|ctx: UnitContext| async move { Ok(ctx.unit_index() + 1) });
        let ctx = UnitContext::new(
            TaskId::new("t"),
            2,
            noop_progress(),
            CancellationToken::new(),
        );
        assert_eq!(job.run(ctx).await, Ok(3));
    }
}

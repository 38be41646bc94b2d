//! Worker pool for task execution
//!
//! Admits tasks in strict FIFO order against the memory ledger and per-class
//! ceilings, dispatches them to idle units and routes unit messages back to
//! each task's callbacks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::task::{
    ReleaseHandle, Task, TaskCallbacks, TaskError, TaskId, TaskProgress, TaskResult, UnitContext,
};
use super::unit::{Assignment, WorkerUnit};
use crate::ledger::{MemoryLedger, ReservationKey};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Pool name used in logs
    pub name: String,

    /// Number of worker units, fixed for the pool's lifetime
    pub unit_count: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "transfer".to_string(),
            unit_count: 4,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with the given number of units
    pub fn new(unit_count: usize) -> Self {
        Self::default().with_unit_count(unit_count)
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of units
    pub fn with_unit_count(mut self, count: usize) -> Self {
        self.unit_count = count.max(1);
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Units are alive and tasks are accepted
    Running,
    /// All units were destroyed; no further tasks are accepted
    Terminated,
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    /// The pool was terminated
    #[error("worker pool has been terminated")]
    Terminated,
}

/// Messages processed by the coordinator
pub(crate) enum Command<O> {
    Submit(Task<O>),
    Progress {
        task_id: TaskId,
        progress: TaskProgress,
    },
    UnitFinished {
        unit: usize,
        task_id: TaskId,
        outcome: TaskResult<O>,
    },
    Release(TaskId),
}

#[derive(Default)]
struct PoolCounters {
    active: AtomicUsize,
    queued: AtomicUsize,
    busy_units: AtomicUsize,
}

/// Pool of isolated worker units fed by a FIFO admission queue
///
/// All queue and assignment state is owned by a single coordinator task; the
/// public handle only sends it commands and reads counters.
///
/// # Example
///
/// ```ignore
/// use inkshelf_taskpool::worker::{WorkerPool, WorkerPoolConfig, Task, job_fn};
///
/// let pool = WorkerPool::new(WorkerPoolConfig::new(4), ledger.clone());
///
/// pool.add_task(
///     Task::new("compress-1", callbacks, || async move {
///         Ok(job_fn(|ctx| async move {
///             ctx.report_progress(50, "Compressing")?;
///             Ok(archive_bytes())
///         }))
///     })
///     .with_estimated_memory(32 * 1024 * 1024),
/// )?;
///
/// // Later, when nobody needs the pool any more
/// pool.terminate();
/// ```
pub struct WorkerPool<O> {
    id: Uuid,
    config: WorkerPoolConfig,
    ledger: Arc<MemoryLedger>,
    commands: mpsc::UnboundedSender<Command<O>>,
    counters: Arc<PoolCounters>,
    shutdown: CancellationToken,
    terminated: AtomicBool,
    coordinator: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<O: Send + 'static> WorkerPool<O> {
    /// Create a pool and spawn its units
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: WorkerPoolConfig, ledger: Arc<MemoryLedger>) -> Self {
        let id = Uuid::now_v7();
        let unit_count = config.unit_count.max(1);
        let (commands, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let counters = Arc::new(PoolCounters::default());

        let units = (0..unit_count)
            .map(|index| WorkerUnit::spawn(index, commands.clone(), shutdown.clone()))
            .collect();

        let coordinator = Coordinator {
            pool_id: id,
            ledger: Arc::clone(&ledger),
            units,
            queue: VecDeque::new(),
            active: HashMap::new(),
            class_load: HashMap::new(),
            commands: commands.clone(),
            counters: Arc::clone(&counters),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(coordinator.run(rx));

        info!(
            pool_id = %id,
            name = %config.name,
            unit_count,
            budget_bytes = ledger.budget_bytes(),
            "Worker pool started"
        );

        Self {
            id,
            config: WorkerPoolConfig {
                unit_count,
                ..config
            },
            ledger,
            commands,
            counters,
            shutdown,
            terminated: AtomicBool::new(false),
            coordinator: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Append a task to the admission queue
    ///
    /// # Errors
    ///
    /// Returns [`WorkerPoolError::Terminated`] after [`terminate`](Self::terminate).
    pub fn add_task(&self, task: Task<O>) -> Result<(), WorkerPoolError> {
        if self.is_terminated() {
            return Err(WorkerPoolError::Terminated);
        }
        debug!(pool_id = %self.id, task_id = %task.id, "Task submitted");
        self.commands
            .send(Command::Submit(task))
            .map_err(|_| WorkerPoolError::Terminated)
    }
}

impl<O> WorkerPool<O> {
    /// Destroy all units and clear all queues
    ///
    /// Callbacks not yet delivered are never delivered. Idempotent.
    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(handle) = self.coordinator.lock().take() {
            handle.abort();
        }
        let released = self.ledger.release_pool(self.id);
        self.counters.active.store(0, Ordering::Relaxed);
        self.counters.queued.store(0, Ordering::Relaxed);
        self.counters.busy_units.store(0, Ordering::Relaxed);
        info!(released_bytes = released, "Worker pool terminated");
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Number of units, fixed for the pool's lifetime
    pub fn unit_count(&self) -> usize {
        self.config.unit_count
    }

    /// Tasks admitted and not yet released
    pub fn active_count(&self) -> usize {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Tasks waiting for admission
    pub fn queued_count(&self) -> usize {
        self.counters.queued.load(Ordering::Relaxed)
    }

    /// Units currently running a task
    pub fn busy_units(&self) -> usize {
        self.counters.busy_units.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> WorkerPoolStatus {
        if self.is_terminated() {
            WorkerPoolStatus::Terminated
        } else {
            WorkerPoolStatus::Running
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl<O> Drop for WorkerPool<O> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Per-task state inside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Dispatched,
    Completed,
    Errored,
}

struct ActiveTask<O> {
    callbacks: Arc<dyn TaskCallbacks<O>>,
    resource_class: Option<String>,
    unit: Option<usize>,
    state: TaskState,
}

/// Owner of all pool state; runs as a single task
struct Coordinator<O> {
    pool_id: Uuid,
    ledger: Arc<MemoryLedger>,
    units: Vec<WorkerUnit<O>>,
    queue: VecDeque<Task<O>>,
    active: HashMap<TaskId, ActiveTask<O>>,
    class_load: HashMap<String, usize>,
    commands: mpsc::UnboundedSender<Command<O>>,
    counters: Arc<PoolCounters>,
    shutdown: CancellationToken,
}

impl<O: Send + 'static> Coordinator<O> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<O>>) {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
            self.publish_counters();
        }
        self.teardown();
    }

    fn handle(&mut self, command: Command<O>) {
        match command {
            Command::Submit(task) => self.submit(task),
            Command::Progress { task_id, progress } => {
                match self.active.get(&task_id) {
                    Some(active) if active.state == TaskState::Dispatched => {
                        active.callbacks.on_progress(&task_id, progress);
                    }
                    _ => debug!(%task_id, "Ignoring progress for inactive task"),
                }
            }
            Command::UnitFinished {
                unit,
                task_id,
                outcome,
            } => {
                self.unit_finished(unit, task_id, outcome);
                self.drain_queue();
            }
            Command::Release(task_id) => {
                self.release(&task_id);
                self.drain_queue();
            }
        }
    }

    fn submit(&mut self, task: Task<O>) {
        let duplicate = self.active.contains_key(&task.id)
            || self.queue.iter().any(|queued| queued.id == task.id);
        if duplicate {
            warn!(pool_id = %self.pool_id, task_id = %task.id, "Rejecting duplicate task id");
            let error = TaskError::DuplicateTask(task.id.clone());
            task.callbacks.on_error(&task.id, error);
            return;
        }
        self.queue.push_back(task);
        self.drain_queue();
    }

    /// Admit and dispatch tasks from the head of the queue
    ///
    /// Stops at the first task that cannot be admitted; later tasks are never
    /// dispatched ahead of it.
    fn drain_queue(&mut self) {
        while let Some(head) = self.queue.front() {
            let Some(unit) = self.units.iter().position(WorkerUnit::is_idle) else {
                break;
            };

            if !self.ledger.can_admit(!self.active.is_empty()) {
                debug!(
                    task_id = %head.id,
                    current_bytes = self.ledger.current_bytes(),
                    "Head task waiting for memory"
                );
                break;
            }

            if let Some(class) = &head.resource_class {
                let load = self.class_load.get(&class.name).copied().unwrap_or(0);
                if load >= class.concurrency_limit {
                    debug!(
                        task_id = %head.id,
                        class = %class.name,
                        load,
                        "Head task waiting for resource class"
                    );
                    break;
                }
            }

            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(unit, task);
        }
    }

    fn dispatch(&mut self, unit: usize, task: Task<O>) {
        let Task {
            id,
            estimated_memory_bytes,
            resource_class,
            prepare,
            callbacks,
        } = task;

        self.ledger.reserve(
            ReservationKey::new(self.pool_id, id.clone()),
            estimated_memory_bytes,
        );
        let class_name = resource_class.map(|class| class.name);
        if let Some(name) = &class_name {
            *self.class_load.entry(name.clone()).or_insert(0) += 1;
        }

        self.active.insert(
            id.clone(),
            ActiveTask {
                callbacks: Arc::clone(&callbacks),
                resource_class: class_name,
                unit: Some(unit),
                state: TaskState::Dispatched,
            },
        );

        let progress_tx = self.commands.clone();
        let progress_id = id.clone();
        let ctx = UnitContext::new(
            id.clone(),
            unit,
            Arc::new(move |progress: TaskProgress| {
                progress_tx
                    .send(Command::Progress {
                        task_id: progress_id.clone(),
                        progress,
                    })
                    .map_err(|_| TaskError::PoolTerminated)
            }),
            self.shutdown.child_token(),
        );

        debug!(
            pool_id = %self.pool_id,
            task_id = %id,
            unit,
            estimated_memory_bytes,
            "Dispatching task"
        );

        let assignment = Assignment {
            task_id: id.clone(),
            prepare,
            ctx,
        };
        if self.units[unit].assign(assignment).is_err() {
            warn!(task_id = %id, unit, "Worker unit is not running");
            if let Some(active) = self.active.get_mut(&id) {
                active.state = TaskState::Errored;
                active.unit = None;
            }
            callbacks.on_error(&id, TaskError::UnitUnavailable(unit));
            self.release(&id);
        }
    }

    fn unit_finished(&mut self, unit: usize, task_id: TaskId, outcome: TaskResult<O>) {
        if let Some(worker) = self.units.get_mut(unit) {
            if !worker.finish(&task_id) {
                debug!(unit = worker.index(), current = ?worker.current(), %task_id, "Unit finished unexpected task");
            }
        }

        let Some(active) = self.active.get_mut(&task_id) else {
            debug!(%task_id, "Ignoring result for inactive task");
            return;
        };
        if active.state != TaskState::Dispatched {
            return;
        }
        active.unit = None;

        match outcome {
            Ok(output) => {
                active.state = TaskState::Completed;
                debug!(%task_id, "Task completed");
                let commands = self.commands.clone();
                let release_id = task_id.clone();
                let release = ReleaseHandle::new(task_id.clone(), move || {
                    let _ = commands.send(Command::Release(release_id));
                });
                active.callbacks.on_complete(&task_id, output, release);
            }
            Err(error) => {
                active.state = TaskState::Errored;
                warn!(%task_id, %error, "Task failed");
                active.callbacks.on_error(&task_id, error);
                self.release(&task_id);
            }
        }
    }

    /// Release a task's reservation and class slot exactly once
    fn release(&mut self, task_id: &TaskId) {
        let Some(active) = self.active.remove(task_id) else {
            return;
        };
        if let Some(unit) = active.unit {
            if let Some(worker) = self.units.get_mut(unit) {
                worker.finish(task_id);
            }
        }
        self.ledger
            .release(&ReservationKey::new(self.pool_id, task_id.clone()));
        if let Some(name) = active.resource_class {
            if let Some(load) = self.class_load.get_mut(&name) {
                *load = load.saturating_sub(1);
                if *load == 0 {
                    self.class_load.remove(&name);
                }
            }
        }
        debug!(%task_id, "Task released");
    }

    fn publish_counters(&self) {
        self.counters
            .active
            .store(self.active.len(), Ordering::Relaxed);
        self.counters
            .queued
            .store(self.queue.len(), Ordering::Relaxed);
        let busy = self.units.iter().filter(|unit| !unit.is_idle()).count();
        self.counters.busy_units.store(busy, Ordering::Relaxed);
    }

    fn teardown(&mut self) {
        for unit in self.units.drain(..) {
            unit.destroy();
        }
        self.queue.clear();
        self.active.clear();
        self.class_load.clear();
        self.ledger.release_pool(self.pool_id);
        debug!(pool_id = %self.pool_id, "Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{job_fn, ResourceClass};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    #[derive(Debug, PartialEq)]
    enum Event {
        Progress(String, u8),
        Complete(String, u32),
        Error(String, TaskError),
    }

    /// Callbacks that forward events to a channel and release immediately
    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
        hold_release: parking_lot::Mutex<Vec<ReleaseHandle>>,
        keep_reservations: bool,
    }

    impl Recorder {
        fn new(keep_reservations: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
            let (events, rx) = mpsc::unbounded_channel();
            let recorder = Arc::new(Self {
                events,
                hold_release: parking_lot::Mutex::new(Vec::new()),
                keep_reservations,
            });
            (recorder, rx)
        }

        fn release_all(&self) {
            for handle in self.hold_release.lock().drain(..) {
                handle.release();
            }
        }
    }

    impl TaskCallbacks<u32> for Recorder {
        fn on_progress(&self, task_id: &TaskId, progress: TaskProgress) {
            let _ = self
                .events
                .send(Event::Progress(task_id.to_string(), progress.percent));
        }

        fn on_complete(&self, task_id: &TaskId, output: u32, release: ReleaseHandle) {
            if self.keep_reservations {
                self.hold_release.lock().push(release);
            } else {
                release.release();
            }
            let _ = self.events.send(Event::Complete(task_id.to_string(), output));
        }

        fn on_error(&self, task_id: &TaskId, error: TaskError) {
            let _ = self.events.send(Event::Error(task_id.to_string(), error));
        }
    }

    fn simple_task(id: &str, value: u32, callbacks: Arc<Recorder>) -> Task<u32> {
        Task::new(id, callbacks, move || async move {
            Ok(job_fn(move |_ctx| async move { Ok(value) }))
        })
    }

    fn gated_task(
        id: &str,
        estimate: u64,
        gate: Arc<Semaphore>,
        order: Arc<parking_lot::Mutex<Vec<String>>>,
        callbacks: Arc<Recorder>,
    ) -> Task<u32> {
        let name = id.to_string();
        Task::new(id, callbacks, move || async move {
            order.lock().push(name);
            Ok(job_fn(move |_ctx| async move {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| TaskError::execution("gate closed"))?;
                Ok(0)
            }))
        })
        .with_estimated_memory(estimate)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for pool event")
            .expect("event channel closed")
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.name, "transfer");
        assert_eq!(config.unit_count, 4);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new(0).with_name("downloads");
        assert_eq!(config.unit_count, 1);
        assert_eq!(config.name, "downloads");
    }

    #[tokio::test]
    async fn test_task_completes_and_releases() {
        let ledger = Arc::new(MemoryLedger::new(1_000));
        let pool = WorkerPool::new(WorkerPoolConfig::new(2), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);

        pool.add_task(simple_task("a", 7, recorder.clone()).with_estimated_memory(100))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, Event::Complete("a".into(), 7));
        eventually(|| ledger.current_bytes() == 0 && pool.active_count() == 0).await;
        assert_eq!(ledger.reservation_count(), 0);
        assert_eq!(pool.unit_count(), 2);
    }

    #[tokio::test]
    async fn test_progress_is_forwarded() {
        let ledger = Arc::new(MemoryLedger::default());
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), ledger);
        let (recorder, mut rx) = Recorder::new(false);

        let task: Task<u32> = Task::new("p", recorder.clone(), || async {
            Ok(job_fn(|ctx: UnitContext| async move {
                ctx.report_progress(25, "Compressing")?;
                ctx.report_progress(75, "Uploading")?;
                Ok(1)
            }))
        });
        pool.add_task(task).unwrap();

        assert_eq!(next_event(&mut rx).await, Event::Progress("p".into(), 25));
        assert_eq!(next_event(&mut rx).await, Event::Progress("p".into(), 75));
        assert_eq!(next_event(&mut rx).await, Event::Complete("p".into(), 1));
    }

    #[tokio::test]
    async fn test_fifo_admission_with_head_of_line_blocking() {
        // A 1-byte budget means only one task is admitted at a time
        let ledger = Arc::new(MemoryLedger::new(1));
        let pool = WorkerPool::new(WorkerPoolConfig::new(4), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let ids = ["big", "small-1", "small-2", "small-3"];
        let estimates = [10_000, 2, 2, 2];
        for (id, estimate) in ids.iter().zip(estimates) {
            pool.add_task(gated_task(
                id,
                estimate,
                gate.clone(),
                order.clone(),
                recorder.clone(),
            ))
            .unwrap();
        }

        // The oversized head runs alone; nothing overtakes it
        eventually(|| pool.active_count() == 1 && pool.queued_count() == 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*order.lock(), vec!["big".to_string()]);

        for _ in 0..ids.len() {
            gate.add_permits(1);
            next_event(&mut rx).await;
        }

        assert_eq!(
            *order.lock(),
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>()
        );
        eventually(|| ledger.current_bytes() == 0).await;
    }

    #[tokio::test]
    async fn test_oversized_task_runs_when_idle() {
        let ledger = Arc::new(MemoryLedger::new(10));
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);

        pool.add_task(simple_task("huge", 9, recorder).with_estimated_memory(1 << 30))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, Event::Complete("huge".into(), 9));
    }

    #[tokio::test]
    async fn test_reservation_held_until_release() {
        let ledger = Arc::new(MemoryLedger::new(100));
        let pool = WorkerPool::new(WorkerPoolConfig::new(2), ledger.clone());
        let (recorder, mut rx) = Recorder::new(true);

        pool.add_task(simple_task("first", 1, recorder.clone()).with_estimated_memory(150))
            .unwrap();
        assert_eq!(next_event(&mut rx).await, Event::Complete("first".into(), 1));

        // Still reserved, over budget: the second task must wait
        pool.add_task(simple_task("second", 2, recorder.clone()).with_estimated_memory(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ledger.current_bytes(), 150);
        assert_eq!(pool.queued_count(), 1);

        recorder.release_all();
        assert_eq!(next_event(&mut rx).await, Event::Complete("second".into(), 2));
        recorder.release_all();
        eventually(|| ledger.current_bytes() == 0 && ledger.reservation_count() == 0).await;
    }

    #[tokio::test]
    async fn test_resource_class_ceiling() {
        let ledger = Arc::new(MemoryLedger::default());
        let pool = WorkerPool::new(WorkerPoolConfig::new(4), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);
        let gate = Arc::new(Semaphore::new(0));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..4u32 {
            let gate = gate.clone();
            let running = running.clone();
            let peak = peak.clone();
            let task: Task<u32> = Task::new(format!("upload-{i}"), recorder.clone(), move || async move {
                Ok(job_fn(move |_ctx| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|_| TaskError::execution("gate closed"))?;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }))
            })
            .with_resource_class(ResourceClass::new("drive:upload", 2));
            pool.add_task(task).unwrap();
        }

        eventually(|| running.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(running.load(Ordering::SeqCst), 2);
        assert_eq!(pool.queued_count(), 2);

        gate.add_permits(4);
        for _ in 0..4 {
            assert!(matches!(next_event(&mut rx).await, Event::Complete(_, _)));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_job_error_releases_reservation() {
        let ledger = Arc::new(MemoryLedger::new(1_000));
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);

        let task: Task<u32> = Task::new("fails", recorder.clone(), || async {
            Ok(job_fn(|_ctx| async { Err::<u32, _>(TaskError::execution("auth expired")) }))
        })
        .with_estimated_memory(400);
        pool.add_task(task).unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            Event::Error("fails".into(), TaskError::execution("auth expired"))
        );
        eventually(|| ledger.current_bytes() == 0 && pool.active_count() == 0).await;
    }

    #[tokio::test]
    async fn test_prepare_error_releases_reservation() {
        let ledger = Arc::new(MemoryLedger::new(1_000));
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);

        let task: Task<u32> = Task::new("no-data", recorder.clone(), || async {
            Err(TaskError::prepare("chapter missing from catalog"))
        })
        .with_estimated_memory(400);
        pool.add_task(task).unwrap();
        pool.add_task(simple_task("next", 3, recorder.clone())).unwrap();

        assert!(matches!(
            next_event(&mut rx).await,
            Event::Error(id, TaskError::Prepare(_)) if id == "no-data"
        ));
        assert_eq!(next_event(&mut rx).await, Event::Complete("next".into(), 3));
        eventually(|| ledger.current_bytes() == 0).await;
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let ledger = Arc::new(MemoryLedger::default());
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);

        let task: Task<u32> = Task::new("boom", recorder.clone(), || async {
            Ok(job_fn(|_ctx| async {
                if true {
                    panic!("codec exploded");
                }
                Ok(0u32)
            }))
        });
        pool.add_task(task).unwrap();
        pool.add_task(simple_task("after", 5, recorder.clone())).unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            Event::Error("boom".into(), TaskError::Panicked("codec exploded".into()))
        );
        // The unit survives the panic
        assert_eq!(next_event(&mut rx).await, Event::Complete("after".into(), 5));
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let ledger = Arc::new(MemoryLedger::default());
        let pool = WorkerPool::new(WorkerPoolConfig::new(1), ledger.clone());
        let (recorder, mut rx) = Recorder::new(false);
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        pool.add_task(gated_task("same", 1, gate.clone(), order.clone(), recorder.clone()))
            .unwrap();
        pool.add_task(gated_task("same", 1, gate.clone(), order.clone(), recorder.clone()))
            .unwrap();

        assert_eq!(
            next_event(&mut rx).await,
            Event::Error("same".into(), TaskError::DuplicateTask(TaskId::new("same")))
        );
        gate.add_permits(1);
        assert_eq!(next_event(&mut rx).await, Event::Complete("same".into(), 0));
        assert_eq!(order.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate() {
        let ledger = Arc::new(MemoryLedger::new(1_000));
        let pool = WorkerPool::new(WorkerPoolConfig::new(2), ledger.clone());
        let (recorder, _rx) = Recorder::new(false);
        let gate = Arc::new(Semaphore::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for id in ["a", "b", "c"] {
            pool.add_task(gated_task(id, 100, gate.clone(), order.clone(), recorder.clone()))
                .unwrap();
        }
        eventually(|| pool.active_count() == 2).await;
        assert_eq!(ledger.current_bytes(), 200);

        pool.terminate();
        pool.terminate();

        assert_eq!(pool.status(), WorkerPoolStatus::Terminated);
        assert_eq!(ledger.current_bytes(), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.queued_count(), 0);
        assert_eq!(
            pool.add_task(simple_task("late", 0, recorder)),
            Err(WorkerPoolError::Terminated)
        );
    }
}

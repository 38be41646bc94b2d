//! Queue orchestration scenarios over a real worker pool
//!
//! Run with: cargo test -p inkshelf-taskpool --test queue_scenarios

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use inkshelf_taskpool::collaborators::{NotificationLevel, RecordingProgressSink};
use inkshelf_taskpool::config::{PoolSettings, StaticSettings};
use inkshelf_taskpool::queue::{
    ItemKey, ItemStatus, ProcessingPolicy, QueueItem, QueueOrchestrator, TaskPlan,
    TransferHandler,
};
use inkshelf_taskpool::worker::{job_fn, TaskError, UnitContext};
use inkshelf_taskpool::{MemoryLedger, PoolManager};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
struct Step {
    id: String,
    delay: Duration,
    fail: bool,
    fail_prepare: bool,
}

impl Step {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay: Duration::ZERO,
            fail: false,
            fail_prepare: false,
        }
    }

    fn taking(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }
}

impl QueueItem for Step {
    fn key(&self) -> ItemKey {
        ItemKey::new(self.id.clone(), "test:step")
    }

    fn description(&self) -> String {
        format!("step {}", self.id)
    }
}

#[derive(Default)]
struct ProbeState {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
}

/// Handler recording concurrency and completion order
struct Probe {
    state: Arc<ProbeState>,
    gate: Option<Arc<Semaphore>>,
}

impl Probe {
    fn new() -> Self {
        Self {
            state: Arc::new(ProbeState::default()),
            gate: None,
        }
    }

    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            state: Arc::new(ProbeState::default()),
            gate: Some(gate),
        }
    }
}

#[async_trait]
impl TransferHandler<Step> for Probe {
    type Output = String;

    fn label(&self) -> &'static str {
        "Step"
    }

    fn build_task(&self, item: &Step) -> TaskPlan<String> {
        let state = Arc::clone(&self.state);
        let gate = self.gate.clone();
        let step = item.clone();

        TaskPlan::new(move || async move {
            if step.fail_prepare {
                return Err(TaskError::prepare(format!("no data for {}", step.id)));
            }
            Ok(job_fn(move |ctx: UnitContext| async move {
                state.started.lock().push(step.id.clone());
                let now = state.running.fetch_add(1, Ordering::SeqCst) + 1;
                state.peak.fetch_max(now, Ordering::SeqCst);

                ctx.report_progress(10, "Running")?;
                if let Some(gate) = gate {
                    gate.acquire()
                        .await
                        .map_err(|_| TaskError::execution("gate closed"))?
                        .forget();
                }
                tokio::time::sleep(step.delay).await;
                state.running.fetch_sub(1, Ordering::SeqCst);

                if step.fail {
                    Err(TaskError::execution(format!("{} exploded", step.id)))
                } else {
                    Ok(step.id)
                }
            }))
        })
        .with_estimated_memory(1024)
    }

    async fn reconcile(&self, _item: &Step, output: String) -> Result<(), TaskError> {
        self.state.completed.lock().push(output);
        Ok(())
    }
}

fn manager(units: usize) -> Arc<PoolManager<String>> {
    Arc::new(
        PoolManager::new(
            Arc::new(MemoryLedger::new(u64::MAX)),
            Arc::new(StaticSettings::new(
                PoolSettings::default()
                    .with_worker_count(units)
                    .with_memory_budget(u64::MAX),
            )),
        )
        .with_hardware_concurrency(units),
    )
}

fn orchestrator(
    policy: ProcessingPolicy,
    handler: Probe,
    manager: Arc<PoolManager<String>>,
    sink: Arc<RecordingProgressSink>,
) -> QueueOrchestrator<Step, Probe> {
    QueueOrchestrator::new("steps", policy, Arc::new(handler), manager, sink)
}

async fn idle(queue: &QueueOrchestrator<Step, Probe>) {
    tokio::time::timeout(Duration::from_secs(10), queue.wait_until_idle())
        .await
        .expect("queue did not drain");
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn order_preserving_completes_in_submission_order() {
    let manager = manager(1);
    let sink = Arc::new(RecordingProgressSink::new());
    let queue = orchestrator(
        ProcessingPolicy::OrderPreserving,
        Probe::new(),
        manager.clone(),
        sink.clone(),
    );

    queue
        .enqueue(Step::new("A").taking(Duration::from_millis(60)))
        .await;
    queue
        .enqueue(Step::new("B").taking(Duration::from_millis(5)))
        .await;
    queue.enqueue(Step::new("C")).await;

    // B and C wait behind A
    let snapshot = queue.snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert_eq!(
        snapshot
            .iter()
            .filter(|entry| entry.status == ItemStatus::Active)
            .count(),
        1
    );

    idle(&queue).await;

    let state = &queue.handler().state;
    assert_eq!(*state.completed.lock(), vec!["A", "B", "C"]);
    assert_eq!(*state.started.lock(), vec!["A", "B", "C"]);
    assert_eq!(state.peak.load(Ordering::SeqCst), 1);
    assert_eq!(manager.users(), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn fan_out_runs_up_to_unit_count() {
    let manager = manager(3);
    let sink = Arc::new(RecordingProgressSink::new());
    let gate = Arc::new(Semaphore::new(0));
    let queue = orchestrator(
        ProcessingPolicy::FanOut,
        Probe::gated(gate.clone()),
        manager.clone(),
        sink.clone(),
    );

    for id in ["1", "2", "3", "4", "5"] {
        assert!(queue.enqueue(Step::new(id)).await);
    }

    // Every item is active from the queue's perspective; the pool throttles
    let state = Arc::clone(&queue.handler().state);
    eventually(|| state.running.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(state.running.load(Ordering::SeqCst), 3);
    assert!(queue
        .snapshot()
        .await
        .iter()
        .all(|entry| entry.status == ItemStatus::Active));

    gate.add_permits(5);
    idle(&queue).await;

    assert_eq!(state.peak.load(Ordering::SeqCst), 3);
    let mut completed = state.completed.lock().clone();
    completed.sort();
    assert_eq!(completed, vec!["1", "2", "3", "4", "5"]);

    let infos = sink
        .notifications()
        .into_iter()
        .filter(|n| n.level == NotificationLevel::Info)
        .count();
    assert_eq!(infos, 5);
    assert!(sink.active_entries().is_empty());
    assert_eq!(manager.users(), 0);
    assert_eq!(manager.ledger().current_bytes(), 0);
}

#[tokio::test]
async fn duplicate_items_are_rejected() {
    let manager = manager(1);
    let sink = Arc::new(RecordingProgressSink::new());
    let gate = Arc::new(Semaphore::new(0));
    let queue = orchestrator(
        ProcessingPolicy::OrderPreserving,
        Probe::gated(gate.clone()),
        manager,
        sink,
    );

    assert!(queue.enqueue(Step::new("A")).await);
    assert!(queue.enqueue(Step::new("B")).await);

    // A is active, B is queued; both are rejected again
    assert!(!queue.enqueue(Step::new("A")).await);
    assert!(!queue.enqueue(Step::new("B")).await);
    assert_eq!(queue.len().await, 2);
    assert_eq!(
        queue.status_of(&Step::new("B").key()).await,
        Some(ItemStatus::Queued)
    );

    gate.add_permits(2);
    idle(&queue).await;
    assert_eq!(*queue.handler().state.completed.lock(), vec!["A", "B"]);

    // Once removed, the same key is accepted again
    gate.add_permits(1);
    assert!(queue.enqueue(Step::new("A")).await);
    idle(&queue).await;
}

#[tokio::test]
async fn failures_notify_once_and_release_everything() {
    let manager = manager(2);
    let sink = Arc::new(RecordingProgressSink::new());
    let queue = orchestrator(
        ProcessingPolicy::FanOut,
        Probe::new(),
        manager.clone(),
        sink.clone(),
    );

    queue.enqueue(Step::new("ok")).await;
    queue.enqueue(Step::new("job").failing()).await;
    queue.enqueue(Step::new("prep").failing_prepare()).await;
    idle(&queue).await;

    let errors = sink.errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|n| n.message.contains("job exploded")));
    assert!(errors.iter().any(|n| n.message.contains("no data for prep")));
    assert_eq!(*queue.handler().state.completed.lock(), vec!["ok"]);

    assert!(queue.is_empty().await);
    assert!(sink.active_entries().is_empty());
    assert_eq!(manager.ledger().current_bytes(), 0);
    assert_eq!(manager.ledger().reservation_count(), 0);
    assert_eq!(manager.users(), 0);
    assert!(manager.current_pool().is_none());
}

#[tokio::test]
async fn queues_share_one_pool_until_both_drain() {
    let manager = manager(2);
    let sink = Arc::new(RecordingProgressSink::new());
    let backup_gate = Arc::new(Semaphore::new(0));
    let download_gate = Arc::new(Semaphore::new(0));
    let backups = orchestrator(
        ProcessingPolicy::FanOut,
        Probe::gated(backup_gate.clone()),
        manager.clone(),
        sink.clone(),
    );
    let downloads = orchestrator(
        ProcessingPolicy::OrderPreserving,
        Probe::gated(download_gate.clone()),
        manager.clone(),
        sink.clone(),
    );

    backups.enqueue(Step::new("b1")).await;
    downloads.enqueue(Step::new("d1")).await;
    assert_eq!(manager.users(), 2);
    let pool = manager.current_pool().expect("pool built");

    backup_gate.add_permits(1);
    idle(&backups).await;
    assert_eq!(manager.users(), 1);
    assert!(!pool.is_terminated());

    download_gate.add_permits(1);
    idle(&downloads).await;
    assert_eq!(manager.users(), 0);
    assert!(pool.is_terminated());
    assert_eq!(manager.pools_built(), 1);

    // A later enqueue builds a fresh pool
    backup_gate.add_permits(1);
    backups.enqueue(Step::new("b2")).await;
    idle(&backups).await;
    assert_eq!(manager.pools_built(), 2);
}

#[tokio::test]
async fn progress_entries_follow_items() {
    let manager = manager(1);
    let sink = Arc::new(RecordingProgressSink::new());
    let gate = Arc::new(Semaphore::new(0));
    let queue = orchestrator(
        ProcessingPolicy::OrderPreserving,
        Probe::gated(gate.clone()),
        manager,
        sink.clone(),
    );

    queue.enqueue(Step::new("A")).await;
    let id = Step::new("A").key().to_string();
    eventually(|| sink.entry(&id).is_some_and(|entry| entry.progress == 10)).await;
    assert_eq!(sink.entry(&id).map(|entry| entry.status), Some("Running".to_string()));

    gate.add_permits(1);
    idle(&queue).await;
    assert!(sink.entry(&id).is_none());
    assert_eq!(sink.removed(), vec![id]);
}

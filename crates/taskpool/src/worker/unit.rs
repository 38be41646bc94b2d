//! Isolated worker units
//!
//! A unit is a long-lived Tokio task that runs one assignment at a time and
//! talks to the coordinator only through messages. Each job runs in its own
//! spawned task so a panic becomes an error message instead of killing the
//! unit.

use std::any::Any;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pool::Command;
use super::task::{PrepareFn, TaskError, TaskId, TaskResult, UnitContext};

/// Work handed to a unit by the coordinator
pub(crate) struct Assignment<O> {
    pub task_id: TaskId,
    pub prepare: PrepareFn<O>,
    pub ctx: UnitContext,
}

/// Coordinator-side handle to a unit
pub(crate) struct WorkerUnit<O> {
    index: usize,
    inbox: mpsc::UnboundedSender<Assignment<O>>,
    handle: JoinHandle<()>,
    current: Option<TaskId>,
}

impl<O: Send + 'static> WorkerUnit<O> {
    /// Spawn a unit reporting to `reports`
    pub fn spawn(
        index: usize,
        reports: mpsc::UnboundedSender<Command<O>>,
        shutdown: CancellationToken,
    ) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_unit(index, rx, reports, shutdown));
        Self {
            index,
            inbox,
            handle,
            current: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn current(&self) -> Option<&TaskId> {
        self.current.as_ref()
    }

    /// Hand an assignment to the unit
    ///
    /// Returns the assignment back if the unit is no longer running.
    pub fn assign(&mut self, assignment: Assignment<O>) -> Result<(), Box<Assignment<O>>> {
        let task_id = assignment.task_id.clone();
        self.inbox
            .send(assignment)
            .map_err(|err| Box::new(err.0))?;
        self.current = Some(task_id);
        Ok(())
    }

    /// Mark the unit idle if it was running `task_id`
    pub fn finish(&mut self, task_id: &TaskId) -> bool {
        if self.current.as_ref() == Some(task_id) {
            self.current = None;
            true
        } else {
            false
        }
    }

    /// Destroy the unit and whatever it is running
    pub fn destroy(self) {
        self.handle.abort();
    }
}

async fn run_unit<O: Send + 'static>(
    index: usize,
    mut inbox: mpsc::UnboundedReceiver<Assignment<O>>,
    reports: mpsc::UnboundedSender<Command<O>>,
    shutdown: CancellationToken,
) {
    debug!(unit = index, "Worker unit started");

    loop {
        let assignment = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = inbox.recv() => match next {
                Some(assignment) => assignment,
                None => break,
            },
        };

        let task_id = assignment.task_id.clone();
        debug!(unit = index, %task_id, "Unit executing task");
        let outcome = execute(assignment, &shutdown).await;

        if shutdown.is_cancelled() {
            break;
        }
        let report = Command::UnitFinished {
            unit: index,
            task_id,
            outcome,
        };
        if reports.send(report).is_err() {
            break;
        }
    }

    debug!(unit = index, "Worker unit stopped");
}

async fn execute<O: Send + 'static>(
    assignment: Assignment<O>,
    shutdown: &CancellationToken,
) -> TaskResult<O> {
    let Assignment {
        task_id,
        prepare,
        ctx,
    } = assignment;

    let mut job = tokio::spawn(async move {
        // Payload is only loaded now that a unit is about to run the task
        let job = prepare().await?;
        job.run(ctx).await
    });

    tokio::select! {
        joined = &mut job => match joined {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                warn!(%task_id, %message, "Job panicked");
                Err(TaskError::Panicked(message))
            }
            Err(_) => Err(TaskError::PoolTerminated),
        },
        _ = shutdown.cancelled() => {
            job.abort();
            Err(TaskError::PoolTerminated)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - FIFO admission queue feeding a fixed set of worker units
//! - [`Task`] - Unit of work with a memory estimate, optional resource class
//!   and lazy `prepare` producer
//! - [`TaskCallbacks`] - Progress, completion and error routing back to callers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │                                                              │
//! │   add_task ──▶ ┌─────────────────────────────────────────┐   │
//! │                │            Coordinator                  │   │
//! │                │  FIFO queue ─▶ admission ─▶ dispatch    │   │
//! │                │  (MemoryLedger + resource-class limits) │   │
//! │                └──────┬──────────────────────▲───────────┘   │
//! │                       │ Assignment           │ Command       │
//! │                       ▼                      │               │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐    │               │
//! │  │  Unit 0  │  │  Unit 1  │  │  Unit N  │ ───┘               │
//! │  │ prepare  │  │ prepare  │  │ prepare  │  progress /        │
//! │  │ + run    │  │ + run    │  │ + run    │  finished          │
//! │  └──────────┘  └──────────┘  └──────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-task state inside the pool moves `queued → admitted → dispatched →
//! (completed | errored)`. The pool never re-queues a task; retries are the
//! caller's business and require a new task.

mod pool;
mod task;
mod unit;

pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use task::{
    job_fn, FnJob, PrepareFn, PrepareFuture, ReleaseHandle, ResourceClass, Task, TaskCallbacks,
    TaskError, TaskId, TaskProgress, TaskResult, UnitContext, UnitJob,
};

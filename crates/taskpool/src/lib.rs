//! # Inkshelf Transfer Pool
//!
//! Bounded parallel task execution for chapter backups and downloads.
//!
//! ## Features
//!
//! - **Shared worker pool**: a fixed set of isolated units fed by a strict FIFO
//!   admission queue
//! - **Memory budget**: tasks are admitted against a process-wide ledger; a
//!   single oversized task still runs when nothing else is active
//! - **Resource classes**: per-provider concurrency ceilings independent of the
//!   unit count
//! - **Reference-counted lifecycle**: the pool is built on first use and torn
//!   down when the last queue drains
//! - **Keyed mutexes**: "ensure folder exists" runs once under concurrent
//!   callers; share-link creation is throttled per provider
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │     BackupQueue      │   │    DownloadQueue     │
//! │      (fan-out)       │   │  (order-preserving)  │
//! └──────────┬───────────┘   └───────────┬──────────┘
//!            │  KeyedMutexRegistry       │
//!            ▼                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PoolManager                           │
//! │        (single-flight construction, user refcount)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │   (FIFO admission against MemoryLedger, worker units)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use inkshelf_taskpool::prelude::*;
//!
//! let runtime = TransferRuntime::new(
//!     Arc::new(StaticSettings::new(PoolSettings::from_env())),
//!     Arc::new(RecordingProgressSink::new()),
//! );
//!
//! let backups = runtime.backup_queue(storage, codec, catalog).await;
//! backups
//!     .enqueue(BackupQueueItem::new("drive", chapter, raw_size_bytes))
//!     .await;
//! backups.wait_until_idle().await;
//! ```

pub mod collaborators;
pub mod config;
pub mod keyed_mutex;
pub mod ledger;
pub mod manager;
pub mod queue;
pub mod runtime;
pub mod worker;

#[cfg(test)]
mod test_support;

/// Prelude for common imports
pub mod prelude {
    pub use crate::collaborators::{
        ArchiveCodec, ArchiveEntry, BackupRecord, Catalog, ChapterRef, InMemoryCatalog,
        InMemoryStorage, Notification, ProgressEntry, ProgressSink, RecordingProgressSink,
        RemoteStorage, ZipArchiveCodec,
    };
    pub use crate::config::{LiveSettings, PoolSettings, SettingsProvider, StaticSettings};
    pub use crate::keyed_mutex::{KeyedMutexRegistry, LockPath};
    pub use crate::ledger::MemoryLedger;
    pub use crate::manager::PoolManager;
    pub use crate::queue::backup::{BackupHandler, BackupQueue, BackupQueueItem};
    pub use crate::queue::download::{DownloadHandler, DownloadQueue, DownloadQueueItem};
    pub use crate::queue::{
        ItemKey, ItemStatus, ProcessingPolicy, QueueItem, QueueOrchestrator, TaskPlan,
        TransferHandler, TransferOutput,
    };
    pub use crate::runtime::TransferRuntime;
    pub use crate::worker::{
        job_fn, ReleaseHandle, ResourceClass, Task, TaskCallbacks, TaskError, TaskId,
        TaskProgress, UnitContext, WorkerPool, WorkerPoolConfig,
    };
    pub use std::sync::Arc;
}

// Re-export commonly used types at crate root
pub use config::{PoolSettings, PoolSizing};
pub use keyed_mutex::{KeyedMutexRegistry, LockPath};
pub use ledger::{LedgerSnapshot, MemoryLedger, ReservationKey};
pub use manager::PoolManager;
pub use runtime::TransferRuntime;
pub use worker::{Task, TaskError, TaskId, WorkerPool, WorkerPoolConfig, WorkerPoolError};

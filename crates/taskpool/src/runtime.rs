//! Shared transfer runtime
//!
//! [`TransferRuntime`] owns the process-wide pieces (memory ledger, keyed mutex
//! registry, pool manager and progress sink) and builds queues wired to them.
//! Create one per process and pass it around instead of using globals.

use std::sync::Arc;

use tracing::info;

use crate::collaborators::{ArchiveCodec, Catalog, ProgressSink, RemoteStorage};
use crate::config::SettingsProvider;
use crate::keyed_mutex::KeyedMutexRegistry;
use crate::ledger::{LedgerSnapshot, MemoryLedger};
use crate::manager::PoolManager;
use crate::queue::backup::{BackupHandler, BackupQueue};
use crate::queue::download::{DownloadHandler, DownloadQueue};
use crate::queue::{ProcessingPolicy, QueueOrchestrator, TransferOutput};

/// Process-wide context for transfer queues
///
/// # Example
///
/// ```ignore
/// let runtime = TransferRuntime::new(settings, progress);
/// let backups = runtime.backup_queue(storage.clone(), codec.clone(), catalog.clone()).await;
/// let downloads = runtime.download_queue(storage, codec, catalog).await;
///
/// backups.enqueue(BackupQueueItem::new("drive", chapter, raw_size)).await;
/// backups.wait_until_idle().await;
/// ```
pub struct TransferRuntime {
    settings: Arc<dyn SettingsProvider>,
    progress: Arc<dyn ProgressSink>,
    ledger: Arc<MemoryLedger>,
    locks: Arc<KeyedMutexRegistry>,
    manager: Arc<PoolManager<TransferOutput>>,
}

impl TransferRuntime {
    pub fn new(settings: Arc<dyn SettingsProvider>, progress: Arc<dyn ProgressSink>) -> Self {
        let ledger = Arc::new(MemoryLedger::default());
        let manager = Arc::new(PoolManager::new(Arc::clone(&ledger), Arc::clone(&settings)));
        Self {
            settings,
            progress,
            ledger,
            locks: Arc::new(KeyedMutexRegistry::new()),
            manager,
        }
    }

    /// Override the hardware concurrency hint that caps the pool size
    pub fn with_hardware_concurrency(mut self, hint: usize) -> Self {
        self.manager = Arc::new(
            PoolManager::new(Arc::clone(&self.ledger), Arc::clone(&self.settings))
                .with_hardware_concurrency(hint),
        );
        self
    }

    /// Build a fan-out backup queue for one provider
    pub async fn backup_queue(
        &self,
        storage: Arc<dyn RemoteStorage>,
        codec: Arc<dyn ArchiveCodec>,
        catalog: Arc<dyn Catalog>,
    ) -> BackupQueue {
        let settings = self.settings.current().await;
        let name = format!("{}:backup", storage.provider());
        info!(queue = %name, upload_concurrency = settings.upload_concurrency, "Backup queue ready");

        let handler = BackupHandler::new(
            storage,
            codec,
            catalog,
            Arc::clone(&self.locks),
            settings.upload_concurrency,
        );
        QueueOrchestrator::new(
            name,
            ProcessingPolicy::FanOut,
            Arc::new(handler),
            Arc::clone(&self.manager),
            Arc::clone(&self.progress),
        )
    }

    /// Build an order-preserving download queue for one provider
    pub async fn download_queue(
        &self,
        storage: Arc<dyn RemoteStorage>,
        codec: Arc<dyn ArchiveCodec>,
        catalog: Arc<dyn Catalog>,
    ) -> DownloadQueue {
        let settings = self.settings.current().await;
        let name = format!("{}:download", storage.provider());
        info!(queue = %name, "Download queue ready");

        let handler = DownloadHandler::new(
            storage,
            codec,
            catalog,
            Arc::clone(&self.locks),
            settings.share_link_interval,
        );
        QueueOrchestrator::new(
            name,
            ProcessingPolicy::OrderPreserving,
            Arc::new(handler),
            Arc::clone(&self.manager),
            Arc::clone(&self.progress),
        )
    }

    pub fn ledger(&self) -> &Arc<MemoryLedger> {
        &self.ledger
    }

    pub fn locks(&self) -> &Arc<KeyedMutexRegistry> {
        &self.locks
    }

    pub fn manager(&self) -> &Arc<PoolManager<TransferOutput>> {
        &self.manager
    }

    pub fn progress(&self) -> &Arc<dyn ProgressSink> {
        &self.progress
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }
}

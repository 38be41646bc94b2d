//! Backup queue: compress local chapters and upload them
//!
//! Fan-out: every queued chapter is activated at once and the pool throttles
//! actual parallelism through the memory budget and the per-provider upload
//! class.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ItemKey, QueueItem, QueueOrchestrator, TaskPlan, TransferHandler, TransferOutput};
use crate::collaborators::{
    ArchiveCodec, BackupRecord, Catalog, ChapterRef, RemoteStorage, StorageError,
};
use crate::keyed_mutex::{KeyedMutexRegistry, LockPath};
use crate::worker::{job_fn, ResourceClass, TaskError, UnitContext};

/// Compression plus the upload buffer roughly doubles the raw chapter size
const BACKUP_MEMORY_FACTOR: u64 = 2;

/// Backup queue over the shared worker pool
pub type BackupQueue = QueueOrchestrator<BackupQueueItem, BackupHandler>;

/// Request to back up one chapter to one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupQueueItem {
    pub provider: String,
    pub chapter: ChapterRef,
    /// Raw size of the chapter's files, from catalog metadata
    pub raw_size_bytes: u64,
}

impl BackupQueueItem {
    pub fn new(provider: impl Into<String>, chapter: ChapterRef, raw_size_bytes: u64) -> Self {
        Self {
            provider: provider.into(),
            chapter,
            raw_size_bytes,
        }
    }
}

impl QueueItem for BackupQueueItem {
    fn key(&self) -> ItemKey {
        ItemKey::new(
            self.chapter.chapter_id.clone(),
            format!("{}:backup", self.provider),
        )
    }

    fn description(&self) -> String {
        format!("{} - {}", self.chapter.series, self.chapter.title)
    }
}

/// Compresses chapters with the archive codec and uploads them
pub struct BackupHandler {
    storage: Arc<dyn RemoteStorage>,
    codec: Arc<dyn ArchiveCodec>,
    catalog: Arc<dyn Catalog>,
    locks: Arc<KeyedMutexRegistry>,
    upload_concurrency: usize,
}

impl BackupHandler {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        codec: Arc<dyn ArchiveCodec>,
        catalog: Arc<dyn Catalog>,
        locks: Arc<KeyedMutexRegistry>,
        upload_concurrency: usize,
    ) -> Self {
        Self {
            storage,
            codec,
            catalog,
            locks,
            upload_concurrency: upload_concurrency.max(1),
        }
    }

    pub fn provider(&self) -> &str {
        self.storage.provider()
    }

    /// Folder holding a series' archives
    pub fn series_folder(&self, series: &str) -> String {
        format!("{}/{}", self.storage.root_folder(), series)
    }

    /// Remote path of a chapter's archive
    pub fn archive_path(&self, chapter: &ChapterRef) -> String {
        format!(
            "{}/{}.{}",
            self.series_folder(&chapter.series),
            chapter.chapter_id,
            self.codec.extension()
        )
    }

    /// Create the series folder once, no matter how many chapters race for it
    async fn ensure_series_folder(&self, series: &str) -> Result<String, StorageError> {
        let key = format!("{}:{}", self.provider(), series);
        let folder = self.series_folder(series);
        let storage = Arc::clone(&self.storage);

        self.locks
            .with_lock(&key, |path| async move {
                if path == LockPath::Existing {
                    if let Some(id) = storage.find_folder(&folder).await? {
                        return Ok(id);
                    }
                }
                debug!(%folder, "Ensuring series folder");
                storage.ensure_folder(&folder).await
            })
            .await
    }
}

#[async_trait]
impl TransferHandler<BackupQueueItem> for BackupHandler {
    type Output = TransferOutput;

    fn label(&self) -> &'static str {
        "Backup"
    }

    async fn before_submit(&self, item: &BackupQueueItem) -> Result<(), TaskError> {
        self.ensure_series_folder(&item.chapter.series).await?;
        Ok(())
    }

    fn build_task(&self, item: &BackupQueueItem) -> TaskPlan<TransferOutput> {
        let catalog = Arc::clone(&self.catalog);
        let codec = Arc::clone(&self.codec);
        let storage = Arc::clone(&self.storage);
        let chapter_id = item.chapter.chapter_id.clone();
        let remote_path = self.archive_path(&item.chapter);

        TaskPlan::new(move || async move {
            let files = catalog.load_chapter_files(&chapter_id).await?;

            Ok(job_fn(move |ctx: UnitContext| async move {
                ctx.report_progress(10, "Compressing")?;
                let archive = tokio::task::spawn_blocking(move || codec.compress(&files))
                    .await
                    .map_err(|err| TaskError::execution(format!("compression aborted: {}", err)))??;

                ctx.report_progress(50, "Uploading")?;
                let size_bytes = archive.len() as u64;
                let remote_id = storage.upload(&remote_path, archive).await?;
                ctx.report_progress(100, "Uploaded")?;

                Ok(TransferOutput::Uploaded {
                    remote_id,
                    remote_path,
                    size_bytes,
                })
            }))
        })
        .with_estimated_memory(item.raw_size_bytes.saturating_mul(BACKUP_MEMORY_FACTOR))
        .with_resource_class(ResourceClass::new(
            format!("{}:upload", item.provider),
            self.upload_concurrency,
        ))
    }

    async fn reconcile(
        &self,
        item: &BackupQueueItem,
        output: TransferOutput,
    ) -> Result<(), TaskError> {
        let TransferOutput::Uploaded {
            remote_id,
            remote_path,
            size_bytes,
        } = output
        else {
            return Err(TaskError::execution("backup job produced no upload"));
        };

        self.catalog
            .record_backup(BackupRecord {
                chapter_id: item.chapter.chapter_id.clone(),
                provider: item.provider.clone(),
                remote_id,
                remote_path,
                size_bytes,
                backed_up_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

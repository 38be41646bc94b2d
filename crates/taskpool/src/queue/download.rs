//! Download queue: fetch archives and restore chapters into the catalog
//!
//! Order-preserving: chapters are restored one at a time, in the order they
//! were requested.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ItemKey, QueueItem, QueueOrchestrator, TaskPlan, TransferHandler, TransferOutput};
use crate::collaborators::{ArchiveCodec, Catalog, ChapterRef, RemoteStorage, StorageError};
use crate::keyed_mutex::KeyedMutexRegistry;
use crate::worker::{job_fn, TaskError, UnitContext};

/// Archive bytes, the decompressed pages and catalog copies coexist
const DOWNLOAD_MEMORY_FACTOR: u64 = 3;

/// Download queue over the shared worker pool
pub type DownloadQueue = QueueOrchestrator<DownloadQueueItem, DownloadHandler>;

/// Request to restore one chapter from a remote archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQueueItem {
    pub provider: String,
    pub remote_id: String,
    /// Chapter the archive restores into
    pub chapter: ChapterRef,
    pub archive_size_bytes: u64,
}

impl DownloadQueueItem {
    pub fn new(
        provider: impl Into<String>,
        remote_id: impl Into<String>,
        chapter: ChapterRef,
        archive_size_bytes: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            remote_id: remote_id.into(),
            chapter,
            archive_size_bytes,
        }
    }
}

impl QueueItem for DownloadQueueItem {
    fn key(&self) -> ItemKey {
        ItemKey::new(self.remote_id.clone(), format!("{}:download", self.provider))
    }

    fn description(&self) -> String {
        format!("{} - {}", self.chapter.series, self.chapter.title)
    }
}

/// Downloads archives and decompresses them into the catalog
pub struct DownloadHandler {
    storage: Arc<dyn RemoteStorage>,
    codec: Arc<dyn ArchiveCodec>,
    catalog: Arc<dyn Catalog>,
    locks: Arc<KeyedMutexRegistry>,
    share_link_interval: Duration,
}

impl DownloadHandler {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        codec: Arc<dyn ArchiveCodec>,
        catalog: Arc<dyn Catalog>,
        locks: Arc<KeyedMutexRegistry>,
        share_link_interval: Duration,
    ) -> Self {
        Self {
            storage,
            codec,
            catalog,
            locks,
            share_link_interval,
        }
    }
}

/// Fetch an archive, through a throttled share link when the provider needs one
async fn fetch_archive(
    storage: &dyn RemoteStorage,
    locks: &KeyedMutexRegistry,
    remote_id: &str,
    interval: Duration,
) -> Result<Vec<u8>, StorageError> {
    if !storage.requires_share_link() {
        return storage.download(remote_id).await;
    }

    let key = format!("{}:share-link", storage.provider());
    let link = locks
        .with_throttle(&key, interval, || storage.create_share_link(remote_id))
        .await?;
    debug!(remote_id, "Downloading through share link");
    storage.download_shared(&link).await
}

#[async_trait]
impl TransferHandler<DownloadQueueItem> for DownloadHandler {
    type Output = TransferOutput;

    fn label(&self) -> &'static str {
        "Download"
    }

    fn build_task(&self, item: &DownloadQueueItem) -> TaskPlan<TransferOutput> {
        let storage = Arc::clone(&self.storage);
        let codec = Arc::clone(&self.codec);
        let locks = Arc::clone(&self.locks);
        let remote_id = item.remote_id.clone();
        let interval = self.share_link_interval;

        TaskPlan::new(move || async move {
            let archive = fetch_archive(storage.as_ref(), &locks, &remote_id, interval).await?;

            Ok(job_fn(move |ctx: UnitContext| async move {
                ctx.report_progress(50, "Extracting")?;
                let entries = tokio::task::spawn_blocking(move || codec.decompress(&archive))
                    .await
                    .map_err(|err| {
                        TaskError::execution(format!("decompression aborted: {}", err))
                    })??;
                ctx.report_progress(100, "Extracted")?;

                Ok(TransferOutput::Extracted { entries })
            }))
        })
        .with_estimated_memory(item.archive_size_bytes.saturating_mul(DOWNLOAD_MEMORY_FACTOR))
    }

    async fn reconcile(
        &self,
        item: &DownloadQueueItem,
        output: TransferOutput,
    ) -> Result<(), TaskError> {
        let TransferOutput::Extracted { entries } = output else {
            return Err(TaskError::execution("download job produced no pages"));
        };

        self.catalog
            .store_chapter_files(&item.chapter, entries)
            .await?;
        Ok(())
    }
}

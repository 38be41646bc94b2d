//! Contracts of the external collaborators the transfer queues depend on
//!
//! - [`RemoteStorage`] - per-provider cloud storage client
//! - [`ArchiveCodec`] - builds and parses chapter archives
//! - [`Catalog`] - local persistent store of chapters and backup records
//! - [`ProgressSink`] - progress and notification surface
//!
//! The pool core never calls these directly; queue handlers invoke them from
//! task preparation, unit execution and reconciliation.

mod memory;
mod zip_codec;

pub use memory::{InMemoryCatalog, InMemoryStorage, RecordingProgressSink};
pub use zip_codec::ZipArchiveCodec;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::TaskError;

/// One file inside a chapter archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Path inside the archive, e.g. `001.jpg`
    pub name: String,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Total raw size of a set of entries
pub fn total_size(entries: &[ArchiveEntry]) -> u64 {
    entries.iter().map(ArchiveEntry::size_bytes).sum()
}

/// File stored on a remote provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

/// Storage quota reported by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub used_bytes: u64,
    /// `None` for unlimited plans
    pub total_bytes: Option<u64>,
}

impl Quota {
    pub fn available_bytes(&self) -> Option<u64> {
        self.total_bytes
            .map(|total| total.saturating_sub(self.used_bytes))
    }
}

/// Remote storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },

    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation not supported by provider: {0}")]
    Unsupported(String),
}

/// Per-provider remote storage client
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Provider name used in routing and lock keys (e.g. `drive`)
    fn provider(&self) -> &str;

    /// Root folder all backups live under
    fn root_folder(&self) -> &str {
        "inkshelf"
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<RemoteFile>, StorageError>;

    /// Upload `bytes` to `path`, returning the remote id
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError>;

    async fn download(&self, id: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Create `path` if needed, returning the folder id
    async fn ensure_folder(&self, path: &str) -> Result<String, StorageError>;

    /// Cheap idempotent lookup of an existing folder
    async fn find_folder(&self, path: &str) -> Result<Option<String>, StorageError>;

    async fn get_quota(&self) -> Result<Quota, StorageError>;

    /// Whether downloads must go through a share link
    fn requires_share_link(&self) -> bool {
        false
    }

    /// Create an ephemeral share link for a file; rate limited by providers
    async fn create_share_link(&self, id: &str) -> Result<String, StorageError> {
        Err(StorageError::Unsupported(format!(
            "share link for {} on {}",
            id,
            self.provider()
        )))
    }

    /// Download through a share link created by [`create_share_link`](Self::create_share_link)
    async fn download_shared(&self, link: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Unsupported(format!(
            "shared download of {} on {}",
            link,
            self.provider()
        )))
    }
}

/// Archive codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("archive is corrupt: {0}")]
    Corrupt(String),

    #[error("archive I/O failed: {0}")]
    Io(String),
}

/// Builds and parses the chapter container format
///
/// Implementations are synchronous and CPU bound; callers run them on a
/// blocking thread.
pub trait ArchiveCodec: Send + Sync {
    /// File extension of produced archives, without the dot
    fn extension(&self) -> &str;

    fn compress(&self, entries: &[ArchiveEntry]) -> Result<Vec<u8>, CodecError>;

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<ArchiveEntry>, CodecError>;
}

/// Reference to a chapter in the local catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChapterRef {
    pub series: String,
    pub chapter_id: String,
    pub title: String,
}

impl ChapterRef {
    pub fn new(
        series: impl Into<String>,
        chapter_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            series: series.into(),
            chapter_id: chapter_id.into(),
            title: title.into(),
        }
    }
}

/// Record of a chapter archive stored remotely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub chapter_id: String,
    pub provider: String,
    pub remote_id: String,
    pub remote_path: String,
    pub size_bytes: u64,
    pub backed_up_at: DateTime<Utc>,
}

/// Catalog errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("chapter not found in catalog: {0}")]
    ChapterNotFound(String),

    #[error("catalog storage error: {0}")]
    Storage(String),
}

/// Local persistent catalog
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn load_chapter_files(&self, chapter_id: &str)
        -> Result<Vec<ArchiveEntry>, CatalogError>;

    async fn store_chapter_files(
        &self,
        chapter: &ChapterRef,
        files: Vec<ArchiveEntry>,
    ) -> Result<(), CatalogError>;

    async fn record_backup(&self, record: BackupRecord) -> Result<(), CatalogError>;

    async fn backup_record(
        &self,
        chapter_id: &str,
        provider: &str,
    ) -> Result<Option<BackupRecord>, CatalogError>;
}

/// Progress line shown for a queued or running item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: String,
    pub description: String,
    /// 0-100
    pub progress: u8,
    pub status: String,
}

impl ProgressEntry {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        progress: u8,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            progress: progress.min(100),
            status: status.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Error,
}

/// User-facing notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// Progress and notification surface
///
/// Write-only from the core's perspective; never read back.
pub trait ProgressSink: Send + Sync {
    fn update(&self, entry: ProgressEntry);

    fn remove(&self, id: &str);

    fn notify(&self, notification: Notification);
}

impl From<StorageError> for TaskError {
    fn from(err: StorageError) -> Self {
        TaskError::execution(err)
    }
}

impl From<CodecError> for TaskError {
    fn from(err: CodecError) -> Self {
        TaskError::execution(err)
    }
}

impl From<CatalogError> for TaskError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::ChapterNotFound(_) => TaskError::prepare(err),
            CatalogError::Storage(_) => TaskError::execution(err),
        }
    }
}

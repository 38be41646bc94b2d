//! In-memory collaborators for tests and simulations

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    ArchiveEntry, BackupRecord, Catalog, CatalogError, ChapterRef, Notification,
    NotificationLevel, ProgressEntry, ProgressSink, Quota, RemoteFile, RemoteStorage,
    StorageError,
};

#[derive(Debug, Clone)]
struct StoredFile {
    path: String,
    bytes: Vec<u8>,
    modified_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StorageState {
    files: HashMap<String, StoredFile>,
    folders: HashMap<String, String>,
    share_links: HashMap<String, String>,
    share_link_times: Vec<Instant>,
    failing_uploads: usize,
    failing_folder_creations: usize,
}

/// Remote storage kept in process memory
///
/// Uploads require the parent folder to exist, like most cloud providers.
/// Latency and failures can be injected to exercise the queues.
pub struct InMemoryStorage {
    provider: String,
    root: String,
    latency: Duration,
    share_links: bool,
    quota_bytes: Option<u64>,
    state: Mutex<StorageState>,
    next_id: AtomicU64,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    folder_creations: AtomicUsize,
    ensure_folder_calls: AtomicUsize,
    in_flight_uploads: AtomicUsize,
    peak_uploads: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            root: "inkshelf".to_string(),
            latency: Duration::ZERO,
            share_links: false,
            quota_bytes: None,
            state: Mutex::new(StorageState::default()),
            next_id: AtomicU64::new(1),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            folder_creations: AtomicUsize::new(0),
            ensure_folder_calls: AtomicUsize::new(0),
            in_flight_uploads: AtomicUsize::new(0),
            peak_uploads: AtomicUsize::new(0),
        }
    }

    /// Delay applied to every remote call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Require downloads to go through share links
    pub fn with_share_links(mut self, required: bool) -> Self {
        self.share_links = required;
        self
    }

    pub fn with_quota(mut self, total_bytes: u64) -> Self {
        self.quota_bytes = Some(total_bytes);
        self
    }

    pub fn with_root_folder(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Fail the next `count` uploads with a network error
    pub fn fail_next_uploads(&self, count: usize) {
        self.state.lock().failing_uploads = count;
    }

    /// Fail the next `count` folder creations with a network error
    pub fn fail_next_folder_creations(&self, count: usize) {
        self.state.lock().failing_folder_creations = count;
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Folders actually created (not found existing)
    pub fn folder_creations(&self) -> usize {
        self.folder_creations.load(Ordering::SeqCst)
    }

    /// Calls to [`RemoteStorage::ensure_folder`], whether or not they created anything
    pub fn ensure_folder_calls(&self) -> usize {
        self.ensure_folder_calls.load(Ordering::SeqCst)
    }

    /// Highest number of uploads observed in flight at once
    pub fn peak_concurrent_uploads(&self) -> usize {
        self.peak_uploads.load(Ordering::SeqCst)
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn folder_exists(&self, path: &str) -> bool {
        self.state.lock().folders.contains_key(path)
    }

    /// Instants at which share links were created
    pub fn share_link_times(&self) -> Vec<Instant> {
        self.state.lock().share_link_times.clone()
    }

    /// Look up a stored file by path
    pub fn file_at(&self, path: &str) -> Option<RemoteFile> {
        let state = self.state.lock();
        state
            .files
            .iter()
            .find(|(_, file)| file.path == path)
            .map(|(id, file)| remote_file(id, file))
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_id(&self, kind: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}-{}", self.provider, kind, n)
    }

    fn used_bytes(state: &StorageState) -> u64 {
        state.files.values().map(|f| f.bytes.len() as u64).sum()
    }
}

fn remote_file(id: &str, file: &StoredFile) -> RemoteFile {
    RemoteFile {
        id: id.to_string(),
        path: file.path.clone(),
        size_bytes: file.bytes.len() as u64,
        modified_at: file.modified_at,
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

#[async_trait]
impl RemoteStorage for InMemoryStorage {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn root_folder(&self) -> &str {
        &self.root
    }

    async fn list_files(&self, folder: &str) -> Result<Vec<RemoteFile>, StorageError> {
        self.simulate_latency().await;
        let state = self.state.lock();
        if !folder.is_empty() && !state.folders.contains_key(folder) {
            return Err(StorageError::NotFound(folder.to_string()));
        }
        let mut files: Vec<_> = state
            .files
            .iter()
            .filter(|(_, file)| parent_of(&file.path) == folder)
            .map(|(id, file)| remote_file(id, file))
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let now = self.in_flight_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_uploads.fetch_max(now, Ordering::SeqCst);
        self.simulate_latency().await;
        let result = self.store_upload(path, bytes);
        self.in_flight_uploads.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        self.simulate_latency().await;
        let state = self.state.lock();
        let file = state
            .files
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(file.bytes.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.simulate_latency().await;
        self.state
            .lock()
            .files
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn ensure_folder(&self, path: &str) -> Result<String, StorageError> {
        self.ensure_folder_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if let Some(id) = state.folders.get(path) {
            return Ok(id.clone());
        }
        if state.failing_folder_creations > 0 {
            state.failing_folder_creations -= 1;
            return Err(StorageError::Network(format!(
                "failed to create folder {}",
                path
            )));
        }

        // Create missing ancestors too
        let mut prefix = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if !state.folders.contains_key(&prefix) {
                let id = self.next_id("folder");
                state.folders.insert(prefix.clone(), id);
                self.folder_creations.fetch_add(1, Ordering::SeqCst);
                debug!(provider = %self.provider, folder = %prefix, "Created remote folder");
            }
        }
        state
            .folders
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn find_folder(&self, path: &str) -> Result<Option<String>, StorageError> {
        self.simulate_latency().await;
        Ok(self.state.lock().folders.get(path).cloned())
    }

    async fn get_quota(&self) -> Result<Quota, StorageError> {
        let state = self.state.lock();
        Ok(Quota {
            used_bytes: Self::used_bytes(&state),
            total_bytes: self.quota_bytes,
        })
    }

    fn requires_share_link(&self) -> bool {
        self.share_links
    }

    async fn create_share_link(&self, id: &str) -> Result<String, StorageError> {
        if !self.share_links {
            return Err(StorageError::Unsupported(format!(
                "share links on {}",
                self.provider
            )));
        }
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if !state.files.contains_key(id) {
            return Err(StorageError::NotFound(id.to_string()));
        }
        let link = format!("https://share.{}.invalid/{}", self.provider, self.next_id("link"));
        state.share_links.insert(link.clone(), id.to_string());
        state.share_link_times.push(Instant::now());
        Ok(link)
    }

    async fn download_shared(&self, link: &str) -> Result<Vec<u8>, StorageError> {
        let id = self
            .state
            .lock()
            .share_links
            .remove(link)
            .ok_or_else(|| StorageError::NotFound(link.to_string()))?;
        self.download(&id).await
    }
}

impl InMemoryStorage {
    fn store_upload(&self, path: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let mut state = self.state.lock();
        if state.failing_uploads > 0 {
            state.failing_uploads -= 1;
            return Err(StorageError::Network(format!("upload of {} reset", path)));
        }

        let parent = parent_of(path);
        if !parent.is_empty() && !state.folders.contains_key(parent) {
            return Err(StorageError::NotFound(parent.to_string()));
        }

        let existing = state
            .files
            .iter()
            .find(|(_, file)| file.path == path)
            .map(|(id, _)| id.clone());

        if let Some(total) = self.quota_bytes {
            let replaced = existing
                .as_ref()
                .and_then(|id| state.files.get(id))
                .map(|f| f.bytes.len() as u64)
                .unwrap_or(0);
            let available = total.saturating_sub(Self::used_bytes(&state) - replaced);
            if bytes.len() as u64 > available {
                return Err(StorageError::QuotaExceeded {
                    needed: bytes.len() as u64,
                    available,
                });
            }
        }

        let id = existing.unwrap_or_else(|| self.next_id("file"));
        state.files.insert(
            id.clone(),
            StoredFile {
                path: path.to_string(),
                bytes,
                modified_at: Utc::now(),
            },
        );
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }
}

/// Catalog kept in process memory
#[derive(Default)]
pub struct InMemoryCatalog {
    chapters: RwLock<HashMap<String, (ChapterRef, Vec<ArchiveEntry>)>>,
    backups: RwLock<HashMap<(String, String), BackupRecord>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a chapter and its files
    pub fn insert_chapter(&self, chapter: ChapterRef, files: Vec<ArchiveEntry>) {
        self.chapters
            .write()
            .insert(chapter.chapter_id.clone(), (chapter, files));
    }

    pub fn remove_chapter(&self, chapter_id: &str) -> Option<Vec<ArchiveEntry>> {
        self.chapters
            .write()
            .remove(chapter_id)
            .map(|(_, files)| files)
    }

    pub fn chapter_files(&self, chapter_id: &str) -> Option<Vec<ArchiveEntry>> {
        self.chapters
            .read()
            .get(chapter_id)
            .map(|(_, files)| files.clone())
    }

    pub fn chapter_count(&self) -> usize {
        self.chapters.read().len()
    }

    /// All backup records, ordered by chapter id
    pub fn backups(&self) -> Vec<BackupRecord> {
        let mut records: Vec<_> = self.backups.read().values().cloned().collect();
        records.sort_by(|a, b| a.chapter_id.cmp(&b.chapter_id));
        records
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn load_chapter_files(
        &self,
        chapter_id: &str,
    ) -> Result<Vec<ArchiveEntry>, CatalogError> {
        self.chapter_files(chapter_id)
            .ok_or_else(|| CatalogError::ChapterNotFound(chapter_id.to_string()))
    }

    async fn store_chapter_files(
        &self,
        chapter: &ChapterRef,
        files: Vec<ArchiveEntry>,
    ) -> Result<(), CatalogError> {
        self.insert_chapter(chapter.clone(), files);
        Ok(())
    }

    async fn record_backup(&self, record: BackupRecord) -> Result<(), CatalogError> {
        self.backups
            .write()
            .insert((record.chapter_id.clone(), record.provider.clone()), record);
        Ok(())
    }

    async fn backup_record(
        &self,
        chapter_id: &str,
        provider: &str,
    ) -> Result<Option<BackupRecord>, CatalogError> {
        Ok(self
            .backups
            .read()
            .get(&(chapter_id.to_string(), provider.to_string()))
            .cloned())
    }
}

#[derive(Debug, Default)]
struct SinkState {
    active: HashMap<String, ProgressEntry>,
    updates: usize,
    removed: Vec<String>,
    notifications: Vec<Notification>,
}

/// Progress sink that records everything it receives and logs it
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    state: Mutex<SinkState>,
}

impl RecordingProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress entries currently shown
    pub fn active_entries(&self) -> Vec<ProgressEntry> {
        let mut entries: Vec<_> = self.state.lock().active.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn entry(&self, id: &str) -> Option<ProgressEntry> {
        self.state.lock().active.get(id).cloned()
    }

    pub fn update_count(&self) -> usize {
        self.state.lock().updates
    }

    /// Ids removed, in removal order
    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.clone()
    }

    pub fn errors(&self) -> Vec<Notification> {
        self.state
            .lock()
            .notifications
            .iter()
            .filter(|n| n.level == NotificationLevel::Error)
            .cloned()
            .collect()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn update(&self, entry: ProgressEntry) {
        debug!(id = %entry.id, progress = entry.progress, status = %entry.status, "Progress");
        let mut state = self.state.lock();
        state.updates += 1;
        state.active.insert(entry.id.clone(), entry);
    }

    fn remove(&self, id: &str) {
        let mut state = self.state.lock();
        state.active.remove(id);
        state.removed.push(id.to_string());
    }

    fn notify(&self, notification: Notification) {
        match notification.level {
            NotificationLevel::Info => {
                info!(title = %notification.title, "{}", notification.message)
            }
            NotificationLevel::Error => {
                warn!(title = %notification.title, "{}", notification.message)
            }
        }
        self.state.lock().notifications.push(notification);
    }
}

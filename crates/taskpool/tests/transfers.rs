//! End-to-end backup and download flows against in-memory collaborators
//!
//! Run with: cargo test -p inkshelf-taskpool --test transfers

use std::sync::Arc;
use std::time::Duration;

use inkshelf_taskpool::collaborators::total_size;
use inkshelf_taskpool::prelude::*;

const SERIES: &str = "Vagabond";

fn pages(chapter: usize, count: usize) -> Vec<ArchiveEntry> {
    (0..count)
        .map(|page| {
            ArchiveEntry::new(
                format!("{:03}.jpg", page + 1),
                vec![(chapter * 31 + page) as u8; 4096],
            )
        })
        .collect()
}

fn chapter(index: usize) -> ChapterRef {
    ChapterRef::new(SERIES, format!("ch-{index}"), format!("Chapter {index}"))
}

struct Fixture {
    runtime: TransferRuntime,
    storage: Arc<InMemoryStorage>,
    catalog: Arc<InMemoryCatalog>,
    sink: Arc<RecordingProgressSink>,
    codec: Arc<ZipArchiveCodec>,
}

impl Fixture {
    fn new(settings: PoolSettings, storage: InMemoryStorage) -> Self {
        let sink = Arc::new(RecordingProgressSink::new());
        let runtime = TransferRuntime::new(Arc::new(StaticSettings::new(settings)), sink.clone())
            .with_hardware_concurrency(4);
        Self {
            runtime,
            storage: Arc::new(storage),
            catalog: Arc::new(InMemoryCatalog::new()),
            sink,
            codec: Arc::new(ZipArchiveCodec::new()),
        }
    }

    fn seed(&self, chapters: usize) -> Vec<BackupQueueItem> {
        (0..chapters)
            .map(|i| {
                let files = pages(i, 3);
                let raw = total_size(&files);
                self.catalog.insert_chapter(chapter(i), files);
                BackupQueueItem::new(self.storage.provider(), chapter(i), raw)
            })
            .collect()
    }

    async fn backups(&self) -> BackupQueue {
        self.runtime
            .backup_queue(self.storage.clone(), self.codec.clone(), self.catalog.clone())
            .await
    }

    async fn downloads(&self) -> DownloadQueue {
        self.runtime
            .download_queue(self.storage.clone(), self.codec.clone(), self.catalog.clone())
            .await
    }
}

async fn drain<I: QueueItem, H: TransferHandler<I>>(queue: &QueueOrchestrator<I, H>) {
    tokio::time::timeout(Duration::from_secs(10), queue.wait_until_idle())
        .await
        .expect("queue did not drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backup_creates_series_folder_once_and_records_every_chapter() {
    let fixture = Fixture::new(
        PoolSettings::default().with_upload_concurrency(2),
        InMemoryStorage::new("drive").with_latency(Duration::from_millis(10)),
    );
    let items = fixture.seed(6);
    let backups = fixture.backups().await;

    for item in items {
        assert!(backups.enqueue(item).await);
    }
    drain(&backups).await;

    let storage = &fixture.storage;
    assert_eq!(storage.ensure_folder_calls(), 1);
    assert_eq!(storage.upload_count(), 6);
    assert_eq!(storage.file_count(), 6);
    assert!(storage.peak_concurrent_uploads() <= 2);
    assert!(storage
        .file_at(&format!("inkshelf/{SERIES}/ch-0.cbz"))
        .is_some());

    let records = fixture.catalog.backups();
    assert_eq!(records.len(), 6);
    assert!(records.iter().all(|r| r.provider == "drive"));
    assert!(fixture.sink.errors().is_empty());

    assert_eq!(fixture.runtime.ledger().current_bytes(), 0);
    assert_eq!(fixture.runtime.manager().users(), 0);
}

#[tokio::test]
async fn downloaded_chapters_match_the_originals() {
    let fixture = Fixture::new(PoolSettings::default(), InMemoryStorage::new("drive"));
    let items = fixture.seed(3);
    let backups = fixture.backups().await;
    for item in items {
        backups.enqueue(item).await;
    }
    drain(&backups).await;

    let originals: Vec<_> = (0..3)
        .map(|i| fixture.catalog.remove_chapter(&format!("ch-{i}")).unwrap())
        .collect();
    assert_eq!(fixture.catalog.chapter_count(), 0);

    let downloads = fixture.downloads().await;
    for record in fixture.catalog.backups() {
        let index: usize = record.chapter_id.trim_start_matches("ch-").parse().unwrap();
        downloads
            .enqueue(DownloadQueueItem::new(
                "drive",
                record.remote_id,
                chapter(index),
                record.size_bytes,
            ))
            .await;
    }
    drain(&downloads).await;

    for (i, original) in originals.into_iter().enumerate() {
        let restored = fixture.catalog.chapter_files(&format!("ch-{i}")).unwrap();
        assert_eq!(restored, original);
    }
    assert_eq!(fixture.storage.download_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn share_link_downloads_are_throttled() {
    let interval = Duration::from_millis(750);
    let fixture = Fixture::new(
        PoolSettings::default().with_share_link_interval(interval),
        InMemoryStorage::new("mega").with_share_links(true),
    );
    let items = fixture.seed(3);
    let backups = fixture.backups().await;
    for item in items {
        backups.enqueue(item).await;
    }
    drain(&backups).await;

    let downloads = fixture.downloads().await;
    for record in fixture.catalog.backups() {
        downloads
            .enqueue(DownloadQueueItem::new(
                "mega",
                record.remote_id.clone(),
                ChapterRef::new(SERIES, record.chapter_id.clone(), "restored"),
                record.size_bytes,
            ))
            .await;
    }
    drain(&downloads).await;

    let times = fixture.storage.share_link_times();
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= interval);
    }
}

#[tokio::test]
async fn failed_uploads_are_reported_and_not_recorded() {
    let fixture = Fixture::new(PoolSettings::default(), InMemoryStorage::new("drive"));
    fixture.storage.fail_next_uploads(1);
    let items = fixture.seed(1);
    let backups = fixture.backups().await;

    backups.enqueue(items[0].clone()).await;
    drain(&backups).await;

    let errors = fixture.sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].title, "Backup failed");
    assert!(fixture.catalog.backups().is_empty());
    assert_eq!(fixture.runtime.ledger().current_bytes(), 0);

    // A retry is a new submission and succeeds
    backups.enqueue(items[0].clone()).await;
    drain(&backups).await;
    assert_eq!(fixture.catalog.backups().len(), 1);
}

#[tokio::test]
async fn missing_chapter_fails_in_preparation() {
    let fixture = Fixture::new(PoolSettings::default(), InMemoryStorage::new("drive"));
    let backups = fixture.backups().await;

    backups
        .enqueue(BackupQueueItem::new("drive", chapter(42), 1024))
        .await;
    drain(&backups).await;

    let errors = fixture.sink.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("chapter not found in catalog: ch-42"));
    assert_eq!(fixture.storage.upload_count(), 0);
}

#[tokio::test]
async fn folder_creation_failure_fails_the_item_and_allows_retry() {
    let fixture = Fixture::new(PoolSettings::default(), InMemoryStorage::new("drive"));
    fixture.storage.fail_next_folder_creations(1);
    let items = fixture.seed(1);
    let backups = fixture.backups().await;

    backups.enqueue(items[0].clone()).await;
    drain(&backups).await;
    assert_eq!(fixture.sink.errors().len(), 1);
    assert!(!fixture.runtime.locks().contains(&format!("drive:{SERIES}")));

    backups.enqueue(items[0].clone()).await;
    drain(&backups).await;
    assert_eq!(fixture.catalog.backups().len(), 1);
    assert!(fixture.runtime.locks().is_settled(&format!("drive:{SERIES}")));
}

#[tokio::test]
async fn corrupt_archive_fails_the_download() {
    let fixture = Fixture::new(PoolSettings::default(), InMemoryStorage::new("drive"));
    let codec = ZipArchiveCodec::stored();
    let mut archive = codec
        .compress(&[ArchiveEntry::new("001.jpg", vec![9u8; 200])])
        .unwrap();
    // Claim a 4 GiB page in the central directory
    let central = archive
        .windows(4)
        .position(|window| window == [0x50, 0x4b, 0x01, 0x02])
        .unwrap();
    archive[central + 24..central + 28].copy_from_slice(&0xFFFF_FFF0u32.to_le_bytes());

    fixture.storage.ensure_folder("inkshelf/Vagabond").await.unwrap();
    let remote_id = fixture
        .storage
        .upload("inkshelf/Vagabond/ch-9.cbz", archive)
        .await
        .unwrap();

    let downloads = fixture.downloads().await;
    downloads
        .enqueue(DownloadQueueItem::new("drive", remote_id, chapter(9), 200))
        .await;
    drain(&downloads).await;

    let errors = fixture.sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].title, "Download failed");
    assert!(fixture.catalog.chapter_files("ch-9").is_none());
    assert_eq!(fixture.runtime.ledger().current_bytes(), 0);
}

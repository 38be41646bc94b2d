// Simulated backup and download session against in-memory collaborators

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::commands::settings::{parse_size, PoolArgs};
use crate::output::{format_bytes, print_field, OutputFormat};
use anyhow::{bail, Result};
use clap::Args;
use inkshelf_taskpool::collaborators::total_size;
use inkshelf_taskpool::config::PoolSizing;
use inkshelf_taskpool::prelude::*;
use inkshelf_taskpool::LedgerSnapshot;
use serde::Serialize;
use tracing::info;

const PROVIDER: &str = "memory";
const SERIES: &str = "Simulated Series";

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of synthetic chapters
    #[arg(long, default_value = "12")]
    pub chapters: usize,

    /// Pages per chapter
    #[arg(long, default_value = "8")]
    pub pages: usize,

    /// Size of each page, e.g. 256KB
    #[arg(long, default_value = "256KB", value_parser = parse_size)]
    pub page_size: u64,

    /// Simulated remote latency per call in milliseconds
    #[arg(long, default_value = "20")]
    pub latency_ms: u64,

    #[command(flatten)]
    pub pool: PoolArgs,
}

#[derive(Debug, Serialize)]
struct PhaseSummary {
    submitted: usize,
    succeeded: usize,
    failed: usize,
    elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
struct SimulationSummary {
    sizing: PoolSizing,
    chapters: usize,
    raw_bytes: u64,
    archived_bytes: u64,
    backup: PhaseSummary,
    download: PhaseSummary,
    verified_chapters: usize,
    peak_concurrent_uploads: usize,
    folder_creations: usize,
    pools_built: usize,
    ledger: LedgerSnapshot,
}

/// Deterministic page content with enough variety to exercise compression
fn synthetic_page(chapter: usize, page: usize, size: u64) -> ArchiveEntry {
    let data: Vec<u8> = (0..size as usize)
        .map(|i| ((i / 64) ^ (chapter * 31 + page * 7)) as u8)
        .collect();
    ArchiveEntry::new(format!("{:03}.png", page + 1), data)
}

pub async fn run(args: SimulateArgs, output: OutputFormat) -> Result<()> {
    if args.chapters == 0 {
        bail!("--chapters must be at least 1");
    }

    let settings = args.pool.resolve();
    let sizing = PoolSizing::resolve(&settings, inkshelf_taskpool::config::hardware_concurrency());
    info!(
        units = sizing.unit_count,
        budget = sizing.memory_budget_bytes,
        chapters = args.chapters,
        "Starting simulation"
    );

    let sink = Arc::new(RecordingProgressSink::new());
    let runtime = TransferRuntime::new(Arc::new(StaticSettings::new(settings)), sink.clone());
    let storage = Arc::new(
        InMemoryStorage::new(PROVIDER).with_latency(Duration::from_millis(args.latency_ms)),
    );
    let catalog = Arc::new(InMemoryCatalog::new());
    let codec = Arc::new(ZipArchiveCodec::new());

    let mut originals = Vec::with_capacity(args.chapters);
    let mut raw_bytes = 0;
    for index in 0..args.chapters {
        let chapter = ChapterRef::new(
            SERIES,
            format!("ch-{:04}", index + 1),
            format!("Chapter {}", index + 1),
        );
        let files: Vec<ArchiveEntry> = (0..args.pages)
            .map(|page| synthetic_page(index, page, args.page_size))
            .collect();
        raw_bytes += total_size(&files);
        catalog.insert_chapter(chapter.clone(), files.clone());
        originals.push((chapter, files));
    }

    // Backup phase
    let backups = runtime
        .backup_queue(storage.clone(), codec.clone(), catalog.clone())
        .await;
    let started = Instant::now();
    for (chapter, files) in &originals {
        backups
            .enqueue(BackupQueueItem::new(PROVIDER, chapter.clone(), total_size(files)))
            .await;
    }
    backups.wait_until_idle().await;
    let records = catalog.backups();
    let backup = PhaseSummary {
        submitted: originals.len(),
        succeeded: records.len(),
        failed: sink.errors().len(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(succeeded = backup.succeeded, failed = backup.failed, "Backups finished");

    // Download phase restores into an emptied catalog
    for (chapter, _) in &originals {
        catalog.remove_chapter(&chapter.chapter_id);
    }
    let errors_before = sink.errors().len();
    let downloads = runtime
        .download_queue(storage.clone(), codec.clone(), catalog.clone())
        .await;
    let started = Instant::now();
    for record in &records {
        let Some((chapter, _)) = originals
            .iter()
            .find(|(chapter, _)| chapter.chapter_id == record.chapter_id)
        else {
            continue;
        };
        downloads
            .enqueue(DownloadQueueItem::new(
                PROVIDER,
                record.remote_id.clone(),
                chapter.clone(),
                record.size_bytes,
            ))
            .await;
    }
    downloads.wait_until_idle().await;

    let verified_chapters = originals
        .iter()
        .filter(|(chapter, files)| {
            catalog.chapter_files(&chapter.chapter_id).as_ref() == Some(files)
        })
        .count();
    let download_failed = sink.errors().len() - errors_before;
    let download = PhaseSummary {
        submitted: records.len(),
        succeeded: records.len().saturating_sub(download_failed),
        failed: download_failed,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(verified = verified_chapters, failed = download.failed, "Downloads finished");

    let summary = SimulationSummary {
        sizing,
        chapters: originals.len(),
        raw_bytes,
        archived_bytes: records.iter().map(|record| record.size_bytes).sum(),
        backup,
        download,
        verified_chapters,
        peak_concurrent_uploads: storage.peak_concurrent_uploads(),
        folder_creations: storage.folder_creations(),
        pools_built: runtime.manager().pools_built(),
        ledger: runtime.ledger_snapshot(),
    };

    if !output.is_text() {
        return output.print_value(&summary);
    }

    print_field("Units", &summary.sizing.unit_count.to_string());
    print_field("Memory budget", &format_bytes(summary.sizing.memory_budget_bytes));
    print_field("Chapters", &summary.chapters.to_string());
    print_field("Raw size", &format_bytes(summary.raw_bytes));
    print_field("Archived size", &format_bytes(summary.archived_bytes));
    print_field(
        "Backups",
        &format!(
            "{} ok, {} failed in {} ms",
            summary.backup.succeeded, summary.backup.failed, summary.backup.elapsed_ms
        ),
    );
    print_field(
        "Downloads",
        &format!(
            "{} ok, {} failed in {} ms",
            summary.download.succeeded, summary.download.failed, summary.download.elapsed_ms
        ),
    );
    print_field("Verified", &summary.verified_chapters.to_string());
    print_field("Peak uploads", &summary.peak_concurrent_uploads.to_string());
    print_field("Folders created", &summary.folder_creations.to_string());
    print_field("Pools built", &summary.pools_built.to_string());
    Ok(())
}

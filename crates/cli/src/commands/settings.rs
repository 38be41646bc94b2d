// Settings inspection command

use crate::output::{format_bytes, print_field, OutputFormat};
use anyhow::Result;
use clap::Args;
use inkshelf_taskpool::config::{hardware_concurrency, parse_byte_size};
use inkshelf_taskpool::{PoolSettings, PoolSizing};
use serde::Serialize;

/// Pool flags shared by commands; each overrides the environment when set
#[derive(Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// Worker unit count (capped at hardware concurrency)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Memory budget, e.g. 64MB or 1GiB
    #[arg(long, value_parser = parse_size)]
    pub budget: Option<u64>,

    /// Maximum concurrent uploads per provider
    #[arg(long)]
    pub upload_concurrency: Option<usize>,
}

pub(crate) fn parse_size(raw: &str) -> Result<u64, String> {
    parse_byte_size(raw).ok_or_else(|| format!("invalid byte size: {}", raw))
}

impl PoolArgs {
    /// Environment settings with flag overrides applied
    pub fn resolve(&self) -> PoolSettings {
        let mut settings = PoolSettings::from_env();
        if let Some(workers) = self.workers {
            settings = settings.with_worker_count(workers);
        }
        if let Some(budget) = self.budget {
            settings = settings.with_memory_budget(budget);
        }
        if let Some(limit) = self.upload_concurrency {
            settings = settings.with_upload_concurrency(limit);
        }
        settings
    }
}

#[derive(Debug, Serialize)]
struct SettingsReport {
    settings: PoolSettings,
    sizing: PoolSizing,
    hardware_concurrency: usize,
}

pub fn run(args: &PoolArgs, output: OutputFormat) -> Result<()> {
    let settings = args.resolve();
    let hardware = hardware_concurrency();
    let report = SettingsReport {
        sizing: PoolSizing::resolve(&settings, hardware),
        settings,
        hardware_concurrency: hardware,
    };

    if !output.is_text() {
        return output.print_value(&report);
    }

    print_field(
        "Memory budget",
        &format_bytes(report.settings.memory_budget_bytes),
    );
    print_field(
        "Worker count",
        &report
            .settings
            .worker_count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "auto".to_string()),
    );
    print_field(
        "Upload concurrency",
        &report.settings.upload_concurrency.to_string(),
    );
    print_field(
        "Share link interval",
        &format!("{} ms", report.settings.share_link_interval.as_millis()),
    );
    print_field("Hardware concurrency", &hardware.to_string());
    print_field("Resolved units", &report.sizing.unit_count.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("64MB"), Ok(64 * 1024 * 1024));
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_flags_override_settings() {
        let args = PoolArgs {
            workers: Some(2),
            budget: Some(1024),
            upload_concurrency: Some(3),
        };
        let settings = args.resolve();
        assert_eq!(settings.worker_count, Some(2));
        assert_eq!(settings.memory_budget_bytes, 1024);
        assert_eq!(settings.upload_concurrency, 3);
    }
}

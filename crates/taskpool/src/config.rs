//! Pool configuration
//!
//! Settings are loaded from environment variables and sampled by the pool
//! lifecycle manager when a pool is built. Malformed values never block
//! progress: they fall back to the defaults with a warning.

use std::num::NonZero;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default memory budget shared by all in-flight tasks (512 MiB)
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 512 * 1024 * 1024;

/// Default ceiling for concurrent uploads to one provider
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

/// Default minimum spacing between share-link creations on one provider
pub const DEFAULT_SHARE_LINK_INTERVAL: Duration = Duration::from_millis(1000);

/// Environment variable holding the memory budget (e.g. `512MB`)
pub const ENV_MEMORY_BUDGET: &str = "INKSHELF_MEMORY_BUDGET";
/// Environment variable holding the worker unit hint
pub const ENV_WORKER_COUNT: &str = "INKSHELF_WORKER_COUNT";
/// Environment variable holding the per-provider upload ceiling
pub const ENV_UPLOAD_CONCURRENCY: &str = "INKSHELF_UPLOAD_CONCURRENCY";
/// Environment variable holding the share-link spacing in milliseconds
pub const ENV_SHARE_LINK_INTERVAL_MS: &str = "INKSHELF_SHARE_LINK_INTERVAL_MS";

/// Resource settings for the shared transfer pool
///
/// # Example
///
/// ```
/// use inkshelf_taskpool::PoolSettings;
///
/// let settings = PoolSettings::default()
///     .with_memory_budget(256 * 1024 * 1024)
///     .with_worker_count(4);
/// assert_eq!(settings.worker_count, Some(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    /// Memory budget in bytes for all admitted tasks
    pub memory_budget_bytes: u64,

    /// Requested number of worker units (None = hardware concurrency)
    pub worker_count: Option<usize>,

    /// Maximum concurrent uploads per provider
    pub upload_concurrency: usize,

    /// Minimum spacing between share-link creations per provider
    #[serde(with = "duration_millis")]
    pub share_link_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            worker_count: None,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            share_link_interval: DEFAULT_SHARE_LINK_INTERVAL,
        }
    }
}

impl PoolSettings {
    /// Create settings from environment variables
    ///
    /// Environment variables:
    /// - `INKSHELF_MEMORY_BUDGET`: byte size such as `512MB` or `1GiB` (default: 512MiB)
    /// - `INKSHELF_WORKER_COUNT`: worker unit hint (default: hardware concurrency)
    /// - `INKSHELF_UPLOAD_CONCURRENCY`: per-provider upload ceiling (default: 8)
    /// - `INKSHELF_SHARE_LINK_INTERVAL_MS`: share-link spacing (default: 1000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create settings from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let memory_budget_bytes = match lookup(ENV_MEMORY_BUDGET) {
            Some(raw) => match parse_byte_size(&raw) {
                Some(bytes) if bytes > 0 => bytes,
                _ => {
                    warn!(value = %raw, "Invalid {}, using default", ENV_MEMORY_BUDGET);
                    defaults.memory_budget_bytes
                }
            },
            None => defaults.memory_budget_bytes,
        };

        let worker_count = match lookup(ENV_WORKER_COUNT) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => None,
                Ok(count) => Some(count),
                Err(_) => {
                    warn!(value = %raw, "Invalid {}, using hardware concurrency", ENV_WORKER_COUNT);
                    None
                }
            },
            None => None,
        };

        let upload_concurrency = match lookup(ENV_UPLOAD_CONCURRENCY) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(limit) if limit > 0 => limit,
                _ => {
                    warn!(value = %raw, "Invalid {}, using default", ENV_UPLOAD_CONCURRENCY);
                    defaults.upload_concurrency
                }
            },
            None => defaults.upload_concurrency,
        };

        let share_link_interval = match lookup(ENV_SHARE_LINK_INTERVAL_MS) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(millis) => Duration::from_millis(millis),
                Err(_) => {
                    warn!(value = %raw, "Invalid {}, using default", ENV_SHARE_LINK_INTERVAL_MS);
                    defaults.share_link_interval
                }
            },
            None => defaults.share_link_interval,
        };

        Self {
            memory_budget_bytes,
            worker_count,
            upload_concurrency,
            share_link_interval,
        }
    }

    /// Set the memory budget in bytes
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    /// Set the worker unit hint
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Set the per-provider upload ceiling
    pub fn with_upload_concurrency(mut self, limit: usize) -> Self {
        self.upload_concurrency = limit.max(1);
        self
    }

    /// Set the share-link spacing
    pub fn with_share_link_interval(mut self, interval: Duration) -> Self {
        self.share_link_interval = interval;
        self
    }
}

/// Source of live settings
///
/// Sampled at pool construction time and on explicit budget refreshes;
/// a running pool is never resized.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Current settings snapshot
    async fn current(&self) -> PoolSettings;
}

/// Settings fixed at startup
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(PoolSettings);

impl StaticSettings {
    pub fn new(settings: PoolSettings) -> Self {
        Self(settings)
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn current(&self) -> PoolSettings {
        self.0.clone()
    }
}

/// Settings that can be changed while the application runs
#[derive(Debug, Default)]
pub struct LiveSettings {
    inner: RwLock<PoolSettings>,
}

impl LiveSettings {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the settings
    pub fn set(&self, settings: PoolSettings) {
        *self.inner.write() = settings;
    }

    /// Modify the settings in place
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PoolSettings),
    {
        f(&mut *self.inner.write());
    }

    /// Plain synchronized read of the current value
    pub fn snapshot(&self) -> PoolSettings {
        self.inner.read().clone()
    }
}

#[async_trait]
impl SettingsProvider for LiveSettings {
    async fn current(&self) -> PoolSettings {
        self.snapshot()
    }
}

/// Pool dimensions resolved from settings and the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizing {
    /// Number of worker units
    pub unit_count: usize,

    /// Memory budget applied to the ledger
    pub memory_budget_bytes: u64,
}

impl PoolSizing {
    /// Resolve sizing against a hardware concurrency hint
    ///
    /// The unit count is the configured hint (or the hardware hint when
    /// unset), clamped to `1..=hardware`.
    pub fn resolve(settings: &PoolSettings, hardware_concurrency: usize) -> Self {
        let hardware = hardware_concurrency.max(1);
        let unit_count = settings
            .worker_count
            .filter(|count| *count > 0)
            .unwrap_or(hardware)
            .clamp(1, hardware);

        let memory_budget_bytes = if settings.memory_budget_bytes == 0 {
            warn!("Memory budget of 0 bytes configured, using default");
            DEFAULT_MEMORY_BUDGET_BYTES
        } else {
            settings.memory_budget_bytes
        };

        Self {
            unit_count,
            memory_budget_bytes,
        }
    }
}

/// Hardware concurrency of the host (at least 1)
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZero::get)
        .unwrap_or(1)
}

/// Parse a human byte size such as `512`, `64KB`, `512MB`, `1.5GiB`
///
/// Decimal and binary suffixes are both treated as powers of 1024.
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1024,
        "m" | "mb" | "mib" => 1024 * 1024,
        "g" | "gb" | "gib" => 1024 * 1024 * 1024,
        _ => return None,
    };

    Some((value * multiplier as f64).round() as u64)
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

//! Configuration for the replay engine.
//!
//! All sections have defaults, so an empty document is a valid config.
//! Durations are humantime strings (`"30s"`, `"10m"`, `"30d"`).
//!
//! # Configuration Structure
//!
//! ```text
//! ReplayConfig
//! ├── server: ServerConfig          # bind address, default partition
//! ├── dispatcher: DispatcherConfig  # worker pool, page/publish batch sizes
//! ├── pagination: PaginationConfig  # limits, page-fill guard, cursor cache
//! ├── timeouts: TimeoutConfig       # per backend call, discovery budget
//! └── store: StoreConfig            # memory | sqlite, retention
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! server:
//!   bind_addr: "0.0.0.0:8080"
//!   default_partition: "opendes"
//!
//! dispatcher:
//!   max_concurrent_kinds: 8
//!   publish_batch_size: 50
//!
//! pagination:
//!   cursor_ttl: "10m"
//!
//! store:
//!   backend: sqlite
//!   sqlite_path: "/var/lib/replay/progress.db"
//!   retention: "30d"
//! ```

use crate::error::{ReplayError, Result};
use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn parse_duration_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or(fallback)
}

/// Like [`parse_duration_or`], but a zero duration also falls back.
fn parse_nonzero_duration_or(raw: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or(fallback)
}

fn check_duration(field: &str, raw: &str, allow_zero: bool) -> Result<()> {
    let parsed = humantime::parse_duration(raw)
        .map_err(|e| ReplayError::Config(format!("{field} '{raw}': {e}")))?;
    if parsed.is_zero() && !allow_zero {
        return Err(ReplayError::Config(format!("{field} must be greater than zero")));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to the coordinator and the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl ReplayConfig {
    /// Short timeouts, small pages and an in-memory store.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            dispatcher: DispatcherConfig {
                page_size: 10,
                publish_batch_size: 3,
                publish_retry_attempts: 2,
                ..Default::default()
            },
            pagination: PaginationConfig {
                default_limit: 10,
                ..Default::default()
            },
            timeouts: TimeoutConfig {
                backend_call: "500ms".to_string(),
                discovery: "2s".to_string(),
            },
            store: StoreConfig::in_memory(),
        }
    }

    /// Load from a YAML (`.yaml`/`.yml`) or JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let config: Self = if is_yaml {
            serde_yaml::from_str(&raw)
                .map_err(|e| ReplayError::Config(format!("invalid YAML config: {e}")))?
        } else {
            serde_json::from_str(&raw)
                .map_err(|e| ReplayError::Config(format!("invalid JSON config: {e}")))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatcher;
        let p = &self.pagination;
        let checks = [
            (d.max_concurrent_kinds == 0, "dispatcher.max_concurrent_kinds must be > 0"),
            (d.page_size == 0, "dispatcher.page_size must be > 0"),
            (d.publish_batch_size == 0, "dispatcher.publish_batch_size must be > 0"),
            (d.count_batch_size == 0, "dispatcher.count_batch_size must be > 0"),
            (p.default_limit == 0, "pagination.default_limit must be > 0"),
            (p.max_limit < p.default_limit, "pagination.max_limit must be >= default_limit"),
            (p.max_fill_attempts == 0, "pagination.max_fill_attempts must be > 0"),
            (self.server.default_partition.trim().is_empty(), "server.default_partition must not be empty"),
        ];
        if let Some((_, msg)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(ReplayError::Config((*msg).to_string()));
        }

        check_duration("server.shutdown_grace", &self.server.shutdown_grace, true)?;
        check_duration("pagination.cursor_ttl", &p.cursor_ttl, false)?;
        check_duration("timeouts.backend_call", &self.timeouts.backend_call, false)?;
        check_duration("timeouts.discovery", &self.timeouts.discovery, false)?;
        check_duration("store.retention_interval", &self.store.retention_interval, false)?;
        if let Some(raw) = &self.store.retention {
            check_duration("store.retention", raw, true)?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Partition used when a request carries no `data-partition-id` header.
    #[serde(default = "default_partition")]
    pub default_partition: String,

    /// How long in-flight replays get to finish on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_partition() -> String {
    "default".to_string()
}

fn default_shutdown_grace() -> String {
    "30s".to_string()
}

impl ServerConfig {
    pub fn shutdown_grace_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_grace, Duration::from_secs(30))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_partition: default_partition(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatcherConfig: per-kind fan-out
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Kinds processed concurrently across all replays.
    #[serde(default = "default_max_concurrent_kinds")]
    pub max_concurrent_kinds: usize,

    /// Record ids requested per page while walking a kind.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Events per publish call.
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,

    /// Kinds per `count_active` call when pre-fetching totals.
    #[serde(default = "default_count_batch_size")]
    pub count_batch_size: usize,

    /// Attempts per publish batch before the kind is failed.
    #[serde(default = "default_publish_retry_attempts")]
    pub publish_retry_attempts: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (downstream protection)
    // ─────────────────────────────────────────────────────────────────────────

    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Publish batches per second (sustained).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_max_concurrent_kinds() -> usize {
    4
}

fn default_page_size() -> usize {
    1000
}

fn default_publish_batch_size() -> usize {
    50
}

fn default_count_batch_size() -> usize {
    10
}

fn default_publish_retry_attempts() -> usize {
    3
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

fn default_rate_limit_burst() -> u32 {
    20
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_kinds: default_max_concurrent_kinds(),
            page_size: default_page_size(),
            publish_batch_size: default_publish_batch_size(),
            count_batch_size: default_count_batch_size(),
            publish_retry_attempts: default_publish_retry_attempts(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl DispatcherConfig {
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit_enabled.then(|| RateLimitConfig {
            burst_size: self.rate_limit_burst,
            refill_rate: self.rate_limit_per_sec,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PaginationConfig: list endpoints and cursor cache
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationConfig {
    /// Page size when `limit` is missing or not positive.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Larger limits are clamped to this.
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Backend calls allowed while topping up one page.
    #[serde(default = "default_max_fill_attempts")]
    pub max_fill_attempts: usize,

    /// How long an issued cursor stays resolvable.
    #[serde(default = "default_cursor_ttl")]
    pub cursor_ttl: String,

    #[serde(default = "default_cursor_cache_capacity")]
    pub cursor_cache_capacity: u64,
}

fn default_limit() -> usize {
    1000
}

fn default_max_limit() -> usize {
    10_000
}

fn default_max_fill_attempts() -> usize {
    10
}

fn default_cursor_ttl() -> String {
    "10m".to_string()
}

fn default_cursor_cache_capacity() -> u64 {
    100_000
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            max_fill_attempts: default_max_fill_attempts(),
            cursor_ttl: default_cursor_ttl(),
            cursor_cache_capacity: default_cursor_cache_capacity(),
        }
    }
}

impl PaginationConfig {
    pub fn cursor_ttl_duration(&self) -> Duration {
        parse_nonzero_duration_or(&self.cursor_ttl, Duration::from_secs(600))
    }

    /// Resolve a client `limit` hint to an effective page size.
    pub fn effective_limit(&self, requested: Option<i64>) -> usize {
        match requested {
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(usize::MAX).min(self.max_limit),
            _ => self.default_limit,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TimeoutConfig
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Deadline for any single backend call.
    #[serde(default = "default_backend_call_timeout")]
    pub backend_call: String,

    /// Deadline for full-catalog kind discovery.
    #[serde(default = "default_discovery_timeout")]
    pub discovery: String,
}

fn default_backend_call_timeout() -> String {
    "30s".to_string()
}

fn default_discovery_timeout() -> String {
    "5m".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            backend_call: default_backend_call_timeout(),
            discovery: default_discovery_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn backend_call_duration(&self) -> Duration {
        parse_nonzero_duration_or(&self.backend_call, Duration::from_secs(30))
    }

    pub fn discovery_duration(&self) -> Duration {
        parse_nonzero_duration_or(&self.discovery, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: progress persistence and retention
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Purge finished jobs older than this. `None` keeps rows forever.
    #[serde(default)]
    pub retention: Option<String>,

    /// How often the purge task runs when retention is set.
    #[serde(default = "default_retention_interval")]
    pub retention_interval: String,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_sqlite_path() -> String {
    "replay_progress.db".to_string()
}

fn default_retention_interval() -> String {
    "1h".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
            retention: None,
            retention_interval: default_retention_interval(),
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            ..Default::default()
        }
    }

    pub fn retention_duration(&self) -> Option<Duration> {
        self.retention
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }

    pub fn retention_interval_duration(&self) -> Duration {
        parse_nonzero_duration_or(&self.retention_interval, Duration::from_secs(3600))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

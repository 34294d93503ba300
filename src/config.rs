//! Configuration Module
//!
//! Handles loading cache and allocator configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::btree::DEFAULT_ORDER;
use crate::mem::{AllocatorConfig, DEFAULT_HIGH_WATERMARK};

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of entries the cache can hold
    pub max_entries: usize,
    /// Default TTL in milliseconds for entries without explicit TTL, None = no expiry
    pub default_ttl_ms: Option<u64>,
    /// Background sweep task interval in milliseconds
    pub sweep_interval_ms: u64,
    /// Order of the cache's B-tree indexes
    pub btree_order: usize,
    /// Allocate values with boundary canaries
    pub strict_values: bool,
    /// Upper bound on retained allocator bytes, None = unlimited
    pub memory_limit_bytes: Option<usize>,
    /// Live bytes above which the allocator reports memory pressure
    pub high_watermark_bytes: usize,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_ENTRIES` - Maximum cache entries (default: 1000)
    /// - `DEFAULT_TTL_MS` - Default TTL in milliseconds, or `none` (default: 300000)
    /// - `SWEEP_INTERVAL_MS` - Sweep frequency in milliseconds (default: 1000)
    /// - `BTREE_ORDER` - Index order (default: 32)
    /// - `STRICT_VALUES` - Canary-check value storage (default: false)
    /// - `MEMORY_LIMIT_BYTES` - Allocator memory limit, or `none` (default: none)
    /// - `HIGH_WATERMARK_BYTES` - Memory pressure threshold (default: 512 MiB)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a Config from an arbitrary variable source. Unset or
    /// unparseable variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            max_entries: lookup("MAX_ENTRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_entries),
            default_ttl_ms: lookup("DEFAULT_TTL_MS")
                .and_then(|v| parse_optional(&v))
                .unwrap_or(defaults.default_ttl_ms),
            sweep_interval_ms: lookup("SWEEP_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_interval_ms),
            btree_order: lookup("BTREE_ORDER")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.btree_order),
            strict_values: lookup("STRICT_VALUES")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.strict_values),
            memory_limit_bytes: lookup("MEMORY_LIMIT_BYTES")
                .and_then(|v| parse_optional(&v))
                .unwrap_or(defaults.memory_limit_bytes),
            high_watermark_bytes: lookup("HIGH_WATERMARK_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.high_watermark_bytes),
        }
    }

    /// Default TTL as a `Duration`.
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_ms.map(Duration::from_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Allocator settings derived from this configuration.
    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            memory_limit_bytes: self.memory_limit_bytes,
            high_watermark_bytes: self.high_watermark_bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl_ms: Some(300_000),
            sweep_interval_ms: 1000,
            btree_order: DEFAULT_ORDER,
            strict_values: false,
            memory_limit_bytes: None,
            high_watermark_bytes: DEFAULT_HIGH_WATERMARK,
        }
    }
}

/// Parses a number, or `none` for an absent value. Returns None when the
/// text is neither.
fn parse_optional<T: std::str::FromStr>(value: &str) -> Option<Option<T>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") {
        return Some(None);
    }
    value.parse().ok().map(Some)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

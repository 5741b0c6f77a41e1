//! Runtime configuration.
//!
//! Every build-time switch of the engine is a field here, resolved once when a
//! [`Runtime`](crate::Runtime) is created:
//! - `SAFEPOOL_MODE`: `production` (default) terminates on a violation,
//!   `diagnostic` reports and continues, `off` disables checking entirely.
//! - `SAFEPOOL_INDEXING`: `strict`, `one-past-end` (default) or `rewrite`.
//! - `SAFEPOOL_DANGLING`: `1`/`0`, remap allocations to shadow pages.
//! - `SAFEPOOL_TRACK_EXTERNAL`: `1`/`0`, consult the external registry in
//!   incomplete dereference checks. Index checks and complete dereference
//!   checks always consult it.
//! - `SAFEPOOL_REPORT_LOG`: path of a JSONL file receiving one record per
//!   violation.
//! - `SAFEPOOL_SENTINEL_BYTES`: size of the reserved sentinel range.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// What happens after a violation has been reported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Report, then terminate the process.
    #[default]
    Production,
    /// Report and let the program continue with the unchecked value.
    Diagnostic,
    /// No checking. Allocation still goes through the pools.
    Off,
}

impl EnforcementMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "abort" | "strict" | "default" => Self::Production,
            "diagnostic" | "debug" | "continue" | "report" => Self::Diagnostic,
            "off" | "none" | "disabled" => Self::Off,
            _ => Self::Production,
        }
    }

    /// Returns true if a reported violation ends the process.
    #[must_use]
    pub const fn terminates(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns true if check calls do any work.
    #[must_use]
    pub const fn checks_enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Diagnostic => "diagnostic",
            Self::Off => "off",
        }
    }
}

/// Policy for an indexing result that leaves its source object.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexingMode {
    /// Every result outside `[start, end)` is a violation, including `end`.
    Strict,
    /// A result exactly at `end` becomes a sentinel; anything further out is a
    /// violation.
    #[default]
    OnePastEnd,
    /// Every out-of-bounds result becomes a sentinel. Dereferencing one is a
    /// load/store violation.
    Rewrite,
}

impl IndexingMode {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" | "on" | "1" => Self::Strict,
            "rewrite" | "oob" | "all" => Self::Rewrite,
            _ => Self::OnePastEnd,
        }
    }

    /// Whether a failed index producing `result` against an object ending at
    /// `end` is converted into a sentinel instead of a report.
    #[must_use]
    pub const fn tolerates(self, result: usize, end: usize) -> bool {
        match self {
            Self::Strict => false,
            Self::OnePastEnd => result == end,
            Self::Rewrite => true,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::OnePastEnd => "one-past-end",
            Self::Rewrite => "rewrite",
        }
    }
}

/// Capacities of the trie backend's fixed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftBoundConfig {
    /// Heap lock cells.
    pub lock_entries: usize,
    /// Stack lock cells (used as a LIFO cursor).
    pub stack_lock_entries: usize,
    /// Words in the metadata shadow stack.
    pub shadow_stack_words: usize,
    /// Slots in the deallocation free map.
    pub free_map_entries: usize,
    /// Longest linear probe sequence tolerated in the free map.
    pub free_map_max_probe: usize,
}

impl Default for SoftBoundConfig {
    fn default() -> Self {
        Self {
            lock_entries: 64 * 1024 * 1024,
            stack_lock_entries: 64 * 1024,
            shadow_stack_words: 128 * 32,
            free_map_entries: 32 * 1024 * 1024,
            free_map_max_probe: 4096,
        }
    }
}

impl SoftBoundConfig {
    /// Small tables for tests and short-lived tools.
    #[must_use]
    pub const fn compact() -> Self {
        Self {
            lock_entries: 4096,
            stack_lock_entries: 1024,
            shadow_stack_words: 1024,
            free_map_entries: 4096,
            free_map_max_probe: 64,
        }
    }
}

/// Default size of the reserved sentinel range (1 GiB).
pub const DEFAULT_SENTINEL_BYTES: usize = 1 << 30;

/// The single configuration record of a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub mode: EnforcementMode,
    pub indexing: IndexingMode,
    /// Remap allocations to shadow pages and trap accesses after free.
    pub dangling: bool,
    /// Fall back to the external registry in incomplete dereference checks.
    pub track_external: bool,
    pub report_log: Option<PathBuf>,
    pub sentinel_bytes: usize,
    pub softbound: SoftBoundConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::default(),
            indexing: IndexingMode::default(),
            dangling: dangling_supported(),
            track_external: false,
            report_log: None,
            sentinel_bytes: DEFAULT_SENTINEL_BYTES,
            softbound: SoftBoundConfig::default(),
        }
    }
}

/// True when this build can run the page-remap detector.
#[must_use]
pub const fn dangling_supported() -> bool {
    cfg!(all(target_os = "linux", feature = "dangling-detector"))
}

impl RuntimeConfig {
    /// Diagnostic configuration with compact tables, for tests and the harness.
    #[must_use]
    pub fn diagnostic() -> Self {
        Self {
            mode: EnforcementMode::Diagnostic,
            sentinel_bytes: 1 << 24,
            softbound: SoftBoundConfig::compact(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_indexing(mut self, indexing: IndexingMode) -> Self {
        self.indexing = indexing;
        self
    }

    #[must_use]
    pub fn with_dangling(mut self, enabled: bool) -> Self {
        self.dangling = enabled && dangling_supported();
        self
    }

    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RuntimeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup("SAFEPOOL_MODE") {
            config.mode = EnforcementMode::from_str_loose(&raw);
        }
        if let Some(raw) = lookup("SAFEPOOL_INDEXING") {
            config.indexing = IndexingMode::from_str_loose(&raw);
        }
        if let Some(raw) = lookup("SAFEPOOL_DANGLING") {
            config.dangling = parse_flag("SAFEPOOL_DANGLING", &raw)? && dangling_supported();
        }
        if let Some(raw) = lookup("SAFEPOOL_TRACK_EXTERNAL") {
            config.track_external = parse_flag("SAFEPOOL_TRACK_EXTERNAL", &raw)?;
        }
        if let Some(raw) = lookup("SAFEPOOL_REPORT_LOG") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                config.report_log = Some(PathBuf::from(trimmed));
            }
        }
        if let Some(raw) = lookup("SAFEPOOL_SENTINEL_BYTES") {
            let bytes = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|bytes| *bytes > 0)
                .ok_or_else(|| RuntimeError::ConfigValue {
                    key: "SAFEPOOL_SENTINEL_BYTES",
                    value: raw.clone(),
                })?;
            config.sentinel_bytes = bytes;
        }
        Ok(config)
    }
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, RuntimeError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(RuntimeError::ConfigValue {
            key,
            value: raw.to_string(),
        }),
    }
}

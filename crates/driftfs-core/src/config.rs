//! Mount configuration
//!
//! Typed configuration mapped from the YAML configuration file, with
//! defaults, range validation, and duration accessors. Every violation is
//! reported as a `DriftError::Config` naming the field and the valid range;
//! any violation fails mount.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::errors::DriftError;

const MIB: u64 = 1024 * 1024;
const KIB_320: u64 = 320 * 1024;

/// Top-level mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub probe: ProbeConfig,
    pub offline: OfflineConfig,
    pub poll: PollConfig,
    pub cache: CacheConfig,
    pub conflict: ConflictConfig,
    pub mount: MountConfig,
    pub index: IndexConfig,
}

/// Download pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Parallel download workers
    pub workers: u32,
    /// Per-item retry attempts
    pub retries: u32,
    /// Pending download buffer size
    pub queue: u32,
    /// Chunk threshold and chunk size for resumable downloads
    pub chunk_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            retries: 3,
            queue: 500,
            chunk_bytes: 10 * MIB,
        }
    }
}

/// Upload pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Parallel upload workers
    pub workers: u32,
    /// Chunk size for chunked-session uploads; the remote store requires a
    /// multiple of 320 KiB
    pub chunk_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            chunk_bytes: 10 * MIB,
        }
    }
}

/// Active connectivity probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            timeout_secs: 10,
        }
    }
}

/// Offline change queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// High-water mark for queued offline changes
    pub max_changes: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { max_changes: 1000 }
    }
}

/// Delta sync polling cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Cadence while a change-notification transport is healthy
    pub interval_healthy_secs: u64,
    /// Cadence while no transport is healthy
    pub interval_fallback_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_healthy_secs: 30 * 60,
            interval_fallback_secs: 5 * 60,
        }
    }
}

/// Content cache retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries idle longer than this are evicted
    pub retention_days: u32,
    /// Cleanup timer period
    pub cleanup_interval_hours: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            cleanup_interval_hours: 24,
        }
    }
}

/// A per-path conflict policy rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Glob matched against the path relative to the mount root
    pub pattern: String,
    /// Strategy name, same vocabulary as `conflict.strategy`
    pub strategy: String,
}

/// Conflict resolution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Default strategy: `keep-both`, `last-writer-wins`, `keep-local`,
    /// `keep-remote`, `rename`, or `user-choice`
    pub strategy: String,
    /// Per-path overrides, first match wins
    pub rules: Vec<ConflictRule>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: "keep-both".to_string(),
            rules: Vec::new(),
        }
    }
}

/// Mount lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount setup timeout
    pub timeout_secs: u64,
    /// Override for the cache directory; platform default when unset
    pub cache_dir: Option<PathBuf>,
    /// Override for the config directory; platform default when unset
    pub config_dir: Option<PathBuf>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            cache_dir: None,
            config_dir: None,
        }
    }
}

/// Metadata index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory listings older than this schedule a background refresh
    pub refresh_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { refresh_secs: 30 }
    }
}

/// Valid values for `conflict.strategy`
pub const VALID_CONFLICT_STRATEGIES: &[&str] = &[
    "keep-both",
    "last-writer-wins",
    "keep-local",
    "keep-remote",
    "rename",
    "user-choice",
];

impl Config {
    /// Loads configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, DriftError> {
        let content = std::fs::read_to_string(path).map_err(|e| DriftError::Config {
            field: "config".into(),
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        serde_yaml::from_str(&content).map_err(|e| DriftError::Config {
            field: "config".into(),
            message: format!("cannot parse {}: {e}", path.display()),
        })
    }

    /// Tries `path`, falls back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform default for the per-mount config directory (mode 0700)
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("driftfs")
    }

    /// Platform default for the per-mount cache directory (mode 0755)
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("~/.cache"))
            .join("driftfs")
    }

    /// Validates every field and returns all violations found
    pub fn validate(&self) -> Vec<DriftError> {
        let mut errors = Vec::new();

        let mut range = |field: &str, value: u64, min: u64, max: u64, unit: &str| {
            if value < min || value > max {
                errors.push(DriftError::Config {
                    field: field.to_string(),
                    message: format!("must be between {min} and {max} {unit}, got {value}"),
                });
            }
        };

        range("download.workers", self.download.workers as u64, 1, 10, "");
        range("download.retries", self.download.retries as u64, 1, 10, "");
        range("download.queue", self.download.queue as u64, 100, 5000, "");
        range(
            "download.chunk_bytes",
            self.download.chunk_bytes,
            MIB,
            100 * MIB,
            "bytes",
        );
        range("upload.workers", self.upload.workers as u64, 1, 10, "");
        range(
            "upload.chunk_bytes",
            self.upload.chunk_bytes,
            KIB_320,
            60 * MIB,
            "bytes",
        );

        if self.upload.chunk_bytes % KIB_320 != 0 {
            errors.push(DriftError::Config {
                field: "upload.chunk_bytes".into(),
                message: format!(
                    "must be a multiple of {KIB_320} bytes, got {}",
                    self.upload.chunk_bytes
                ),
            });
        }

        if self.probe.interval_secs < 1 {
            errors.push(DriftError::Config {
                field: "probe.interval".into(),
                message: "must be at least 1s".into(),
            });
        }
        if self.probe.timeout_secs < 1 {
            errors.push(DriftError::Config {
                field: "probe.timeout".into(),
                message: "must be at least 1s".into(),
            });
        }
        if self.offline.max_changes < 1 {
            errors.push(DriftError::Config {
                field: "offline.max_changes".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.poll.interval_healthy_secs < 300 {
            errors.push(DriftError::Config {
                field: "poll.interval_healthy".into(),
                message: "must be at least 5 minutes".into(),
            });
        }
        if self.poll.interval_fallback_secs < 10 {
            errors.push(DriftError::Config {
                field: "poll.interval_fallback".into(),
                message: "must be at least 10 seconds".into(),
            });
        }
        if self.cache.retention_days < 1 {
            errors.push(DriftError::Config {
                field: "cache.retention".into(),
                message: "must be at least 1 day".into(),
            });
        }
        if self.cache.cleanup_interval_hours < 1 {
            errors.push(DriftError::Config {
                field: "cache.cleanup_interval".into(),
                message: "must be at least 1 hour".into(),
            });
        }
        if self.mount.timeout_secs < 1 {
            errors.push(DriftError::Config {
                field: "mount.timeout".into(),
                message: "must be at least 1s".into(),
            });
        }
        if self.index.refresh_secs < 5 {
            errors.push(DriftError::Config {
                field: "index.refresh_secs".into(),
                message: "must be at least 5 seconds".into(),
            });
        }

        if !VALID_CONFLICT_STRATEGIES.contains(&self.conflict.strategy.as_str()) {
            errors.push(DriftError::Config {
                field: "conflict.strategy".into(),
                message: format!(
                    "unknown strategy '{}'; valid: {}",
                    self.conflict.strategy,
                    VALID_CONFLICT_STRATEGIES.join(", ")
                ),
            });
        }
        for rule in &self.conflict.rules {
            if !VALID_CONFLICT_STRATEGIES.contains(&rule.strategy.as_str()) {
                errors.push(DriftError::Config {
                    field: "conflict.rules".into(),
                    message: format!(
                        "rule '{}' has unknown strategy '{}'",
                        rule.pattern, rule.strategy
                    ),
                });
            }
        }

        errors
    }

    /// Fails with the first violation; called at mount
    pub fn ensure_valid(&self) -> Result<(), DriftError> {
        match self.validate().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // --- Duration accessors ---

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs)
    }

    pub fn poll_interval_healthy(&self) -> Duration {
        Duration::from_secs(self.poll.interval_healthy_secs)
    }

    pub fn poll_interval_fallback(&self) -> Duration {
        Duration::from_secs(self.poll.interval_fallback_secs)
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_secs(self.cache.retention_days as u64 * 24 * 3600)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval_hours as u64 * 3600)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount.timeout_secs)
    }

    pub fn index_refresh(&self) -> Duration {
        Duration::from_secs(self.index.refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_empty());
        assert!(config.ensure_valid().is_ok());
    }

    #[test]
    fn test_default_values_match_documentation() {
        let config = Config::default();
        assert_eq!(config.download.workers, 3);
        assert_eq!(config.download.retries, 3);
        assert_eq!(config.download.queue, 500);
        assert_eq!(config.download.chunk_bytes, 10 * MIB);
        assert_eq!(config.upload.workers, 3);
        assert_eq!(config.probe.interval_secs, 15);
        assert_eq!(config.probe.timeout_secs, 10);
        assert_eq!(config.offline.max_changes, 1000);
        assert_eq!(config.poll.interval_healthy_secs, 1800);
        assert_eq!(config.poll.interval_fallback_secs, 300);
        assert_eq!(config.cache.retention_days, 30);
        assert_eq!(config.conflict.strategy, "keep-both");
        assert_eq!(config.mount.timeout_secs, 60);
    }

    #[test]
    fn test_workers_out_of_range() {
        let mut config = Config::default();
        config.download.workers = 0;
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            DriftError::Config { field, message } => {
                assert_eq!(field, "download.workers");
                assert!(message.contains("between 1 and 10"));
            }
            other => panic!("expected Config error, got {other:?}"),
        }

        config.download.workers = 11;
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn test_queue_bounds() {
        let mut config = Config::default();
        config.download.queue = 99;
        assert!(!config.validate().is_empty());
        config.download.queue = 5001;
        assert!(!config.validate().is_empty());
        config.download.queue = 5000;
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_upload_chunk_alignment() {
        let mut config = Config::default();
        config.upload.chunk_bytes = 10 * MIB + 1;
        let errors = config.validate();
        assert!(errors
            .iter()
            .any(|e| matches!(e, DriftError::Config { field, .. } if field == "upload.chunk_bytes")));
    }

    #[test]
    fn test_poll_interval_floors() {
        let mut config = Config::default();
        config.poll.interval_healthy_secs = 299;
        assert!(!config.validate().is_empty());

        config.poll.interval_healthy_secs = 300;
        config.poll.interval_fallback_secs = 9;
        assert!(!config.validate().is_empty());

        config.poll.interval_fallback_secs = 10;
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let mut config = Config::default();
        config.conflict.strategy = "coin-flip".into();
        let err = config.ensure_valid().unwrap_err();
        match err {
            DriftError::Config { field, message } => {
                assert_eq!(field, "conflict.strategy");
                assert!(message.contains("keep-both"));
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_rule_strategy_rejected() {
        let mut config = Config::default();
        config.conflict.rules.push(ConflictRule {
            pattern: "**/*.docx".into(),
            strategy: "yolo".into(),
        });
        assert!(!config.validate().is_empty());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "download:\n  workers: 5\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.download.workers, 5);
        assert_eq!(config.download.retries, 3);
        assert_eq!(config.upload.workers, 3);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load(Path::new("/nonexistent/driftfs.yaml")).unwrap_err();
        assert!(matches!(err, DriftError::Config { .. }));
    }
}

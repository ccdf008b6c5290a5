//! Runtime configuration for scans.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// All runtime settings for a scan run.
///
/// Built-in defaults, overridden by `TRUESPEC_*` environment variables, then
/// by the persisted user config (when present and marked configured), then by
/// CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Maximum concurrent worker children.
    pub concurrency: usize,
    /// Seconds without progress (both clocks) before a torrent is dropped.
    pub stall_timeout: u64,
    /// Absolute maximum seconds per torrent.
    pub max_timeout: u64,
    /// Explicit ffprobe path; auto-detected when absent.
    pub ffprobe_path: Option<PathBuf>,
    /// Scratch root; purged on startup and after the run.
    pub temp_dir: PathBuf,
    /// Initial byte budget for MKV-family targets.
    pub min_bytes_mkv: u64,
    /// Byte-budget baseline for MP4-family targets (moov may be at the end).
    pub min_bytes_mp4: u64,
    /// Probe retries after the initial attempt; each doubles the budget.
    pub max_probe_retries: u32,
    /// Persistent stats file; `None` disables stats tracking.
    pub stats_file: Option<PathBuf>,
    /// Report output path; timestamped default when absent.
    pub output_file: Option<PathBuf>,
    /// All logs to stderr instead of the compact summary.
    pub verbose: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            concurrency: 5,
            stall_timeout: 90,
            max_timeout: 600,
            ffprobe_path: None,
            temp_dir: std::env::temp_dir().join("truespec"),
            min_bytes_mkv: 10 * 1024 * 1024,
            min_bytes_mp4: 20 * 1024 * 1024,
            max_probe_retries: 3,
            stats_file: Some(super::user::default_stats_path()),
            output_file: None,
            verbose: false,
        }
    }
}

impl ScanConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout)
    }

    /// Checks the cross-field invariants before a scan starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.stall_timeout > self.max_timeout {
            return Err(ConfigError::Invalid(format!(
                "stall timeout ({}s) exceeds max timeout ({}s)",
                self.stall_timeout, self.max_timeout
            )));
        }
        if self.min_bytes_mkv == 0 || self.min_bytes_mp4 == 0 {
            return Err(ConfigError::Invalid(
                "byte thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ScanConfig::default();
        assert_eq!(cfg.concurrency, 5);
        assert_eq!(cfg.stall_timeout(), Duration::from_secs(90));
        assert_eq!(cfg.max_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.min_bytes_mkv, 10 << 20);
        assert_eq!(cfg.min_bytes_mp4, 20 << 20);
        assert_eq!(cfg.max_probe_retries, 3);
        assert!(cfg.temp_dir.ends_with("truespec"));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let cfg = ScanConfig {
            stall_timeout: 700,
            max_timeout: 600,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let cfg = ScanConfig {
            min_bytes_mkv: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ScanConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}

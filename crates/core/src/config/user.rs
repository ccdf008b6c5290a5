//! Persisted user configuration.
//!
//! Lives at `~/.truespec/config.json` and is honored only once the user has
//! run `truespec config` (the `configured` flag). CLI flags still override
//! everything here at runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ConfigError, ScanConfig};

/// Default maximum number of audio tracks to run language detection on per
/// torrent.
pub const DEFAULT_WHISPER_MAX_TRACKS: usize = 3;

/// User-controlled feature switches and scan defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    /// Track scan statistics in the stats file.
    pub stats_enabled: bool,

    /// Detect language for `und` audio tracks with whisper.
    pub whisper_enabled: bool,
    /// Path to the whisper-cli binary.
    pub whisper_path: String,
    /// Path to the ggml model file.
    pub whisper_model: String,
    /// Max audio tracks to detect per torrent (0 = default 3).
    pub whisper_max_tracks: usize,

    /// Analyze torrent file listings for threats.
    pub threat_scan_enabled: bool,

    /// Default concurrent downloads.
    pub concurrency: usize,
    /// Seconds before declaring a stalled torrent.
    pub stall_timeout: u64,
    /// Absolute max seconds per torrent.
    pub max_timeout: u64,

    /// Default output mode: all logs to stderr.
    pub verbose: bool,

    /// True after the first run of `truespec config`.
    pub configured: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            stats_enabled: true,
            whisper_enabled: false,
            whisper_path: String::new(),
            whisper_model: String::new(),
            whisper_max_tracks: 0,
            threat_scan_enabled: true,
            concurrency: 5,
            stall_timeout: 90,
            max_timeout: 600,
            verbose: false,
            configured: false,
        }
    }
}

impl UserConfig {
    /// Loads from disk; any read or parse failure falls back to defaults.
    pub fn load() -> UserConfig {
        let path = user_config_path();
        match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), "user config unreadable, using defaults: {e}");
                UserConfig::default()
            }),
            Err(_) => UserConfig::default(),
        }
    }

    /// Writes to disk atomically (temp file + rename).
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = user_config_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })?;

        Ok(())
    }

    /// Merges the persisted settings into a runtime config. A no-op until
    /// the user has completed `truespec config`.
    pub fn apply_to(&self, cfg: &mut ScanConfig) {
        if !self.configured {
            return;
        }

        if !self.stats_enabled {
            cfg.stats_file = None;
        }
        if self.concurrency > 0 {
            cfg.concurrency = self.concurrency;
        }
        if self.stall_timeout > 0 {
            cfg.stall_timeout = self.stall_timeout;
        }
        if self.max_timeout > 0 {
            cfg.max_timeout = self.max_timeout;
        }
        cfg.verbose = self.verbose;
    }

    /// Effective whisper track cap.
    pub fn whisper_max_tracks(&self) -> usize {
        if self.whisper_max_tracks > 0 {
            self.whisper_max_tracks
        } else {
            DEFAULT_WHISPER_MAX_TRACKS
        }
    }

    /// Human-readable configuration summary.
    pub fn show(&self) -> String {
        let yn = |b: bool| if b { "yes" } else { "no" };

        let mut s = String::new();
        s.push_str("TrueSpec Configuration\n\n");
        s.push_str(&format!("  Stats tracking:       {}\n", yn(self.stats_enabled)));
        s.push_str(&format!(
            "  Threat detection:     {}\n",
            yn(self.threat_scan_enabled)
        ));
        s.push_str(&format!(
            "  Whisper lang detect:  {}\n",
            yn(self.whisper_enabled)
        ));
        if self.whisper_enabled {
            s.push_str(&format!(
                "    Binary:             {}\n",
                value_or_na(&self.whisper_path)
            ));
            s.push_str(&format!(
                "    Model:              {}\n",
                value_or_na(&self.whisper_model)
            ));
            s.push_str(&format!(
                "    Max tracks/torrent: {}\n",
                self.whisper_max_tracks()
            ));
        }
        s.push_str(&format!("\n  Concurrency:          {}\n", self.concurrency));
        s.push_str(&format!("  Stall timeout:        {}s\n", self.stall_timeout));
        s.push_str(&format!("  Max timeout:          {}s\n", self.max_timeout));
        s.push_str(&format!("\n  Verbose output:       {}\n", yn(self.verbose)));
        s.push_str(&format!(
            "\n  Config file:          {}\n",
            user_config_path().display()
        ));
        s.push_str(&format!("  Configured:           {}\n", yn(self.configured)));
        s
    }
}

fn value_or_na(s: &str) -> &str {
    if s.is_empty() {
        "n/a"
    } else {
        s
    }
}

/// Base directory for truespec data (`~/.truespec`).
pub fn truespec_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".truespec"),
        None => std::env::temp_dir().join(".truespec"),
    }
}

/// Path to the user config file.
pub fn user_config_path() -> PathBuf {
    truespec_dir().join("config.json")
}

/// Default path for the persistent stats file.
pub fn default_stats_path() -> PathBuf {
    truespec_dir().join("stats.json")
}

/// Directory for whisper binaries installed by the user.
pub fn whisper_bin_dir() -> PathBuf {
    truespec_dir().join("bin")
}

/// Directory for whisper models installed by the user.
pub fn whisper_model_dir() -> PathBuf {
    truespec_dir().join("models")
}

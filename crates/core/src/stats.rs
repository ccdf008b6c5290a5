//! Persistent scan statistics.
//!
//! Append-only counters accumulated across runs: traffic, success/failure
//! breakdowns, quality distributions and hourly/daily activity buckets.
//! Counter updates are commutative, so recording order never matters.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scan::{ScanResult, ScanStatus};

const HOURLY_RETENTION_HOURS: i64 = 48;
const DAILY_RETENTION_DAYS: i64 = 30;

/// Errors from stats persistence.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats parse error: {0}")]
    ParseError(String),

    #[error("stats io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulated statistics across all scan sessions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub version: String,
    pub started_at: String,
    pub last_updated_at: String,

    // Traffic
    pub download_bytes: u64,
    pub upload_bytes: u64,

    // Torrents scanned
    pub total_scanned: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub failures_by_type: BTreeMap<String, u64>,

    // Performance
    pub total_elapsed_ms: u64,
    pub avg_elapsed_ms: u64,
    pub avg_bytes_per_torrent: u64,

    // Quality distribution
    pub resolution_dist: BTreeMap<String, u64>,
    pub codec_dist: BTreeMap<String, u64>,
    pub hdr_dist: BTreeMap<String, u64>,
    pub audio_codec_dist: BTreeMap<String, u64>,
    pub language_dist: BTreeMap<String, u64>,

    // Temporal
    pub hourly_stats: Vec<HourlyBucket>,
    pub daily_stats: Vec<DailyBucket>,

    pub total_sessions: u64,
}

/// Stats for a single hour, keyed "2026-02-14T19".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HourlyBucket {
    pub hour: String,
    pub scanned: u64,
    pub success: u64,
    pub failed: u64,
    pub download_bytes: u64,
}

/// Stats for a single day, keyed "2026-02-14".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyBucket {
    pub day: String,
    pub scanned: u64,
    pub success: u64,
    pub failed: u64,
    pub download_bytes: u64,
}

impl Stats {
    /// Loads stats from disk; a missing file yields empty stats.
    pub fn load(path: &Path) -> Result<Stats, StatsError> {
        match std::fs::read(path) {
            Ok(data) => {
                serde_json::from_slice(&data).map_err(|e| StatsError::ParseError(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Stats::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes stats to disk atomically (temp file + rename).
    pub fn save(&mut self, path: &Path) -> Result<(), StatsError> {
        self.last_updated_at = Utc::now().to_rfc3339();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| StatsError::ParseError(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })?;

        Ok(())
    }

    /// Folds one scan result into the counters.
    pub fn record_result(&mut self, result: &ScanResult, downloaded_bytes: u64) {
        let now = Utc::now();
        self.record_result_at(result, downloaded_bytes, now);
    }

    fn record_result_at(&mut self, result: &ScanResult, downloaded_bytes: u64, now: DateTime<Utc>) {
        if self.started_at.is_empty() {
            self.started_at = now.to_rfc3339();
        }

        self.total_scanned += 1;
        self.total_elapsed_ms += result.elapsed_ms;
        self.download_bytes += downloaded_bytes;

        let success = result.status == ScanStatus::Success;
        if success {
            self.total_success += 1;
            self.record_quality(result);
        } else {
            self.total_failed += 1;
            *self
                .failures_by_type
                .entry(result.status.as_str().to_string())
                .or_default() += 1;
        }

        let hour_key = now.format("%Y-%m-%dT%H").to_string();
        let day_key = now.format("%Y-%m-%d").to_string();

        let hourly = bucket_mut(&mut self.hourly_stats, |b| &b.hour, &hour_key, || {
            HourlyBucket {
                hour: hour_key.clone(),
                ..Default::default()
            }
        });
        hourly.scanned += 1;
        hourly.download_bytes += downloaded_bytes;
        if success {
            hourly.success += 1;
        } else {
            hourly.failed += 1;
        }

        let daily = bucket_mut(&mut self.daily_stats, |b| &b.day, &day_key, || DailyBucket {
            day: day_key.clone(),
            ..Default::default()
        });
        daily.scanned += 1;
        daily.download_bytes += downloaded_bytes;
        if success {
            daily.success += 1;
        } else {
            daily.failed += 1;
        }
    }

    /// Adds raw traffic not already counted by `record_result`.
    pub fn record_traffic(&mut self, downloaded: u64, uploaded: u64) {
        self.download_bytes += downloaded;
        self.upload_bytes += uploaded;
    }

    /// Counts a new scan session.
    pub fn record_session(&mut self) {
        self.total_sessions += 1;
        if self.started_at.is_empty() {
            self.started_at = Utc::now().to_rfc3339();
        }
    }

    /// Drops hourly buckets older than 48 h and daily older than 30 days.
    pub fn prune_old_buckets(&mut self) {
        let now = Utc::now();
        let hour_cutoff = (now - ChronoDuration::hours(HOURLY_RETENTION_HOURS))
            .format("%Y-%m-%dT%H")
            .to_string();
        let day_cutoff = (now - ChronoDuration::days(DAILY_RETENTION_DAYS))
            .format("%Y-%m-%d")
            .to_string();

        self.hourly_stats.retain(|b| b.hour >= hour_cutoff);
        self.daily_stats.retain(|b| b.day >= day_cutoff);
    }

    /// Recomputes derived averages.
    pub fn compute(&mut self) {
        if self.total_scanned > 0 {
            self.avg_elapsed_ms = self.total_elapsed_ms / self.total_scanned;
            self.avg_bytes_per_torrent = self.download_bytes / self.total_scanned;
        }
    }

    fn record_quality(&mut self, result: &ScanResult) {
        if let Some(video) = &result.video {
            let res = resolution_category(video.width, video.height);
            *self.resolution_dist.entry(res.to_string()).or_default() += 1;

            let codec = video.codec.to_lowercase();
            if !codec.is_empty() {
                *self.codec_dist.entry(codec).or_default() += 1;
            }

            let hdr = if video.hdr.is_empty() {
                "SDR".to_string()
            } else {
                video.hdr.clone()
            };
            *self.hdr_dist.entry(hdr).or_default() += 1;
        }

        for track in &result.audio {
            let codec = track.codec.to_lowercase();
            if !codec.is_empty() {
                *self.audio_codec_dist.entry(codec).or_default() += 1;
            }
        }

        for lang in &result.languages {
            if !lang.is_empty() && lang != "und" {
                *self.language_dist.entry(lang.clone()).or_default() += 1;
            }
        }
    }

    /// Human-readable summary for the `stats` subcommand.
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        out.push_str("TrueSpec Stats\n\n");

        out.push_str("Traffic\n");
        out.push_str(&format!(
            "  Downloaded:    {}\n",
            humanize_bytes(self.download_bytes)
        ));
        out.push_str(&format!(
            "  Uploaded:      {}\n\n",
            humanize_bytes(self.upload_bytes)
        ));

        out.push_str("Scans\n");
        out.push_str(&format!("  Total:         {}\n", self.total_scanned));
        if self.total_scanned > 0 {
            let success_pct = self.total_success as f64 / self.total_scanned as f64 * 100.0;
            let fail_pct = self.total_failed as f64 / self.total_scanned as f64 * 100.0;
            out.push_str(&format!(
                "  Success:       {} ({success_pct:.1}%)\n",
                self.total_success
            ));
            out.push_str(&format!(
                "  Failed:        {} ({fail_pct:.1}%)\n",
                self.total_failed
            ));

            let mut failures: Vec<(&String, &u64)> = self.failures_by_type.iter().collect();
            failures.sort_by(|a, b| b.1.cmp(a.1));
            for (status, count) in failures {
                out.push_str(&format!("    {:<20} {count}\n", format!("{status}:")));
            }
        }
        out.push('\n');

        out.push_str("Performance\n");
        if self.total_scanned > 0 {
            out.push_str(&format!(
                "  Avg time/torrent:  {:.1}s\n",
                self.avg_elapsed_ms as f64 / 1000.0
            ));
            out.push_str(&format!(
                "  Avg bytes/torrent: {}\n",
                humanize_bytes(self.avg_bytes_per_torrent)
            ));
        }
        out.push_str(&format!("  Sessions:          {}\n\n", self.total_sessions));

        if self.total_success > 0 {
            out.push_str("Quality Distribution\n");
            out.push_str(&format!(
                "  Resolution:  {}\n",
                format_distribution(&self.resolution_dist, usize::MAX)
            ));
            out.push_str(&format!(
                "  Codec:       {}\n",
                format_distribution(&self.codec_dist, usize::MAX)
            ));
            out.push_str(&format!(
                "  HDR:         {}\n",
                format_distribution(&self.hdr_dist, usize::MAX)
            ));
            out.push_str(&format!(
                "  Top langs:   {}\n\n",
                format_distribution(&self.language_dist, 5)
            ));
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        if let Some(day) = self.daily_stats.iter().find(|d| d.day == today) {
            out.push_str(&format!("Today ({today})\n"));
            out.push_str(&format!(
                "  Scanned: {}  |  Success: {}  |  Downloaded: {}\n\n",
                day.scanned,
                day.success,
                humanize_bytes(day.download_bytes)
            ));
        }

        if !self.started_at.is_empty() {
            out.push_str(&format!("Running since: {}\n", self.started_at));
        }
        if !self.last_updated_at.is_empty() {
            out.push_str(&format!("Last updated: {}\n", self.last_updated_at));
        }

        out
    }
}

fn bucket_mut<'a, B, K: Fn(&B) -> &String>(
    buckets: &'a mut Vec<B>,
    key_of: K,
    key: &str,
    make: impl FnOnce() -> B,
) -> &'a mut B {
    // Scans from the tail: the bucket for "now" is almost always last.
    let idx = buckets
        .iter()
        .rposition(|b| key_of(b) == key)
        .unwrap_or_else(|| {
            buckets.push(make());
            buckets.len() - 1
        });
    &mut buckets[idx]
}

/// Maps frame dimensions to a coarse resolution class.
fn resolution_category(width: u32, height: u32) -> &'static str {
    // Height drives the class; portrait video is judged by its short side.
    let h = if width > height { height } else { width };
    match h {
        h if h >= 2160 => "2160p",
        h if h >= 1080 => "1080p",
        h if h >= 720 => "720p",
        h if h >= 480 => "480p",
        h if h > 0 => "other",
        _ => "unknown",
    }
}

/// Formats bytes into a human-readable string.
pub fn humanize_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    match bytes {
        b if b >= TB => format!("{:.2} TB", b as f64 / TB as f64),
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

fn format_distribution(dist: &BTreeMap<String, u64>, top: usize) -> String {
    if dist.is_empty() {
        return "no data".to_string();
    }

    let mut sorted: Vec<(&String, &u64)> = dist.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1));
    let sum: u64 = sorted.iter().map(|(_, v)| **v).sum();
    sorted.truncate(top);

    sorted
        .into_iter()
        .map(|(k, v)| format!("{k}: {:.0}%", *v as f64 / sum as f64 * 100.0))
        .collect::<Vec<_>>()
        .join(" | ")
}

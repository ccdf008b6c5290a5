//! Types for scan results and reports.

use serde::{Deserialize, Serialize};

/// Terminal status of a single torrent scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Probe succeeded with at least one audio track.
    Success,
    /// Torrent metadata never arrived.
    StallMetadata,
    /// Both the piece clock and the byte clock exceeded the stall timeout.
    StallDownload,
    /// Absolute per-torrent timeout exceeded.
    Timeout,
    /// No video file in the torrent.
    NoVideo,
    /// All probe retries exhausted.
    FfprobeFailed,
    /// Pieces completed but the file could not be located on disk.
    FileNotFound,
    /// Worker child was killed by a signal.
    WorkerCrashed,
    /// Worker child exited nonzero or produced undecodable output.
    WorkerError,
    /// Parent could not communicate with the worker child.
    WorkerFailed,
    /// Scan was cancelled by parent shutdown.
    Cancelled,
    /// Residual failure.
    Error,
}

impl ScanStatus {
    /// Returns the string representation used in reports and stats keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Success => "success",
            ScanStatus::StallMetadata => "stall_metadata",
            ScanStatus::StallDownload => "stall_download",
            ScanStatus::Timeout => "timeout",
            ScanStatus::NoVideo => "no_video",
            ScanStatus::FfprobeFailed => "ffprobe_failed",
            ScanStatus::FileNotFound => "file_not_found",
            ScanStatus::WorkerCrashed => "worker_crashed",
            ScanStatus::WorkerError => "worker_error",
            ScanStatus::WorkerFailed => "worker_failed",
            ScanStatus::Cancelled => "cancelled",
            ScanStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audio stream extracted by the media probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    /// ISO 639-1 language code (`und` when unknown).
    pub lang: String,
    /// Codec name as reported by the probe.
    pub codec: String,
    /// Channel count (0 when the probe omits it).
    #[serde(default)]
    pub channels: u32,
    /// Stream title, if tagged.
    #[serde(default)]
    pub title: String,
    /// Whether the stream carries the default disposition.
    #[serde(default)]
    pub default: bool,
}

/// A single subtitle stream extracted by the media probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// ISO 639-1 language code (`und` when unknown).
    pub lang: String,
    /// Codec name as reported by the probe.
    pub codec: String,
    /// Stream title, if tagged.
    #[serde(default)]
    pub title: String,
    /// Forced-subtitle disposition.
    #[serde(default)]
    pub forced: bool,
    /// Default disposition.
    #[serde(default)]
    pub default: bool,
}

/// Primary video stream metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Bit depth derived from `bits_per_raw_sample` or pixel-format hints; 0 when unknown.
    #[serde(rename = "bitDepth")]
    pub bit_depth: u32,
    /// One of "", "HDR10", "HLG", "DV", "DV+HDR10", "DV+HLG".
    pub hdr: String,
    /// Frames per second, rounded to three decimals (e.g. 23.976).
    #[serde(rename = "frameRate")]
    pub frame_rate: f64,
    /// Codec profile (e.g. "Main 10", "High").
    pub profile: String,
    /// Duration in seconds, when the probe reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// A single file within a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub ext: String,
    /// Why the file was flagged as suspicious, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Complete file listing of a torrent with threat classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentFiles {
    pub total: usize,
    pub total_size: u64,
    pub video_files: Vec<FileInfo>,
    pub audio_files: Vec<FileInfo>,
    pub sub_files: Vec<FileInfo>,
    pub image_files: Vec<FileInfo>,
    pub other_files: Vec<FileInfo>,
    pub suspicious: Vec<FileInfo>,
    /// "clean", "warning" or "dangerous".
    pub threat_level: String,
}

/// Swarm health snapshot captured while the torrent was active.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmInfo {
    pub active_peers: u32,
    pub total_peers: u32,
    /// Connected peers holding every piece.
    pub seeds: u32,
    /// Cumulative payload bytes read from the swarm at snapshot time.
    pub download_bytes_total: u64,
    /// Cumulative payload bytes written to the swarm at snapshot time.
    pub upload_bytes_total: u64,
}

/// Outcome of a single torrent scan.
///
/// Slice fields always serialize as `[]`, never null; the optional
/// enrichment blocks (`video`, `files`, `swarm`) are omitted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub info_hash: String,
    pub status: ScanStatus,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub audio: Vec<AudioTrack>,
    #[serde(default)]
    pub subtitles: Vec<SubtitleTrack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoInfo>,
    /// Normalized ISO 639-1 codes, sorted and deduplicated, `und` excluded.
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<TorrentFiles>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<SwarmInfo>,
}

impl ScanResult {
    /// Builds a bare failure result carrying only status and message.
    pub fn failure(info_hash: impl Into<String>, status: ScanStatus, error: impl Into<String>) -> Self {
        ScanResult {
            info_hash: info_hash.into(),
            status,
            file: String::new(),
            audio: Vec::new(),
            subtitles: Vec::new(),
            video: None,
            languages: Vec::new(),
            elapsed_ms: 0,
            error: error.into(),
            files: None,
            swarm: None,
        }
    }
}

/// Top-level report written to the results JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub version: String,
    /// RFC 3339 UTC timestamp of the run.
    pub scanned_at: String,
    pub elapsed_ms: u64,
    pub total: usize,
    /// Per-status result counts.
    pub stats: std::collections::BTreeMap<String, usize>,
    pub results: Vec<ScanResult>,
}

/// Shortens an info hash to its 8-character prefix for log lines.
pub fn trunc_hash(hash: &str) -> &str {
    if hash.len() > 8 {
        &hash[..8]
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_as_str_matches_serde() {
        for status in [
            ScanStatus::Success,
            ScanStatus::StallMetadata,
            ScanStatus::StallDownload,
            ScanStatus::Timeout,
            ScanStatus::NoVideo,
            ScanStatus::FfprobeFailed,
            ScanStatus::FileNotFound,
            ScanStatus::WorkerCrashed,
            ScanStatus::WorkerError,
            ScanStatus::WorkerFailed,
            ScanStatus::Cancelled,
            ScanStatus::Error,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_result_slices_serialize_as_empty_arrays() {
        let result = ScanResult::failure("a".repeat(40), ScanStatus::Timeout, "max timeout");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"audio\":[]"));
        assert!(json.contains("\"subtitles\":[]"));
        assert!(json.contains("\"languages\":[]"));
        // Optional enrichment blocks are omitted, not null.
        assert!(!json.contains("\"video\""));
        assert!(!json.contains("\"files\""));
        assert!(!json.contains("\"swarm\""));
    }

    #[test]
    fn test_result_roundtrip() {
        let result = ScanResult {
            info_hash: "b".repeat(40),
            status: ScanStatus::Success,
            file: "Movie.mkv".to_string(),
            audio: vec![AudioTrack {
                lang: "en".to_string(),
                codec: "eac3".to_string(),
                channels: 6,
                title: String::new(),
                default: true,
            }],
            subtitles: vec![SubtitleTrack {
                lang: "es".to_string(),
                codec: "subrip".to_string(),
                title: "Forced".to_string(),
                forced: true,
                default: false,
            }],
            video: Some(VideoInfo {
                codec: "hevc".to_string(),
                width: 3840,
                height: 2160,
                bit_depth: 10,
                hdr: "HDR10".to_string(),
                frame_rate: 23.976,
                profile: "Main 10".to_string(),
                duration: Some(7200.5),
            }),
            languages: vec!["en".to_string()],
            elapsed_ms: 12345,
            error: String::new(),
            files: None,
            swarm: Some(SwarmInfo {
                active_peers: 4,
                total_peers: 12,
                seeds: 3,
                download_bytes_total: 10 << 20,
                upload_bytes_total: 0,
            }),
        };

        let json = serde_json::to_string(&result).unwrap();
        let parsed: ScanResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
    }

    #[test]
    fn test_video_info_field_names() {
        let video = VideoInfo {
            codec: "av1".to_string(),
            width: 1920,
            height: 1080,
            bit_depth: 10,
            hdr: String::new(),
            frame_rate: 25.0,
            profile: "Main".to_string(),
            duration: None,
        };
        let json = serde_json::to_string(&video).unwrap();
        assert!(json.contains("\"bitDepth\":10"));
        assert!(json.contains("\"frameRate\":25"));
        assert!(!json.contains("\"duration\""));
    }

    #[test]
    fn test_trunc_hash() {
        assert_eq!(trunc_hash("0123456789abcdef"), "01234567");
        assert_eq!(trunc_hash("short"), "short");
    }
}

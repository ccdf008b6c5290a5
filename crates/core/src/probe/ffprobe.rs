//! ffprobe invocation and stream classification.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::lang::normalize_lang;
use crate::scan::{AudioTrack, SubtitleTrack, VideoInfo};

/// Deadline for a single probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the media probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe binary not found at {path}")]
    BinaryNotFound { path: PathBuf },

    #[error("probe input missing: {path}")]
    InputNotFound { path: PathBuf },

    #[error("probe failed (file={path}, size={size}): {stderr}")]
    ProbeFailed {
        path: PathBuf,
        size: u64,
        stderr: String,
    },

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe output parse failed: {0}")]
    ParseError(String),

    #[error("probe returned no streams")]
    NoStreams,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Classified streams from one probe run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeReport {
    pub audio: Vec<AudioTrack>,
    pub subtitles: Vec<SubtitleTrack>,
    pub video: Option<VideoInfo>,
}

/// Capability trait so scans can swap the probe for an in-memory fake.
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeReport, ProbeError>;
}

/// ffprobe-backed prober.
pub struct FfprobeProber {
    binary: PathBuf,
}

impl FfprobeProber {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Parses `ffprobe -print_format json -show_streams` output.
    fn parse_output(output: &str) -> Result<ProbeReport, ProbeError> {
        let probe: ProbeOutput =
            serde_json::from_str(output).map_err(|e| ProbeError::ParseError(e.to_string()))?;

        if probe.streams.is_empty() {
            return Err(ProbeError::NoStreams);
        }

        let mut report = ProbeReport::default();

        for stream in &probe.streams {
            match stream.codec_type.as_str() {
                "audio" => report.audio.push(AudioTrack {
                    lang: normalize_lang(&stream.tag("language")),
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    channels: stream.channels.unwrap_or(0),
                    title: stream.tag("title"),
                    default: stream.disposition("default"),
                }),
                "subtitle" => report.subtitles.push(SubtitleTrack {
                    lang: normalize_lang(&stream.tag("language")),
                    codec: stream.codec_name.clone().unwrap_or_default(),
                    title: stream.tag("title"),
                    forced: stream.disposition("forced"),
                    default: stream.disposition("default"),
                }),
                "video" => {
                    // Only the first video stream is retained.
                    if report.video.is_none() {
                        report.video = Some(stream.to_video_info());
                    }
                }
                _ => {}
            }
        }

        Ok(report)
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeReport, ProbeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_streams"])
            .arg(path);

        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout(PROBE_TIMEOUT))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProbeError::BinaryNotFound {
                        path: self.binary.clone(),
                    }
                } else {
                    ProbeError::Io(e)
                }
            })?;

        if !output.status.success() {
            // Distinguish "file vanished" from "probe rejected the data".
            let size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(_) => {
                    return Err(ProbeError::InputNotFound {
                        path: path.to_path_buf(),
                    });
                }
            };
            return Err(ProbeError::ProbeFailed {
                path: path.to_path_buf(),
                size,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Finds the ffprobe binary. Search order: explicit path, `FFPROBE_PATH`,
/// `ffprobe` on `PATH`, adjacent to the current executable.
pub fn resolve_ffprobe(explicit: Option<&Path>) -> Result<PathBuf, ProbeError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(ProbeError::BinaryNotFound {
            path: path.to_path_buf(),
        });
    }

    if let Some(env_path) = std::env::var_os("FFPROBE_PATH") {
        let path = PathBuf::from(env_path);
        if path.is_file() {
            return Ok(path);
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("ffprobe");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let adjacent = dir.join("ffprobe");
            if adjacent.is_file() {
                return Ok(adjacent);
            }
        }
    }

    Err(ProbeError::BinaryNotFound {
        path: PathBuf::from("ffprobe"),
    })
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize, Default)]
struct ProbeStream {
    #[serde(default)]
    codec_type: String,
    codec_name: Option<String>,
    profile: Option<String>,
    channels: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    bits_per_raw_sample: Option<String>,
    pix_fmt: Option<String>,
    color_space: Option<String>,
    color_transfer: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
    #[serde(default)]
    disposition: std::collections::HashMap<String, i64>,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Deserialize, Default)]
struct SideData {
    #[serde(default)]
    side_data_type: String,
}

impl ProbeStream {
    /// Tag lookup is case-insensitive: ffprobe emits both `language` and
    /// `LANGUAGE` depending on the container.
    fn tag(&self, key: &str) -> String {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    fn disposition(&self, key: &str) -> bool {
        self.disposition.get(key).copied().unwrap_or(0) == 1
    }

    fn to_video_info(&self) -> VideoInfo {
        let bit_depth = self.bit_depth();
        let hdr = self.hdr_mode();
        let frame_rate = self.frame_rate();
        let duration = self
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0);

        VideoInfo {
            codec: self.codec_name.clone().unwrap_or_default(),
            width: self.width.unwrap_or(0),
            height: self.height.unwrap_or(0),
            bit_depth,
            hdr,
            frame_rate,
            profile: self.profile.clone().unwrap_or_default(),
            duration,
        }
    }

    fn bit_depth(&self) -> u32 {
        if let Some(raw) = self.bits_per_raw_sample.as_deref() {
            if let Ok(depth) = raw.parse::<u32>() {
                return depth;
            }
        }
        let pix_fmt = self.pix_fmt.as_deref().unwrap_or("");
        if ["10le", "10be", "p010"].iter().any(|h| pix_fmt.contains(h)) {
            10
        } else if ["12le", "12be"].iter().any(|h| pix_fmt.contains(h)) {
            12
        } else {
            0
        }
    }

    fn hdr_mode(&self) -> String {
        let space = self.color_space.as_deref().unwrap_or("");
        let transfer = self.color_transfer.as_deref().unwrap_or("");

        let mut hdr = match (space, transfer) {
            ("bt2020nc", "smpte2084") => "HDR10",
            ("bt2020nc", "arib-std-b67") => "HLG",
            (_, "smpte2084") => "HDR10",
            (_, "arib-std-b67") => "HLG",
            _ => "",
        }
        .to_string();

        let has_dovi = self
            .side_data_list
            .iter()
            .any(|sd| sd.side_data_type == "DOVI configuration record");
        if has_dovi {
            hdr = if hdr.is_empty() {
                "DV".to_string()
            } else {
                format!("DV+{hdr}")
            };
        }

        hdr
    }

    /// `r_frame_rate` is a rational like "24000/1001"; rounded to three
    /// decimals.
    fn frame_rate(&self) -> f64 {
        let Some(raw) = self.r_frame_rate.as_deref() else {
            return 0.0;
        };
        let Some((num, den)) = raw.split_once('/') else {
            return 0.0;
        };
        match (num.parse::<f64>(), den.parse::<f64>()) {
            (Ok(num), Ok(den)) if den > 0.0 => (num / den * 1000.0).round() / 1000.0,
            _ => 0.0,
        }
    }
}

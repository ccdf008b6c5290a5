//! Spoken-language detection for untagged audio tracks.
//!
//! When every audio track of a successful scan reports an unknown language,
//! a short clip is extracted with ffmpeg and fed to whisper-cli in
//! detect-language mode. Detection is pure enrichment: failures are logged
//! and skipped, never altering the primary scan status.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::UserConfig;
use crate::config::user::{whisper_bin_dir, whisper_model_dir};
use crate::lang::{is_unknown_lang, normalize_lang};
use crate::scan::{trunc_hash, ScanResult, ScanStatus};

const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);
const WHISPER_TIMEOUT: Duration = Duration::from_secs(30);
const CLIP_SECONDS: &str = "30";

/// Errors from a single detection attempt.
#[derive(Debug, Error)]
pub enum LangDetectError {
    #[error("audio extract failed: {0}")]
    ExtractFailed(String),

    #[error("extracted audio too small or missing")]
    ClipTooSmall,

    #[error("whisper detect-language failed: {0}")]
    WhisperFailed(String),

    #[error("whisper output unreadable: {0}")]
    OutputUnreadable(String),

    #[error("detection timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One detection outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct LangDetection {
    /// ISO 639-1 code reported by the model.
    pub language: String,
    /// 0.0 - 1.0, parsed from the model's stderr when available.
    pub confidence: f64,
    pub elapsed_ms: u64,
}

/// Capability trait so scans can swap the detector for an in-memory fake.
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    /// Detects the spoken language of one audio stream of `video`.
    async fn detect(
        &self,
        video: &Path,
        audio_track_index: usize,
    ) -> Result<LangDetection, LangDetectError>;

    /// Cap on how many tracks to analyze per torrent.
    fn max_tracks(&self) -> usize;
}

/// whisper.cpp-backed detector.
#[derive(Debug, Clone, PartialEq)]
pub struct WhisperDetector {
    pub whisper_path: PathBuf,
    pub model_path: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub max_tracks: usize,
}

/// `auto-detected language: en (p = 0.409680)` on whisper's stderr.
static CONFIDENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"auto-detected language:\s*(\S+)\s*\(p\s*=\s*([0-9.]+)\)").unwrap()
});

#[derive(Deserialize)]
struct WhisperJson {
    result: WhisperJsonResult,
}

#[derive(Deserialize)]
struct WhisperJsonResult {
    #[serde(default)]
    language: String,
}

#[async_trait]
impl LanguageDetector for WhisperDetector {
    async fn detect(
        &self,
        video: &Path,
        audio_track_index: usize,
    ) -> Result<LangDetection, LangDetectError> {
        let started = Instant::now();

        let workdir = tempfile::Builder::new()
            .prefix("truespec-lang-")
            .tempdir()?;
        let wav_path = workdir.path().join("clip.wav");

        // 30 seconds of the selected stream, mono 16 kHz (whisper's input
        // format).
        let mut extract_cmd = Command::new(&self.ffmpeg_path);
        extract_cmd
            .arg("-i")
            .arg(video)
            .args(["-t", CLIP_SECONDS])
            .args(["-map", &format!("0:a:{audio_track_index}")])
            .args(["-ar", "16000"])
            .args(["-ac", "1"])
            .args(["-f", "wav", "-y"])
            .arg(&wav_path);
        let extract = tokio::time::timeout(EXTRACT_TIMEOUT, extract_cmd.output())
            .await
            .map_err(|_| LangDetectError::Timeout(EXTRACT_TIMEOUT))??;
        if !extract.status.success() {
            return Err(LangDetectError::ExtractFailed(
                String::from_utf8_lossy(&extract.stderr).trim().to_string(),
            ));
        }

        match tokio::fs::metadata(&wav_path).await {
            Ok(meta) if meta.len() >= 1000 => {}
            _ => return Err(LangDetectError::ClipTooSmall),
        }

        let json_out = workdir.path().join("detect");
        let mut whisper_cmd = Command::new(&self.whisper_path);
        whisper_cmd
            .arg("--model")
            .arg(&self.model_path)
            .args(["--detect-language", "--output-json", "--no-prints"])
            .arg("-of")
            .arg(&json_out)
            .arg("-f")
            .arg(&wav_path);
        let whisper = tokio::time::timeout(WHISPER_TIMEOUT, whisper_cmd.output())
            .await
            .map_err(|_| LangDetectError::Timeout(WHISPER_TIMEOUT))??;
        let stderr = String::from_utf8_lossy(&whisper.stderr).into_owned();
        if !whisper.status.success() {
            return Err(LangDetectError::WhisperFailed(stderr.trim().to_string()));
        }

        let json_path = json_out.with_extension("json");
        let data = tokio::fs::read(&json_path)
            .await
            .map_err(|e| LangDetectError::OutputUnreadable(e.to_string()))?;
        let parsed: WhisperJson = serde_json::from_slice(&data)
            .map_err(|e| LangDetectError::OutputUnreadable(e.to_string()))?;
        if parsed.result.language.is_empty() {
            return Err(LangDetectError::OutputUnreadable(
                "empty language in whisper output".to_string(),
            ));
        }

        let confidence = CONFIDENCE_RE
            .captures(&stderr)
            .and_then(|caps| caps.get(2))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(LangDetection {
            language: parsed.result.language,
            confidence,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn max_tracks(&self) -> usize {
        self.max_tracks
    }
}

/// Resolves the whisper toolchain once per process.
///
/// Search order for the binary: user config path, `WHISPER_PATH`,
/// `~/.truespec/bin/whisper-cli`, `~/local/bin/whisper-cli`, then `PATH`.
/// The model comes from the user config, `WHISPER_MODEL`,
/// `~/.truespec/models/ggml-tiny.bin`, `~/local/whisper-models/ggml-tiny.bin`
/// or `~/.cache/whisper/ggml-tiny.bin`; ffmpeg from `FFMPEG_PATH` or `PATH`.
/// Returns `None` when any part is missing or detection is disabled.
pub fn resolve_detector() -> Option<&'static WhisperDetector> {
    static RESOLVED: Lazy<Option<WhisperDetector>> = Lazy::new(resolve_detector_inner);
    RESOLVED.as_ref()
}

fn resolve_detector_inner() -> Option<WhisperDetector> {
    let user = UserConfig::load();
    if user.configured && !user.whisper_enabled {
        return None;
    }

    let home = home_dir();

    let whisper_path = find_binary(
        "whisper-cli",
        &[
            user.whisper_path.clone(),
            env_string("WHISPER_PATH"),
            whisper_bin_dir().join("whisper-cli").display().to_string(),
            home.join("local/bin/whisper-cli").display().to_string(),
        ],
    )?;

    let model_path = find_file(&[
        user.whisper_model.clone(),
        env_string("WHISPER_MODEL"),
        whisper_model_dir().join("ggml-tiny.bin").display().to_string(),
        home.join("local/whisper-models/ggml-tiny.bin")
            .display()
            .to_string(),
        home.join(".cache/whisper/ggml-tiny.bin")
            .display()
            .to_string(),
    ])?;

    let ffmpeg_path = find_binary("ffmpeg", &[env_string("FFMPEG_PATH")])?;

    debug!(
        whisper = %whisper_path.display(),
        model = %model_path.display(),
        "language detection available"
    );

    Some(WhisperDetector {
        whisper_path,
        model_path,
        ffmpeg_path,
        max_tracks: user.whisper_max_tracks(),
    })
}

fn env_string(key: &str) -> String {
    std::env::var(key).unwrap_or_default()
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

fn find_binary(name: &str, candidates: &[String]) -> Option<PathBuf> {
    for candidate in candidates {
        if !candidate.is_empty() && Path::new(candidate).is_file() {
            return Some(PathBuf::from(candidate));
        }
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}

fn find_file(candidates: &[String]) -> Option<PathBuf> {
    candidates
        .iter()
        .filter(|c| !c.is_empty())
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Whether detection should run: a successful result whose audio tracks all
/// carry unknown language tags. One known tag anywhere means the container's
/// tags are trustworthy and detection is skipped.
pub fn should_detect(result: &ScanResult) -> bool {
    result.status == ScanStatus::Success
        && !result.audio.is_empty()
        && result.audio.iter().all(|t| is_unknown_lang(&t.lang))
}

/// Runs detection over the undefined tracks of a successful result,
/// rewriting track languages and recomputing the merged language list.
pub async fn apply_lang_detection(
    detector: &dyn LanguageDetector,
    result: &mut ScanResult,
    video_path: &Path,
) {
    if !should_detect(result) {
        return;
    }

    let mut indices: Vec<usize> = result
        .audio
        .iter()
        .enumerate()
        .filter(|(_, t)| is_unknown_lang(&t.lang))
        .map(|(i, _)| i)
        .collect();

    let cap = detector.max_tracks();
    if indices.len() > cap {
        info!(
            hash = trunc_hash(&result.info_hash),
            undefined = indices.len(),
            cap,
            "capping language detection"
        );
        indices.truncate(cap);
    }

    info!(
        hash = trunc_hash(&result.info_hash),
        tracks = indices.len(),
        "attempting whisper language detection"
    );

    for index in indices {
        let detected = match detector.detect(video_path, index).await {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    hash = trunc_hash(&result.info_hash),
                    track = index,
                    "language detection failed: {e}"
                );
                continue;
            }
        };
        if detected.language.is_empty() {
            continue;
        }

        let normalized = normalize_lang(&detected.language);
        info!(
            hash = trunc_hash(&result.info_hash),
            track = index,
            lang = %normalized,
            confidence = detected.confidence,
            elapsed_ms = detected.elapsed_ms,
            "language detected"
        );

        let track = &mut result.audio[index];
        track.lang = normalized.clone();
        let note = format!(
            "[detected:{normalized}({}%)]",
            (detected.confidence * 100.0) as u32
        );
        track.title = if track.title.is_empty() {
            note
        } else {
            format!("{} {note}", track.title)
        };
    }

    result.languages = crate::lang::compute_languages(&[], &result.audio);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::AudioTrack;
    use std::sync::Mutex;

    struct FixedDetector {
        langs: Vec<&'static str>,
        calls: Mutex<usize>,
        max_tracks: usize,
    }

    #[async_trait]
    impl LanguageDetector for FixedDetector {
        async fn detect(
            &self,
            _video: &Path,
            _index: usize,
        ) -> Result<LangDetection, LangDetectError> {
            let mut calls = self.calls.lock().unwrap();
            let lang = self.langs[*calls % self.langs.len()];
            *calls += 1;
            Ok(LangDetection {
                language: lang.to_string(),
                confidence: 0.9,
                elapsed_ms: 5,
            })
        }

        fn max_tracks(&self) -> usize {
            self.max_tracks
        }
    }

    fn success_result(langs: &[&str]) -> ScanResult {
        let mut result = ScanResult::failure("f".repeat(40), ScanStatus::Success, "");
        result.audio = langs
            .iter()
            .map(|l| AudioTrack {
                lang: l.to_string(),
                codec: "aac".to_string(),
                channels: 2,
                title: String::new(),
                default: false,
            })
            .collect();
        result
    }

    #[test]
    fn test_should_detect_only_when_all_unknown() {
        assert!(should_detect(&success_result(&["und", "und"])));
        assert!(!should_detect(&success_result(&["und", "en"])));
        assert!(!should_detect(&success_result(&[])));

        let mut failed = success_result(&["und"]);
        failed.status = ScanStatus::FfprobeFailed;
        assert!(!should_detect(&failed));
    }

    #[tokio::test]
    async fn test_apply_rewrites_tracks_and_languages() {
        let detector = FixedDetector {
            langs: vec!["es", "en"],
            calls: Mutex::new(0),
            max_tracks: 3,
        };
        let mut result = success_result(&["und", "und"]);

        apply_lang_detection(&detector, &mut result, Path::new("/tmp/x.mkv")).await;

        assert_eq!(result.audio[0].lang, "es");
        assert_eq!(result.audio[1].lang, "en");
        assert!(result.audio[0].title.contains("detected:es(90%)"));
        assert_eq!(result.languages, vec!["en", "es"]);
    }

    #[tokio::test]
    async fn test_apply_respects_track_cap() {
        let detector = FixedDetector {
            langs: vec!["de"],
            calls: Mutex::new(0),
            max_tracks: 1,
        };
        let mut result = success_result(&["und", "und", "und"]);

        apply_lang_detection(&detector, &mut result, Path::new("/tmp/x.mkv")).await;

        assert_eq!(result.audio[0].lang, "de");
        assert_eq!(result.audio[1].lang, "und");
        assert_eq!(result.audio[2].lang, "und");
        assert_eq!(*detector.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_apply_skips_when_a_tag_is_known() {
        let detector = FixedDetector {
            langs: vec!["de"],
            calls: Mutex::new(0),
            max_tracks: 3,
        };
        let mut result = success_result(&["en", "und"]);

        apply_lang_detection(&detector, &mut result, Path::new("/tmp/x.mkv")).await;
        assert_eq!(*detector.calls.lock().unwrap(), 0);
        assert_eq!(result.audio[1].lang, "und");
    }

    #[test]
    fn test_confidence_regex() {
        let caps = CONFIDENCE_RE
            .captures("whisper: auto-detected language: en (p = 0.409680)")
            .unwrap();
        assert_eq!(&caps[1], "en");
        assert_eq!(&caps[2], "0.409680");
    }
}

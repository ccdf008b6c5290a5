//! Mock media prober for tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::probe::{MediaProber, ProbeError, ProbeReport};
use crate::scan::{AudioTrack, VideoInfo};

/// Scripted prober: each call consumes the next queued outcome; when the
/// script runs dry the last outcome repeats.
#[derive(Clone, Default)]
pub struct MockProber {
    script: Arc<Mutex<Vec<Result<ProbeReport, String>>>>,
    calls: Arc<Mutex<Vec<PathBuf>>>,
}

impl MockProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful probe outcome.
    pub fn push_report(&self, report: ProbeReport) {
        self.script.lock().unwrap().push(Ok(report));
    }

    /// Queues a failing probe outcome.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.script.lock().unwrap().push(Err(message.into()));
    }

    /// Paths probed so far, in call order.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }

    /// A report with one audio track per language and a plain 1080p video
    /// stream. An empty language list models a probe that parsed the
    /// container but found no audio yet.
    pub fn report_with_audio(langs: &[&str]) -> ProbeReport {
        ProbeReport {
            audio: langs
                .iter()
                .map(|l| AudioTrack {
                    // Raw probe tags come back normalized, as the real
                    // prober does at parse time.
                    lang: crate::lang::normalize_lang(l),
                    codec: "aac".to_string(),
                    channels: 2,
                    title: String::new(),
                    default: false,
                })
                .collect(),
            subtitles: Vec::new(),
            video: Some(VideoInfo {
                codec: "h264".to_string(),
                width: 1920,
                height: 1080,
                bit_depth: 8,
                hdr: String::new(),
                frame_rate: 23.976,
                profile: "High".to_string(),
                duration: None,
            }),
        }
    }
}

#[async_trait]
impl MediaProber for MockProber {
    async fn probe(&self, path: &Path) -> Result<ProbeReport, ProbeError> {
        self.calls.lock().unwrap().push(path.to_path_buf());

        let mut script = self.script.lock().unwrap();
        let outcome = if script.len() > 1 {
            script.remove(0)
        } else {
            script
                .first()
                .cloned()
                .unwrap_or_else(|| Err("no scripted outcome".to_string()))
        };

        outcome.map_err(ProbeError::ParseError)
    }
}

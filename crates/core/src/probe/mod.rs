//! Media probing: invoking the external probe binary and classifying the
//! streams it reports.

mod ffprobe;

pub use ffprobe::{resolve_ffprobe, FfprobeProber, MediaProber, ProbeError, ProbeReport};

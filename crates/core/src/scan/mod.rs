//! Scan engine: result types, the per-hash orchestrator, the worker
//! protocol and the bounded-concurrency scheduler.

mod orchestrator;
mod scheduler;
mod types;
mod worker;

pub use orchestrator::{classify_fetch_error, process_one, ScanLimits};
pub use scheduler::{scan, scan_stream, scan_with_stats};
pub use types::{
    trunc_hash, AudioTrack, FileInfo, ScanReport, ScanResult, ScanStatus, SubtitleTrack,
    SwarmInfo, TorrentFiles, VideoInfo,
};
pub use worker::{run_worker, spawn_isolated, WorkerInput, WorkerOutput, WORKER_SUBCOMMAND};

//! TrueSpec core: verify the real technical specs of media torrents by
//! fetching only the bytes a media probe needs.
//!
//! The engine resolves an info hash into torrent metadata, plans the minimum
//! piece set covering the probe-relevant byte ranges (head of the file, plus
//! the tail for MP4-family containers), downloads those pieces under stall
//! and timeout discipline, probes with exponentially growing byte budgets,
//! and isolates each scan in a child process so a native crash cannot poison
//! the run.

pub mod config;
pub mod fetch;
pub mod input;
pub mod lang;
pub mod langdetect;
pub mod peer;
pub mod probe;
pub mod scan;
pub mod stats;
pub mod testing;
pub mod threat;

pub use config::{load_config, ConfigError, ScanConfig, UserConfig};
pub use input::normalize_input;
pub use probe::resolve_ffprobe;
pub use scan::{
    run_worker, scan_with_stats, ScanReport, ScanResult, ScanStatus, WorkerInput, WorkerOutput,
    WORKER_SUBCOMMAND,
};
pub use stats::Stats;

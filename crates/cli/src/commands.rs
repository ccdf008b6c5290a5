//! Subcommand implementations.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use truespec_core::config::user::user_config_path;
use truespec_core::scan::{scan_with_stats, trunc_hash, ScanReport};
use truespec_core::{
    load_config, normalize_input, resolve_ffprobe, ScanConfig, Stats, UserConfig,
};

#[derive(Args)]
pub struct ScanArgs {
    /// Info hashes, magnet links, .torrent files or directories.
    pub inputs: Vec<String>,

    /// Maximum concurrent torrent downloads.
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Seconds of no progress before killing a torrent.
    #[arg(long)]
    pub stall_timeout: Option<u64>,

    /// Absolute maximum seconds per torrent.
    #[arg(long)]
    pub max_timeout: Option<u64>,

    /// Path to the ffprobe binary (auto-detect if omitted).
    #[arg(long)]
    pub ffprobe: Option<PathBuf>,

    /// Temporary directory for downloads.
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Print all logs to stderr.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output JSON file path (default: results_<timestamp>.json).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Read info hashes or magnets from a file, one per line.
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub from_file: Option<PathBuf>,

    /// Read info hashes or magnets from stdin.
    #[arg(long)]
    pub stdin: bool,

    /// Pipe mode: read hashes from stdin continuously, emit JSONL results
    /// on stdout.
    #[arg(long)]
    pub pipe: bool,

    /// Path to the stats file.
    #[arg(long)]
    pub stats_file: Option<PathBuf>,

    /// Disable stats tracking for this run.
    #[arg(long)]
    pub no_stats: bool,
}

#[derive(Args)]
pub struct StatsArgs {
    /// Output raw JSON.
    #[arg(long)]
    pub json: bool,

    /// Reset all stats.
    #[arg(long)]
    pub reset: bool,

    /// Path to the stats file.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Show the current configuration.
    #[arg(long)]
    pub show: bool,

    /// Output the current configuration as JSON.
    #[arg(long)]
    pub json: bool,

    /// Reset the configuration to defaults.
    #[arg(long)]
    pub reset: bool,

    /// Enable or disable stats tracking.
    #[arg(long, value_name = "BOOL")]
    pub set_stats: Option<bool>,

    /// Enable or disable threat classification of torrent file listings.
    #[arg(long, value_name = "BOOL")]
    pub set_threat_scan: Option<bool>,

    /// Enable or disable whisper language detection.
    #[arg(long, value_name = "BOOL")]
    pub set_whisper: Option<bool>,

    /// Path to the whisper-cli binary.
    #[arg(long, value_name = "PATH")]
    pub set_whisper_path: Option<String>,

    /// Path to the whisper ggml model file.
    #[arg(long, value_name = "PATH")]
    pub set_whisper_model: Option<String>,

    /// Max audio tracks to analyze per torrent.
    #[arg(long, value_name = "N")]
    pub set_whisper_max_tracks: Option<usize>,

    /// Default scan concurrency.
    #[arg(long, value_name = "N")]
    pub set_concurrency: Option<usize>,

    /// Default stall timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub set_stall_timeout: Option<u64>,

    /// Default max timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub set_max_timeout: Option<u64>,

    /// Default output mode: print all logs to stderr.
    #[arg(long, value_name = "BOOL")]
    pub set_verbose: Option<bool>,
}

pub async fn run_scan(args: ScanArgs) -> Result<()> {
    let mut cfg = load_config().context("load configuration")?;
    apply_scan_flags(&mut cfg, &args);
    init_logging(cfg.verbose);
    cfg.validate().context("invalid configuration")?;

    if args.pipe {
        if args.stdin || args.from_file.is_some() || !args.inputs.is_empty() {
            bail!("--pipe cannot be combined with --stdin, -f or positional inputs");
        }
        return run_pipe(cfg).await;
    }

    let hashes = collect_hashes(&args)?;
    if hashes.is_empty() {
        bail!("no info hashes provided");
    }
    for (i, hash) in hashes.iter().enumerate() {
        if hash.len() != 40 {
            warn!("hash #{} ({hash:?}) is not 40 characters", i + 1);
        }
    }

    // Fail fast on a missing probe rather than per torrent.
    let ffprobe = resolve_ffprobe(cfg.ffprobe_path.as_deref())
        .context("ffprobe not found; install ffmpeg or pass --ffprobe")?;
    cfg.ffprobe_path = Some(ffprobe.clone());

    let output_file = cfg.output_file.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "results_{}.json",
            chrono::Utc::now().format("%Y-%m-%d_%H%M%S")
        ))
    });

    info!(
        hashes = hashes.len(),
        concurrency = cfg.concurrency,
        stall_timeout_s = cfg.stall_timeout,
        max_timeout_s = cfg.max_timeout,
        ffprobe = %ffprobe.display(),
        temp_dir = %cfg.temp_dir.display(),
        output = %output_file.display(),
        "starting scan"
    );

    // Partial downloads are never resumable; leftovers from crashed runs are
    // pure waste.
    purge_scratch(&cfg.temp_dir).await;

    let stats = load_stats(&cfg);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let started = Instant::now();
    let mut rx = scan_with_stats(cfg.clone(), hashes.clone(), stats.clone(), cancel);

    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut results = Vec::with_capacity(hashes.len());
    while let Some(result) = rx.recv().await {
        *status_counts
            .entry(result.status.as_str().to_string())
            .or_default() += 1;
        info!(
            progress = format!("{}/{}", results.len() + 1, hashes.len()),
            hash = trunc_hash(&result.info_hash),
            status = %result.status,
            elapsed_ms = result.elapsed_ms,
            "result"
        );
        results.push(result);
    }

    let elapsed = started.elapsed();

    let report = ScanReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        scanned_at: chrono::Utc::now().to_rfc3339(),
        elapsed_ms: elapsed.as_millis() as u64,
        total: results.len(),
        stats: status_counts.clone(),
        results,
    };

    let file = std::fs::File::create(&output_file)
        .with_context(|| format!("create output file {}", output_file.display()))?;
    serde_json::to_writer_pretty(file, &report).context("write report JSON")?;

    purge_scratch(&cfg.temp_dir).await;
    save_stats(&cfg, stats);

    eprintln!("\nScan complete in {:.1}s", elapsed.as_secs_f64());
    eprintln!("  Total: {}", report.total);
    for (status, count) in &status_counts {
        eprintln!("  {status}: {count}");
    }
    eprintln!("  Results saved to: {}", output_file.display());
    if let Some(stats_file) = &cfg.stats_file {
        eprintln!("  Stats saved to: {}", stats_file.display());
    }

    Ok(())
}

/// Pipe mode: hashes stream in on stdin, one JSONL result per line streams
/// out on stdout as soon as each scan completes. EOF on stdin means "no more
/// hashes"; in-flight scans finish before exit.
async fn run_pipe(mut cfg: ScanConfig) -> Result<()> {
    use tokio::io::AsyncBufReadExt;

    let ffprobe = resolve_ffprobe(cfg.ffprobe_path.as_deref())
        .context("ffprobe not found; install ffmpeg or pass --ffprobe")?;
    cfg.ffprobe_path = Some(ffprobe.clone());

    info!(
        concurrency = cfg.concurrency,
        stall_timeout_s = cfg.stall_timeout,
        max_timeout_s = cfg.max_timeout,
        ffprobe = %ffprobe.display(),
        temp_dir = %cfg.temp_dir.display(),
        "pipe mode"
    );

    purge_scratch(&cfg.temp_dir).await;
    let stats = load_stats(&cfg);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (hash_tx, hash_rx) = tokio::sync::mpsc::channel(cfg.concurrency.max(1));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    },
                };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match normalize_input(line) {
                    Ok(resolved) => {
                        for hash in resolved {
                            if hash_tx.send(hash).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("pipe: skipping invalid input {line:?}: {e}"),
                }
            }
        });
    }

    let started = Instant::now();
    let mut rx = truespec_core::scan::scan_stream(cfg.clone(), hash_rx, stats.clone(), cancel);

    let mut status_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0usize;
    while let Some(result) = rx.recv().await {
        total += 1;
        *status_counts
            .entry(result.status.as_str().to_string())
            .or_default() += 1;
        println!("{}", serde_json::to_string(&result)?);
    }

    purge_scratch(&cfg.temp_dir).await;
    save_stats(&cfg, stats);

    eprintln!(
        "\nPipe session complete in {:.1}s",
        started.elapsed().as_secs_f64()
    );
    eprintln!("  Total: {total}");
    for (status, count) in &status_counts {
        eprintln!("  {status}: {count}");
    }

    Ok(())
}

pub fn run_stats(args: StatsArgs) -> Result<()> {
    let file = args.file.unwrap_or_else(|| {
        load_config()
            .ok()
            .and_then(|cfg| cfg.stats_file)
            .unwrap_or_else(truespec_core::config::user::default_stats_path)
    });

    if args.reset {
        let mut stats = Stats::default();
        stats.save(&file).context("reset stats")?;
        eprintln!("Stats reset successfully.");
        return Ok(());
    }

    let mut stats = Stats::load(&file).context("load stats")?;
    stats.compute();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", stats.format_summary());
    }
    Ok(())
}

pub fn run_config(args: ConfigArgs) -> Result<()> {
    if args.reset {
        UserConfig::default().save().context("reset config")?;
        eprintln!("Configuration reset to defaults.");
        return Ok(());
    }

    let mut cfg = UserConfig::load();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
        return Ok(());
    }
    if args.show {
        print!("{}", cfg.show());
        return Ok(());
    }

    let mut changed = false;

    if let Some(v) = args.set_stats {
        cfg.stats_enabled = v;
        changed = true;
    }
    if let Some(v) = args.set_threat_scan {
        cfg.threat_scan_enabled = v;
        changed = true;
    }
    if let Some(v) = args.set_whisper {
        cfg.whisper_enabled = v;
        changed = true;
    }
    if let Some(v) = args.set_whisper_path {
        cfg.whisper_path = v;
        changed = true;
    }
    if let Some(v) = args.set_whisper_model {
        cfg.whisper_model = v;
        changed = true;
    }
    if let Some(v) = args.set_whisper_max_tracks {
        cfg.whisper_max_tracks = v;
        changed = true;
    }
    if let Some(v) = args.set_concurrency {
        if v == 0 || v > 50 {
            bail!("concurrency must be between 1 and 50");
        }
        cfg.concurrency = v;
        changed = true;
    }
    if let Some(v) = args.set_stall_timeout {
        if v < 10 {
            bail!("stall timeout must be at least 10 seconds");
        }
        cfg.stall_timeout = v;
        changed = true;
    }
    if let Some(v) = args.set_max_timeout {
        if v < 60 {
            bail!("max timeout must be at least 60 seconds");
        }
        cfg.max_timeout = v;
        changed = true;
    }
    if let Some(v) = args.set_verbose {
        cfg.verbose = v;
        changed = true;
    }

    if changed {
        cfg.configured = true;
        cfg.save().context("save config")?;
        eprintln!("Configuration saved to {}.\n", user_config_path().display());
    }

    print!("{}", cfg.show());
    Ok(())
}

fn apply_scan_flags(cfg: &mut ScanConfig, args: &ScanArgs) {
    if let Some(v) = args.concurrency {
        cfg.concurrency = v;
    }
    if let Some(v) = args.stall_timeout {
        cfg.stall_timeout = v;
    }
    if let Some(v) = args.max_timeout {
        cfg.max_timeout = v;
    }
    if let Some(v) = &args.ffprobe {
        cfg.ffprobe_path = Some(v.clone());
    }
    if let Some(v) = &args.temp_dir {
        cfg.temp_dir = v.clone();
    }
    if let Some(v) = &args.output {
        cfg.output_file = Some(v.clone());
    }
    if let Some(v) = &args.stats_file {
        cfg.stats_file = Some(v.clone());
    }
    if args.no_stats {
        cfg.stats_file = None;
    }
    // The flag only raises verbosity; absent, the persisted default stands.
    if args.verbose {
        cfg.verbose = true;
    }
}

fn collect_hashes(args: &ScanArgs) -> Result<Vec<String>> {
    let mut hashes = Vec::new();

    for input in &args.inputs {
        let resolved = normalize_input(input)
            .with_context(|| format!("error processing {input:?}"))?;
        hashes.extend(resolved);
    }

    if let Some(path) = &args.from_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read file {}", path.display()))?;
        hashes.extend(normalize_lines(&content)?);
    }

    if args.stdin {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("read stdin")?;
        hashes.extend(normalize_lines(&content)?);
    }

    Ok(hashes)
}

fn normalize_lines(content: &str) -> Result<Vec<String>> {
    let mut hashes = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let resolved =
            normalize_input(line).with_context(|| format!("error processing line {line:?}"))?;
        hashes.extend(resolved);
    }
    Ok(hashes)
}

pub fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    // Stdout stays reserved for structured output (reports, JSON).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, finishing in-flight scans");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn load_stats(cfg: &ScanConfig) -> Option<Arc<Mutex<Stats>>> {
    let path = cfg.stats_file.as_ref()?;
    let mut stats = match Stats::load(path) {
        Ok(stats) => stats,
        Err(e) => {
            warn!("could not load stats: {e}");
            Stats::default()
        }
    };
    stats.version = env!("CARGO_PKG_VERSION").to_string();
    stats.record_session();
    Some(Arc::new(Mutex::new(stats)))
}

fn save_stats(cfg: &ScanConfig, stats: Option<Arc<Mutex<Stats>>>) {
    let (Some(path), Some(stats)) = (&cfg.stats_file, stats) else {
        return;
    };
    let mut stats = stats.lock().unwrap();
    stats.prune_old_buckets();
    stats.compute();
    if let Err(e) = stats.save(path) {
        warn!("could not save stats: {e}");
    }
}

async fn purge_scratch(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), "failed to clean temp dir: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lines_skips_comments_and_blanks() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        let content = format!("# header\n\n{hash}\n  \n");
        let hashes = normalize_lines(&content).unwrap();
        assert_eq!(hashes, vec![hash.to_string()]);
    }

    #[test]
    fn test_normalize_lines_propagates_errors() {
        assert!(normalize_lines("definitely-not-a-hash").is_err());
    }

    #[test]
    fn test_apply_scan_flags_override() {
        let mut cfg = ScanConfig::default();
        let args = ScanArgs {
            inputs: vec![],
            concurrency: Some(9),
            stall_timeout: Some(30),
            max_timeout: Some(120),
            ffprobe: Some(PathBuf::from("/opt/ffprobe")),
            temp_dir: Some(PathBuf::from("/scratch")),
            verbose: true,
            output: Some(PathBuf::from("out.json")),
            from_file: None,
            stdin: false,
            pipe: false,
            stats_file: None,
            no_stats: true,
        };

        apply_scan_flags(&mut cfg, &args);
        assert_eq!(cfg.concurrency, 9);
        assert_eq!(cfg.stall_timeout, 30);
        assert_eq!(cfg.max_timeout, 120);
        assert_eq!(cfg.ffprobe_path, Some(PathBuf::from("/opt/ffprobe")));
        assert_eq!(cfg.temp_dir, PathBuf::from("/scratch"));
        assert!(cfg.stats_file.is_none());
        assert!(cfg.verbose);
    }

    #[test]
    fn test_absent_verbose_flag_keeps_persisted_default() {
        let mut cfg = ScanConfig {
            verbose: true,
            ..Default::default()
        };
        let args = ScanArgs {
            inputs: vec![],
            concurrency: None,
            stall_timeout: None,
            max_timeout: None,
            ffprobe: None,
            temp_dir: None,
            verbose: false,
            output: None,
            from_file: None,
            stdin: false,
            pipe: false,
            stats_file: None,
            no_stats: false,
        };

        apply_scan_flags(&mut cfg, &args);
        assert!(cfg.verbose);
    }
}

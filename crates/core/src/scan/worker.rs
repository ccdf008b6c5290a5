//! Worker protocol: one child process per scan.
//!
//! The parent spawns `<self> _worker`, writes one JSON request to the
//! child's stdin and reads one JSON response from its stdout. The child's
//! stderr is re-emitted line by line under a `[worker:<hash8>]` prefix.
//! Whatever happens inside the child (native crash in the torrent stack, a
//! panic, a killed process), the parent synthesizes a structured result so
//! sibling scans are never lost.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::langdetect::{resolve_detector, LanguageDetector};
use crate::peer::{PeerClient, RqbitClient};
use crate::probe::FfprobeProber;

use super::orchestrator::{process_one, ScanLimits};
use super::types::{trunc_hash, ScanResult, ScanStatus};

/// Hidden subcommand the parent invokes on its own executable.
pub const WORKER_SUBCOMMAND: &str = "_worker";

const STDOUT_PREVIEW_LIMIT: usize = 200;

/// Request sent to a worker child over stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub info_hash: String,
    /// Position in the run, for log lines.
    pub index: usize,
    pub total: usize,
    pub ffprobe_path: String,
    pub temp_dir: PathBuf,
    pub stall_timeout_s: u64,
    pub max_timeout_s: u64,
    /// Absolute deadline for the whole worker.
    pub timeout_seconds: u64,
    pub min_bytes_mkv: u64,
    pub min_bytes_mp4: u64,
    pub max_retries: u32,
}

impl WorkerInput {
    /// Builds the request for one hash from the runtime configuration.
    pub fn for_hash(cfg: &ScanConfig, info_hash: &str, index: usize, total: usize) -> WorkerInput {
        WorkerInput {
            info_hash: info_hash.to_string(),
            index,
            total,
            ffprobe_path: cfg
                .ffprobe_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "ffprobe".to_string()),
            temp_dir: cfg.temp_dir.clone(),
            stall_timeout_s: cfg.stall_timeout,
            max_timeout_s: cfg.max_timeout,
            timeout_seconds: cfg.max_timeout,
            min_bytes_mkv: cfg.min_bytes_mkv,
            min_bytes_mp4: cfg.min_bytes_mp4,
            max_retries: cfg.max_probe_retries,
        }
    }
}

/// Response written by a worker child to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub result: ScanResult,
    pub downloaded: u64,
    pub uploaded: u64,
}

impl WorkerOutput {
    fn bare(result: ScanResult) -> WorkerOutput {
        WorkerOutput {
            result,
            downloaded: 0,
            uploaded: 0,
        }
    }
}

/// Runs one scan inside the worker child.
///
/// Creates the per-worker scratch subdirectory, owns a fresh peer session,
/// and removes the subdirectory on the way out regardless of outcome.
pub async fn run_worker(input: WorkerInput) -> WorkerOutput {
    let started = Instant::now();
    let subdir = input
        .temp_dir
        .join(format!("worker-{}", trunc_hash(&input.info_hash)));

    if let Err(e) = tokio::fs::create_dir_all(&subdir).await {
        return WorkerOutput::bare(ScanResult::failure(
            &input.info_hash,
            ScanStatus::Error,
            format!("create worker dir: {e}"),
        ));
    }

    info!(
        hash = trunc_hash(&input.info_hash),
        index = input.index,
        total = input.total,
        "worker starting"
    );

    let output = run_worker_inner(&input, &subdir, started).await;

    if let Err(e) = tokio::fs::remove_dir_all(&subdir).await {
        debug!(dir = %subdir.display(), "scratch cleanup: {e}");
    }

    info!(
        hash = trunc_hash(&input.info_hash),
        status = %output.result.status,
        downloaded = output.downloaded,
        uploaded = output.uploaded,
        "worker done"
    );

    output
}

async fn run_worker_inner(input: &WorkerInput, subdir: &Path, started: Instant) -> WorkerOutput {
    let client = match RqbitClient::new(subdir).await {
        Ok(client) => client,
        Err(e) => {
            let mut result = ScanResult::failure(
                &input.info_hash,
                ScanStatus::Error,
                format!("create peer session: {e}"),
            );
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return WorkerOutput::bare(result);
        }
    };

    let prober = FfprobeProber::new(&input.ffprobe_path);
    let detector = resolve_detector().map(|d| d as &dyn LanguageDetector);
    let limits = ScanLimits {
        scratch_dir: subdir.to_path_buf(),
        stall_timeout: Duration::from_secs(input.stall_timeout_s),
        max_timeout: Duration::from_secs(input.max_timeout_s),
        min_bytes_mkv: input.min_bytes_mkv,
        min_bytes_mp4: input.min_bytes_mp4,
        max_probe_retries: input.max_retries,
    };

    let cancel = CancellationToken::new();
    let scan = process_one(&client, &prober, detector, &limits, &input.info_hash, &cancel);

    let result = if input.timeout_seconds > 0 {
        match tokio::time::timeout(Duration::from_secs(input.timeout_seconds), scan).await {
            Ok(result) => result,
            Err(_) => {
                let mut result = ScanResult::failure(
                    &input.info_hash,
                    ScanStatus::Timeout,
                    format!("max timeout ({}s) exceeded", input.timeout_seconds),
                );
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                result
            }
        }
    } else {
        scan.await
    };

    // Transfer totals must be read before the torrent is dropped.
    let totals = client.transfer_totals(&input.info_hash).await;
    client.remove(&input.info_hash, true).await;

    WorkerOutput {
        result,
        downloaded: totals.downloaded,
        uploaded: totals.uploaded,
    }
}

/// Spawns the isolated worker child and classifies its exit.
///
/// Returns `Err` only when the child could not be spawned or fed (the caller
/// reports that as `worker_failed`); every other outcome, including crashes,
/// becomes a structured [`WorkerOutput`].
pub async fn spawn_isolated(
    exe: &Path,
    input: &WorkerInput,
    cancel: &CancellationToken,
) -> std::io::Result<WorkerOutput> {
    let mut child = Command::new(exe)
        .arg(WORKER_SUBCOMMAND)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let request = serde_json::to_vec(input).map_err(std::io::Error::other)?;
    {
        let mut stdin = child.stdin.take().expect("stdin should be piped");
        stdin.write_all(&request).await?;
        // Dropping stdin closes the pipe, signalling end of input.
    }

    // Route the child's stderr through our log, line by line, tagged with
    // the hash prefix.
    let stderr = child.stderr.take().expect("stderr should be piped");
    let prefix = format!("[worker:{}] ", trunc_hash(&input.info_hash));
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("{prefix}{line}");
        }
    });

    let mut stdout = child.stdout.take().expect("stdout should be piped");

    let outcome = tokio::select! {
        _ = cancel.cancelled() => None,
        outcome = read_and_wait(&mut stdout, &mut child) => Some(outcome),
    };

    let Some(outcome) = outcome else {
        let _ = child.kill().await;
        let _ = child.wait().await;
        let _ = stderr_task.await;
        return Ok(WorkerOutput::bare(ScanResult::failure(
            &input.info_hash,
            ScanStatus::Cancelled,
            "cancelled",
        )));
    };
    let _ = stderr_task.await;

    let (stdout_bytes, status) = match outcome {
        Ok(pair) => pair,
        Err(e) => {
            // The child died before we could collect its output.
            return Ok(crash_output(
                &input.info_hash,
                format!("read worker output: {e}"),
            ));
        }
    };

    if status.success() {
        return Ok(match serde_json::from_slice::<WorkerOutput>(&stdout_bytes) {
            Ok(output) => output,
            Err(e) => error_output(
                &input.info_hash,
                format!(
                    "invalid worker output: {e} (output: {})",
                    preview(&stdout_bytes)
                ),
            ),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Ok(crash_output(
                &input.info_hash,
                format!("killed by signal {}", signal_name(signal)),
            ));
        }
    }

    Ok(error_output(
        &input.info_hash,
        format!("exit {}", status.code().unwrap_or(-1)),
    ))
}

async fn read_and_wait(
    stdout: &mut tokio::process::ChildStdout,
    child: &mut tokio::process::Child,
) -> std::io::Result<(Vec<u8>, std::process::ExitStatus)> {
    let mut buf = Vec::new();
    stdout.read_to_end(&mut buf).await?;
    let status = child.wait().await?;
    Ok((buf, status))
}

fn crash_output(info_hash: &str, reason: String) -> WorkerOutput {
    WorkerOutput::bare(ScanResult::failure(
        info_hash,
        ScanStatus::WorkerCrashed,
        reason,
    ))
}

fn error_output(info_hash: &str, reason: String) -> WorkerOutput {
    WorkerOutput::bare(ScanResult::failure(
        info_hash,
        ScanStatus::WorkerError,
        reason,
    ))
}

fn preview(data: &[u8]) -> String {
    if data.len() <= STDOUT_PREVIEW_LIMIT {
        String::from_utf8_lossy(data).into_owned()
    } else {
        format!(
            "{}... (truncated)",
            String::from_utf8_lossy(&data[..STDOUT_PREVIEW_LIMIT])
        )
    }
}

/// Names the common fatal signals; native storage races surface as SIGBUS
/// or SIGSEGV.
#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    match signal {
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        7 => "SIGBUS".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        n => format!("signal {n}"),
    }
}

//! Bounded-concurrency scan scheduling.
//!
//! One task per hash, admitted by a counting semaphore. Results flow out on
//! a channel in completion order; every submitted hash produces exactly one
//! result. Cancellation turns not-yet-started hashes into immediate
//! `cancelled` results and lets in-flight scans wind down before the channel
//! closes.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::peer::{PeerClient, RqbitClient};
use crate::probe::FfprobeProber;
use crate::stats::Stats;

use super::orchestrator::{process_one, ScanLimits};
use super::types::{trunc_hash, ScanResult, ScanStatus};
use super::worker::{spawn_isolated, WorkerInput};

/// Scans a list of hashes concurrently; results are emitted as each torrent
/// completes, not in input order.
pub fn scan(
    cfg: ScanConfig,
    hashes: Vec<String>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ScanResult> {
    scan_with_stats(cfg, hashes, None, cancel)
}

/// Like [`scan`], also folding every result into the shared stats record.
///
/// Stats mutations are serialized under the mutex; callers must not read the
/// record until the result channel has been drained.
pub fn scan_with_stats(
    cfg: ScanConfig,
    hashes: Vec<String>,
    stats: Option<Arc<Mutex<Stats>>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ScanResult> {
    let total = hashes.len();
    let (hash_tx, hash_rx) = mpsc::channel(total.max(1));
    for hash in hashes {
        // Capacity matches the list, so this never fails.
        let _ = hash_tx.try_send(hash);
    }
    drop(hash_tx);

    let (tx, rx) = mpsc::channel(cfg.concurrency.max(1));
    tokio::spawn(run_scheduler(cfg, hash_rx, Some(total), stats, cancel, tx));
    rx
}

/// Streaming variant for pipe mode: hashes arrive on a channel and each
/// result is emitted as soon as its scan completes. Closing the hash channel
/// drains in-flight scans and then closes the result channel.
pub fn scan_stream(
    cfg: ScanConfig,
    hashes: mpsc::Receiver<String>,
    stats: Option<Arc<Mutex<Stats>>>,
    cancel: CancellationToken,
) -> mpsc::Receiver<ScanResult> {
    let (tx, rx) = mpsc::channel(cfg.concurrency.max(1));
    tokio::spawn(run_scheduler(cfg, hashes, None, stats, cancel, tx));
    rx
}

async fn run_scheduler(
    cfg: ScanConfig,
    mut hashes: mpsc::Receiver<String>,
    total: Option<usize>,
    stats: Option<Arc<Mutex<Stats>>>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ScanResult>,
) {
    // Per-scan child processes keep a native crash from taking down the
    // whole run. Without a resolvable executable path (minimal containers)
    // we degrade to one shared in-process session.
    let exe = std::env::current_exe().ok();
    let shared_client: Option<Arc<RqbitClient>> = if exe.is_none() {
        warn!("subprocess isolation unavailable, using in-process mode");
        match RqbitClient::new(cfg.temp_dir.clone()).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                while let Some(hash) = hashes.recv().await {
                    let result = ScanResult::failure(
                        &hash,
                        ScanStatus::Error,
                        format!("failed to create peer session: {e}"),
                    );
                    record(&stats, &result, 0, 0);
                    let _ = tx.send(result).await;
                }
                return;
            }
        }
    } else {
        None
    };

    let semaphore = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let mut idx = 0usize;

    while let Some(hash) = hashes.recv().await {
        idx += 1;
        let cfg = cfg.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();
        let stats = stats.clone();
        let exe = exe.clone();
        let shared_client = shared_client.clone();

        tasks.spawn(async move {
            let progress = match total {
                Some(total) => format!("{idx}/{total}"),
                None => format!("{idx}"),
            };

            // Cancellation wins over admission so unstarted hashes settle
            // immediately.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            let (result, downloaded, uploaded) = match permit {
                None => (
                    ScanResult::failure(&hash, ScanStatus::Cancelled, "cancelled"),
                    0,
                    0,
                ),
                Some(_permit) => match (&exe, &shared_client) {
                    (Some(exe), _) => {
                        let input =
                            WorkerInput::for_hash(&cfg, &hash, idx, total.unwrap_or(0));
                        match spawn_isolated(exe, &input, &cancel).await {
                            Ok(output) => (output.result, output.downloaded, output.uploaded),
                            Err(e) => (
                                ScanResult::failure(
                                    &hash,
                                    ScanStatus::WorkerFailed,
                                    format!("worker failed: {e}"),
                                ),
                                0,
                                0,
                            ),
                        }
                    }
                    (None, Some(client)) => {
                        scan_in_process(client.as_ref(), &cfg, &hash, &progress, &cancel).await
                    }
                    (None, None) => unreachable!("in-process fallback always has a client"),
                },
            };

            record(&stats, &result, downloaded, uploaded);

            info!(
                progress = %progress,
                hash = trunc_hash(&result.info_hash),
                status = %result.status,
                elapsed_ms = result.elapsed_ms,
                "scan finished"
            );

            let _ = tx.send(result).await;
        });
    }

    // Drain every task before the tx clones drop and close the channel.
    while tasks.join_next().await.is_some() {}
}

/// In-process fallback: the shared session downloads into the scratch root
/// directly, and the scheduler performs the cleanup a worker child would.
async fn scan_in_process(
    client: &RqbitClient,
    cfg: &ScanConfig,
    hash: &str,
    progress: &str,
    cancel: &CancellationToken,
) -> (ScanResult, u64, u64) {
    info!(progress, hash = trunc_hash(hash), "scanning in-process");

    let prober = FfprobeProber::new(
        cfg.ffprobe_path
            .clone()
            .unwrap_or_else(|| "ffprobe".into()),
    );
    let limits = ScanLimits {
        scratch_dir: client.data_dir().to_path_buf(),
        stall_timeout: cfg.stall_timeout(),
        max_timeout: cfg.max_timeout(),
        min_bytes_mkv: cfg.min_bytes_mkv,
        min_bytes_mp4: cfg.min_bytes_mp4,
        max_probe_retries: cfg.max_probe_retries,
    };

    let detector = crate::langdetect::resolve_detector()
        .map(|d| d as &dyn crate::langdetect::LanguageDetector);
    let result = process_one(client, &prober, detector, &limits, hash, cancel).await;

    let totals = client.transfer_totals(hash).await;
    client.remove(hash, true).await;

    (result, totals.downloaded, totals.uploaded)
}

fn record(stats: &Option<Arc<Mutex<Stats>>>, result: &ScanResult, downloaded: u64, uploaded: u64) {
    if let Some(stats) = stats {
        let mut stats = stats.lock().unwrap();
        stats.record_result(result, downloaded);
        stats.record_traffic(0, uploaded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config(temp: &std::path::Path) -> ScanConfig {
        ScanConfig {
            concurrency: 2,
            stall_timeout: 1,
            max_timeout: 2,
            temp_dir: temp.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_every_hash_produces_exactly_one_result_when_cancelled() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());

        let hashes: Vec<String> = (0..6).map(|i| format!("{i:040x}")).collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut rx = scan(cfg, hashes.clone(), cancel);
        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            assert_eq!(result.status, ScanStatus::Cancelled);
            seen.push(result.info_hash);
        }

        seen.sort();
        let mut expected = hashes;
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_cancelled_results_recorded_in_stats() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());

        let hashes: Vec<String> = (0..3).map(|i| format!("{i:040x}")).collect();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = Arc::new(Mutex::new(Stats::default()));
        let mut rx = scan_with_stats(cfg, hashes, Some(stats.clone()), cancel);
        while rx.recv().await.is_some() {}

        let stats = stats.lock().unwrap();
        assert_eq!(stats.total_scanned, 3);
        assert_eq!(stats.failures_by_type.get("cancelled"), Some(&3));
    }

    #[tokio::test]
    async fn test_stream_mode_emits_one_result_per_hash() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (hash_tx, hash_rx) = tokio::sync::mpsc::channel(4);
        let mut rx = scan_stream(cfg, hash_rx, None, cancel);

        for i in 0..4 {
            hash_tx.send(format!("{i:040x}")).await.unwrap();
        }
        drop(hash_tx);

        let mut count = 0;
        while let Some(result) = rx.recv().await {
            assert_eq!(result.status, ScanStatus::Cancelled);
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_empty_hash_list_closes_channel() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = test_config(tmp.path());

        let mut rx = scan(cfg, Vec::new(), CancellationToken::new());
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(got.is_none());
    }
}

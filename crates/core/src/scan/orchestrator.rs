//! Per-hash scan orchestration.
//!
//! Drives one torrent through plan-and-fetch, snapshot, probe-with-retry and
//! result assembly. Cleanup of the torrent and its scratch data is the
//! worker's job, never the orchestrator's: the peer handle must stay alive
//! through snapshot, resolve and probe.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fetch::{
    await_pieces, is_mp4_family, plan_pieces, resolve_scratch_path, select_target, FetchError,
    FetchTimeouts,
};
use crate::lang::compute_languages;
use crate::langdetect::{apply_lang_detection, LanguageDetector};
use crate::peer::{build_magnet, PeerClient, PeerError, TorrentFileMeta};
use crate::probe::MediaProber;
use crate::threat::analyze_files;

use super::types::{trunc_hash, ScanResult, ScanStatus, SwarmInfo, TorrentFiles};

/// Per-scan limits handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// Directory the peer session stores pieces under.
    pub scratch_dir: PathBuf,
    pub stall_timeout: Duration,
    pub max_timeout: Duration,
    pub min_bytes_mkv: u64,
    pub min_bytes_mp4: u64,
    pub max_probe_retries: u32,
}

/// The single site mapping fetch errors onto result statuses.
pub fn classify_fetch_error(err: &FetchError) -> ScanStatus {
    match err {
        FetchError::MetadataTimeout { .. } => ScanStatus::StallMetadata,
        FetchError::Stall { .. } => ScanStatus::StallDownload,
        FetchError::MaxTimeout { .. } => ScanStatus::Timeout,
        FetchError::NoVideo => ScanStatus::NoVideo,
        FetchError::FileNotFound { .. } => ScanStatus::FileNotFound,
        FetchError::Cancelled => ScanStatus::Cancelled,
        FetchError::Peer(_) => ScanStatus::Error,
    }
}

struct FetchedTarget {
    target: TorrentFileMeta,
    begin_piece: u32,
    end_piece: u32,
    piece_length: u64,
    mp4_family: bool,
    local_path: PathBuf,
    budget: u64,
}

/// Scans a single torrent end to end.
pub async fn process_one(
    client: &dyn PeerClient,
    prober: &dyn MediaProber,
    detector: Option<&dyn LanguageDetector>,
    limits: &ScanLimits,
    info_hash: &str,
    cancel: &CancellationToken,
) -> ScanResult {
    let started = Instant::now();
    let timeouts = FetchTimeouts {
        stall_timeout: limits.stall_timeout,
        max_timeout: limits.max_timeout,
    };

    let fetched = match fetch_target(client, limits, info_hash, timeouts, cancel).await {
        Ok(f) => f,
        Err(e) => {
            let mut result = failure_result(info_hash, &e, started);
            // Metadata may have resolved before the failure; enrich anyway.
            let (files, swarm) = snapshot(client, info_hash).await;
            result.files = files;
            result.swarm = swarm;
            return result;
        }
    };

    let file_name = fetched.target.basename().to_string();
    let (torrent_files, swarm) = snapshot(client, info_hash).await;

    let mut budget = fetched.budget;
    for attempt in 0..=limits.max_probe_retries {
        match prober.probe(&fetched.local_path).await {
            Ok(report) if !report.audio.is_empty() => {
                debug!(
                    hash = trunc_hash(info_hash),
                    audio = report.audio.len(),
                    subs = report.subtitles.len(),
                    video = report.video.is_some(),
                    "probe succeeded"
                );

                let mut result = ScanResult {
                    info_hash: info_hash.to_string(),
                    status: ScanStatus::Success,
                    file: file_name.clone(),
                    languages: compute_languages(&[], &report.audio),
                    audio: report.audio,
                    subtitles: report.subtitles,
                    video: report.video,
                    elapsed_ms: 0,
                    error: String::new(),
                    files: torrent_files,
                    swarm,
                };

                if let Some(detector) = detector {
                    apply_lang_detection(detector, &mut result, &fetched.local_path).await;
                }

                result.elapsed_ms = started.elapsed().as_millis() as u64;
                return result;
            }
            Ok(_) => {
                // Parsed but no audio: the container index is still missing
                // data (typical for moov-at-end MP4s), so fetch more.
                debug!(
                    hash = trunc_hash(info_hash),
                    attempt, "probe returned no audio tracks"
                );
            }
            Err(e) => {
                warn!(hash = trunc_hash(info_hash), attempt, "probe error: {e}");
            }
        }

        if attempt < limits.max_probe_retries {
            budget = budget.saturating_mul(2);
            info!(
                hash = trunc_hash(info_hash),
                attempt = attempt + 1,
                retries = limits.max_probe_retries,
                budget_kb = budget / 1024,
                "probe failed, requesting more data"
            );
            if let Err(e) = request_more(client, info_hash, &fetched, budget, timeouts, cancel).await
            {
                let mut result = failure_result(info_hash, &e, started);
                result.file = fetched.target.basename().to_string();
                result.files = torrent_files;
                result.swarm = swarm;
                return result;
            }
        }
    }

    ScanResult {
        info_hash: info_hash.to_string(),
        status: ScanStatus::FfprobeFailed,
        file: fetched.target.basename().to_string(),
        audio: Vec::new(),
        subtitles: Vec::new(),
        video: None,
        languages: Vec::new(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        error: String::new(),
        files: torrent_files,
        swarm,
    }
}

async fn fetch_target(
    client: &dyn PeerClient,
    limits: &ScanLimits,
    info_hash: &str,
    timeouts: FetchTimeouts,
    cancel: &CancellationToken,
) -> Result<FetchedTarget, FetchError> {
    client
        .add_magnet(&build_magnet(info_hash), timeouts.stall_timeout)
        .await
        .map_err(|e| match e {
            PeerError::MetadataTimeout(waited) => FetchError::MetadataTimeout { waited },
            other => FetchError::Peer(other),
        })?;

    let meta = client.metadata(info_hash).await?;
    let (_, target) = select_target(&meta).ok_or(FetchError::NoVideo)?;
    let target = target.clone();
    let ext = target.ext();
    let mp4_family = is_mp4_family(&ext);

    debug!(
        hash = trunc_hash(info_hash),
        file = %target.path,
        size_mb = target.length / 1024 / 1024,
        ext = %ext,
        "video target selected"
    );

    let budget = if mp4_family {
        limits.min_bytes_mp4
    } else {
        limits.min_bytes_mkv
    };
    let plan = plan_pieces(
        meta.piece_length,
        target.begin_piece,
        target.end_piece,
        budget,
        mp4_family,
    );

    debug!(
        hash = trunc_hash(info_hash),
        pieces = plan.len(),
        piece_kb = meta.piece_length / 1024,
        budget_kb = budget / 1024,
        "piece plan computed"
    );

    client.prioritize_pieces(info_hash, plan.indices()).await?;
    await_pieces(client, info_hash, &plan, timeouts, cancel).await?;

    let local_path = resolve_scratch_path(&limits.scratch_dir, &meta.name, &target.path).await?;

    Ok(FetchedTarget {
        begin_piece: target.begin_piece,
        end_piece: target.end_piece,
        piece_length: meta.piece_length,
        mp4_family,
        local_path,
        budget,
        target,
    })
}

/// Grows the plan to the new budget and waits for the extra pieces.
async fn request_more(
    client: &dyn PeerClient,
    info_hash: &str,
    fetched: &FetchedTarget,
    budget: u64,
    timeouts: FetchTimeouts,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let plan = plan_pieces(
        fetched.piece_length,
        fetched.begin_piece,
        fetched.end_piece,
        budget,
        fetched.mp4_family,
    );
    client.prioritize_pieces(info_hash, plan.indices()).await?;
    await_pieces(client, info_hash, &plan, timeouts, cancel).await
}

async fn snapshot(
    client: &dyn PeerClient,
    info_hash: &str,
) -> (Option<TorrentFiles>, Option<SwarmInfo>) {
    let entries = client.file_entries(info_hash).await;
    let files = if entries.is_empty() {
        None
    } else {
        Some(analyze_files(&entries))
    };
    (files, client.swarm(info_hash).await)
}

fn failure_result(info_hash: &str, err: &FetchError, started: Instant) -> ScanResult {
    let mut result = ScanResult::failure(info_hash, classify_fetch_error(err), err.to_string());
    result.elapsed_ms = started.elapsed().as_millis() as u64;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPeerClient, MockProber};
    use tempfile::TempDir;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    fn limits(scratch: &TempDir) -> ScanLimits {
        ScanLimits {
            scratch_dir: scratch.path().to_path_buf(),
            stall_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(60),
            min_bytes_mkv: 10 * 1024 * 1024,
            min_bytes_mp4: 20 * 1024 * 1024,
            max_probe_retries: 3,
        }
    }

    fn place_file(scratch: &TempDir, rel: &str) {
        let path = scratch.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"data").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_mkv_single_audio_success() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 2 << 30, 262_144);
        client.auto_complete_pieces();
        place_file(&scratch, "Movie.mkv");

        let prober = MockProber::new();
        prober.push_report(MockProber::report_with_audio(&["en"]));

        let cancel = CancellationToken::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::Success);
        assert_eq!(result.file, "Movie.mkv");
        assert_eq!(result.languages, vec!["en"]);
        assert_eq!(result.audio.len(), 1);
        assert!(result.files.is_some());

        // 10 MiB over 256 KiB pieces: exactly the first 40 pieces.
        let sets = client.prioritized_sets(HASH).await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].len(), 40);
        assert_eq!(sets[0][0], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mp4_retry_doubles_budget() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Show.mp4", 4 << 30, 524_288);
        client.auto_complete_pieces();
        place_file(&scratch, "Show.mp4");

        let prober = MockProber::new();
        // moov not reachable yet: parsed but zero audio streams.
        prober.push_report(MockProber::report_with_audio(&[]));
        prober.push_report(MockProber::report_with_audio(&["spa", "eng"]));

        let cancel = CancellationToken::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::Success);
        assert_eq!(result.languages, vec!["en", "es"]);

        let sets = client.prioritized_sets(HASH).await;
        assert_eq!(sets.len(), 2);
        // First plan: 20 MiB over 512 KiB pieces, head 0..40 + tail 8152..8192.
        assert_eq!(sets[0].len(), 80);
        assert_eq!(sets[0][0], 0);
        assert_eq!(*sets[0].last().unwrap(), 8191);
        assert!(sets[0].contains(&8152));
        // Retry: doubled to 40 MiB, head 0..80 + tail 8112..8192.
        assert_eq!(sets[1].len(), 160);
        assert!(sets[1].contains(&79));
        assert!(sets[1].contains(&8112));
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_timeout_classified() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.set_unresolvable(HASH);

        let prober = MockProber::new();
        let cancel = CancellationToken::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::StallMetadata);
        assert!(result.error.contains("metadata timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_video_file() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.add_torrent_meta(
            HASH,
            crate::peer::TorrentMeta {
                name: "Docs".to_string(),
                piece_length: 262_144,
                num_pieces: 4,
                files: vec![crate::peer::TorrentFileMeta {
                    path: "readme.nfo".to_string(),
                    length: 1000,
                    begin_piece: 0,
                    end_piece: 4,
                }],
            },
        );

        let prober = MockProber::new();
        let cancel = CancellationToken::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::NoVideo);
        // File listing still captured for threat classification.
        assert!(result.files.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_is_ffprobe_failed() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 30, 262_144);
        client.auto_complete_pieces();
        place_file(&scratch, "Movie.mkv");

        let prober = MockProber::new();
        prober.push_failure("moov atom not found");

        let cancel = CancellationToken::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::FfprobeFailed);
        assert_eq!(result.file, "Movie.mkv");
        // Initial attempt plus three doubling retries.
        assert_eq!(prober.calls().len(), 4);
        assert_eq!(client.prioritized_sets(HASH).await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_not_found_after_download() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 30, 262_144);
        client.auto_complete_pieces();
        // No file placed in scratch: the resolver must give up.

        let prober = MockProber::new();
        let cancel = CancellationToken::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::FileNotFound);
        assert!(result.error.contains("not found on disk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_yields_cancelled() {
        let scratch = TempDir::new().unwrap();
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 30, 262_144);
        // Pieces never complete; cancel fires mid-wait.

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cancel.cancel();
            });
        }

        let prober = MockProber::new();
        let result = process_one(
            &client,
            &prober,
            None,
            &limits(&scratch),
            HASH,
            &cancel,
        )
        .await;

        assert_eq!(result.status, ScanStatus::Cancelled);
    }
}

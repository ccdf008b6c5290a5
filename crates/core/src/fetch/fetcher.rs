//! Partial fetch driving: piece completion polling with two-clock stall
//! detection, an absolute timeout and cooperative cancellation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::peer::{PeerClient, PeerError};
use crate::scan::trunc_hash;

use super::plan::PiecePlan;

/// Errors from the fetch phase of a scan. Each maps to exactly one result
/// status at the orchestrator's single classification site.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("metadata timeout after {waited:?}")]
    MetadataTimeout { waited: Duration },

    #[error("stall: no piece or byte progress for {stalled_for:?}")]
    Stall { stalled_for: Duration },

    #[error("max timeout ({limit:?}) exceeded")]
    MaxTimeout { limit: Duration },

    #[error("no video file found in torrent")]
    NoVideo,

    #[error("downloaded file not found on disk under {root}")]
    FileNotFound { root: PathBuf },

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Timeout discipline for one fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    /// Both progress clocks must exceed this before a stall is declared.
    pub stall_timeout: Duration,
    /// Absolute wall-clock cap, independent of progress.
    pub max_timeout: Duration,
}

/// Polls piece completion at 1 Hz until the whole plan is complete.
///
/// Two progress clocks run side by side: one advances when another required
/// piece finishes, the other when cumulative bytes read from the swarm grows.
/// A stall fires only when *both* clocks exceed `stall_timeout`; this catches
/// silent swarms as well as leecher-only swarms that keep the session alive
/// without completing pieces. The absolute `max_timeout` and the cancellation
/// token are checked on every tick.
pub async fn await_pieces(
    client: &dyn PeerClient,
    info_hash: &str,
    plan: &PiecePlan,
    timeouts: FetchTimeouts,
    cancel: &CancellationToken,
) -> Result<(), FetchError> {
    let started = Instant::now();
    let deadline = started + timeouts.max_timeout;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_piece_progress = started;
    let mut last_byte_progress = started;
    let mut last_completed = 0usize;
    let mut last_bytes = client.transfer_totals(info_hash).await.downloaded;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(FetchError::MaxTimeout { limit: timeouts.max_timeout });
            }
            _ = ticker.tick() => {}
        }

        let mut completed = 0usize;
        for &piece in plan.indices() {
            if client.piece_complete(info_hash, piece).await? {
                completed += 1;
            }
        }
        if completed == plan.len() {
            return Ok(());
        }

        let now = Instant::now();
        if completed > last_completed {
            last_piece_progress = now;
            last_completed = completed;
        }

        let bytes = client.transfer_totals(info_hash).await.downloaded;
        if bytes > last_bytes {
            last_byte_progress = now;
            last_bytes = bytes;
        }

        let piece_silence = now - last_piece_progress;
        let byte_silence = now - last_byte_progress;
        if piece_silence > timeouts.stall_timeout && byte_silence > timeouts.stall_timeout {
            return Err(FetchError::Stall {
                stalled_for: piece_silence.min(byte_silence),
            });
        }

        if completed > 0 {
            debug!(
                hash = trunc_hash(info_hash),
                completed,
                required = plan.len(),
                bytes,
                "pieces in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::plan::plan_pieces;
    use crate::testing::MockPeerClient;

    fn timeouts(stall_s: u64, max_s: u64) -> FetchTimeouts {
        FetchTimeouts {
            stall_timeout: Duration::from_secs(stall_s),
            max_timeout: Duration::from_secs(max_s),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_pieces_completes() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent("a".repeat(40), "Movie.mkv", 1 << 20, 64 * 1024);
        let hash = "a".repeat(40);

        let plan = plan_pieces(64 * 1024, 0, 16, 256 * 1024, false);
        client.complete_pieces(&hash, plan.indices()).await;

        let cancel = CancellationToken::new();
        await_pieces(&client, &hash, &plan, timeouts(5, 60), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_pieces_stalls_when_both_clocks_silent() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent("b".repeat(40), "Movie.mkv", 1 << 20, 64 * 1024);
        let hash = "b".repeat(40);

        let plan = plan_pieces(64 * 1024, 0, 16, 256 * 1024, false);
        let cancel = CancellationToken::new();

        let err = await_pieces(&client, &hash, &plan, timeouts(3, 600), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Stall { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_byte_progress_defers_stall() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent("c".repeat(40), "Movie.mkv", 1 << 20, 64 * 1024);
        let hash = "c".repeat(40);

        let plan = plan_pieces(64 * 1024, 0, 16, 256 * 1024, false);
        let cancel = CancellationToken::new();

        // Feed byte progress for a while without completing any piece: the
        // byte clock keeps resetting, so the stall must fire later than it
        // would in total silence.
        {
            let client = client.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                for i in 1..=10u64 {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    client.set_downloaded_bytes(&hash, i * 1000).await;
                }
            });
        }

        let started = tokio::time::Instant::now();
        let err = await_pieces(&client, &hash, &plan, timeouts(3, 600), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Stall { .. }));
        // Byte progress up to t=20s keeps the loop alive well past the bare
        // 3 s stall window.
        assert!(started.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_timeout_fires() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent("d".repeat(40), "Movie.mkv", 1 << 20, 64 * 1024);
        let hash = "d".repeat(40);

        let plan = plan_pieces(64 * 1024, 0, 16, 256 * 1024, false);
        let cancel = CancellationToken::new();

        // Keep the byte clock warm forever; only the absolute cap can end this.
        {
            let client = client.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                let mut n = 0u64;
                loop {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    n += 1;
                    client.set_downloaded_bytes(&hash, n).await;
                }
            });
        }

        let err = await_pieces(&client, &hash, &plan, timeouts(3600, 10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MaxTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_observed_within_a_tick() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent("e".repeat(40), "Movie.mkv", 1 << 20, 64 * 1024);
        let hash = "e".repeat(40);

        let plan = plan_pieces(64 * 1024, 0, 16, 256 * 1024, false);
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                cancel.cancel();
            });
        }

        let started = tokio::time::Instant::now();
        let err = await_pieces(&client, &hash, &plan, timeouts(90, 600), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(started.elapsed() <= Duration::from_secs(4));
    }
}

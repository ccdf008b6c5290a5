//! End-to-end scan scenarios against in-memory fakes.

use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use truespec_core::peer::{TorrentFileMeta, TorrentMeta};
use truespec_core::scan::{process_one, ScanLimits, ScanStatus};
use truespec_core::testing::{MockPeerClient, MockProber};

const HASH: &str = "a1b2c3d4e5f6a7b8c9d0a1b2c3d4e5f6a7b8c9d0";

fn limits(scratch: &TempDir) -> ScanLimits {
    ScanLimits {
        scratch_dir: scratch.path().to_path_buf(),
        stall_timeout: Duration::from_secs(10),
        max_timeout: Duration::from_secs(120),
        min_bytes_mkv: 10 * 1024 * 1024,
        min_bytes_mp4: 20 * 1024 * 1024,
        max_probe_retries: 3,
    }
}

fn place_file(scratch: &TempDir, rel: &str) {
    let path = scratch.path().join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"partial media data").unwrap();
}

/// MKV target with a single English audio track: one 40-piece head plan
/// over 256 KiB pieces for a 10 MiB budget, then success with normalized
/// languages.
#[tokio::test(start_paused = true)]
async fn mkv_single_audio_track() {
    let scratch = TempDir::new().unwrap();
    let client = MockPeerClient::new();
    client.add_single_file_torrent(HASH, "Movie.mkv", 2u64 << 30, 262_144);
    client.auto_complete_pieces();
    place_file(&scratch, "Movie.mkv");

    let prober = MockProber::new();
    prober.push_report(MockProber::report_with_audio(&["eng"]));

    let result = process_one(
        &client,
        &prober,
        None,
        &limits(&scratch),
        HASH,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, ScanStatus::Success);
    assert_eq!(result.file, "Movie.mkv");
    assert_eq!(result.languages, vec!["en"]);
    assert_eq!(result.audio[0].lang, "en");

    let sets = client.prioritized_sets(HASH).await;
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0], (0..40).collect::<Vec<u32>>());
}

/// MP4 with moov at the end: the first probe sees no audio, the retry
/// doubles the budget and widens both head and tail, then succeeds with
/// normalized, sorted languages.
#[tokio::test(start_paused = true)]
async fn mp4_moov_at_end_retry() {
    let scratch = TempDir::new().unwrap();
    let client = MockPeerClient::new();
    client.add_single_file_torrent(HASH, "Show.mp4", 4u64 << 30, 524_288);
    client.auto_complete_pieces();
    place_file(&scratch, "Show.mp4");

    let prober = MockProber::new();
    prober.push_report(MockProber::report_with_audio(&[]));
    prober.push_report(MockProber::report_with_audio(&["spa", "eng"]));

    let result = process_one(
        &client,
        &prober,
        None,
        &limits(&scratch),
        HASH,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, ScanStatus::Success);
    assert_eq!(result.languages, vec!["en", "es"]);

    let sets = client.prioritized_sets(HASH).await;
    assert_eq!(sets.len(), 2);

    // 20 MiB over 512 KiB pieces: head 0..40 plus tail 8152..8192.
    let first: &Vec<u32> = &sets[0];
    assert!(first.contains(&0) && first.contains(&39));
    assert!(!first.contains(&40));
    assert!(first.contains(&8152) && first.contains(&8191));
    assert!(!first.contains(&8151));

    // Retry at 40 MiB: head 0..80 plus tail 8112..8192.
    let second: &Vec<u32> = &sets[1];
    assert!(second.contains(&79));
    assert!(second.contains(&8112));
}

/// Wrapper directories defeat the static candidate paths; the recursive
/// walk still finds the `.part` file and the scan proceeds to probe.
#[tokio::test(start_paused = true)]
async fn wrapper_directory_layout() {
    let scratch = TempDir::new().unwrap();
    let client = MockPeerClient::new();
    client.add_torrent_meta(
        HASH,
        TorrentMeta {
            name: "Pack".to_string(),
            piece_length: 262_144,
            num_pieces: 4096,
            files: vec![TorrentFileMeta {
                path: "Season1/Ep01.mkv".to_string(),
                length: 900 << 20,
                begin_piece: 0,
                end_piece: 3600,
            }],
        },
    );
    client.auto_complete_pieces();
    place_file(&scratch, "Pack/www.example.org - Pack/Ep01.mkv.part");

    let prober = MockProber::new();
    prober.push_report(MockProber::report_with_audio(&["eng"]));

    let result = process_one(
        &client,
        &prober,
        None,
        &limits(&scratch),
        HASH,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, ScanStatus::Success);
    assert_eq!(result.file, "Ep01.mkv");
    assert!(prober.calls()[0]
        .to_string_lossy()
        .ends_with("Ep01.mkv.part"));
}

/// The largest video file wins target selection; the file listing snapshot
/// classifies the stray executable and marks the torrent dangerous.
#[tokio::test(start_paused = true)]
async fn threat_classification_in_snapshot() {
    let scratch = TempDir::new().unwrap();
    let client = MockPeerClient::new();
    client.add_torrent_meta(
        HASH,
        TorrentMeta {
            name: "Bundle".to_string(),
            piece_length: 262_144,
            num_pieces: 8192,
            files: vec![
                TorrentFileMeta {
                    path: "Bundle/Movie.mkv".to_string(),
                    length: 1u64 << 30,
                    begin_piece: 0,
                    end_piece: 4096,
                },
                TorrentFileMeta {
                    path: "Bundle/Codec-Pack.exe".to_string(),
                    length: 2 << 20,
                    begin_piece: 4096,
                    end_piece: 4105,
                },
            ],
        },
    );
    client.auto_complete_pieces();
    place_file(&scratch, "Bundle/Movie.mkv");

    let prober = MockProber::new();
    prober.push_report(MockProber::report_with_audio(&["eng"]));

    let result = process_one(
        &client,
        &prober,
        None,
        &limits(&scratch),
        HASH,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, ScanStatus::Success);
    let files = result.files.expect("file listing captured");
    assert_eq!(files.threat_level, "dangerous");
    assert_eq!(files.suspicious.len(), 1);
    assert_eq!(files.video_files.len(), 1);
}

/// A hash whose metadata never arrives fails as stall_metadata within the
/// stall timeout, not the max timeout.
#[tokio::test(start_paused = true)]
async fn metadata_never_resolves() {
    let scratch = TempDir::new().unwrap();
    let client = MockPeerClient::new();
    client.set_unresolvable(HASH);

    let prober = MockProber::new();
    let started = tokio::time::Instant::now();
    let result = process_one(
        &client,
        &prober,
        None,
        &limits(&scratch),
        HASH,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(result.status, ScanStatus::StallMetadata);
    assert!(started.elapsed() < Duration::from_secs(60));
}

//! Mock peer client for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::peer::{PeerClient, PeerError, TorrentFileMeta, TorrentMeta, TransferTotals};
use crate::scan::{FileInfo, SwarmInfo};

struct MockTorrentState {
    meta: TorrentMeta,
    completed: HashSet<u32>,
    prioritized: Vec<Vec<u32>>,
    downloaded: u64,
    uploaded: u64,
    swarm: Option<SwarmInfo>,
    added: bool,
}

impl MockTorrentState {
    fn new(meta: TorrentMeta) -> Self {
        MockTorrentState {
            meta,
            completed: HashSet::new(),
            prioritized: Vec::new(),
            downloaded: 0,
            uploaded: 0,
            swarm: None,
            added: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    torrents: HashMap<String, MockTorrentState>,
    /// Hashes whose metadata never resolves.
    unresolvable: HashSet<String>,
    /// Complete prioritized pieces as soon as they are requested.
    auto_complete: bool,
    removed: Vec<(String, bool)>,
}

/// In-memory implementation of the [`PeerClient`] capability set.
///
/// Registered torrents resolve instantly; hashes marked unresolvable yield a
/// metadata timeout. Piece completion and transfer totals are driven
/// explicitly by the test, or automatically when `auto_complete_pieces` is
/// enabled.
#[derive(Clone, Default)]
pub struct MockPeerClient {
    state: Arc<Mutex<MockState>>,
}

impl MockPeerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a torrent whose metadata resolves immediately.
    pub fn add_torrent_meta(&self, hash: impl Into<String>, meta: TorrentMeta) {
        let mut state = self.state.lock().unwrap();
        state
            .torrents
            .insert(hash.into(), MockTorrentState::new(meta));
    }

    /// Registers a single-file torrent with piece geometry derived from the
    /// file length.
    pub fn add_single_file_torrent(
        &self,
        hash: impl Into<String>,
        file_path: &str,
        length: u64,
        piece_length: u64,
    ) {
        let num_pieces = length.div_ceil(piece_length) as u32;
        let name = file_path.rsplit('/').next().unwrap_or(file_path).to_string();
        self.add_torrent_meta(
            hash,
            TorrentMeta {
                name,
                piece_length,
                num_pieces,
                files: vec![TorrentFileMeta {
                    path: file_path.to_string(),
                    length,
                    begin_piece: 0,
                    end_piece: num_pieces,
                }],
            },
        );
    }

    /// Marks a hash as never resolving metadata.
    pub fn set_unresolvable(&self, hash: impl Into<String>) {
        self.state.lock().unwrap().unresolvable.insert(hash.into());
    }

    /// Completes prioritized pieces the moment they are requested.
    pub fn auto_complete_pieces(&self) {
        self.state.lock().unwrap().auto_complete = true;
    }

    /// Marks the given pieces complete and grows the byte counter to match.
    pub async fn complete_pieces(&self, hash: &str, pieces: &[u32]) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.torrents.get_mut(hash) {
            t.completed.extend(pieces.iter().copied());
            t.downloaded += pieces.len() as u64 * t.meta.piece_length;
        }
    }

    /// Sets the cumulative downloaded byte counter.
    pub async fn set_downloaded_bytes(&self, hash: &str, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.torrents.get_mut(hash) {
            t.downloaded = bytes;
        }
    }

    /// Sets the uploaded byte counter.
    pub fn set_uploaded_bytes(&self, hash: &str, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.torrents.get_mut(hash) {
            t.uploaded = bytes;
        }
    }

    /// Sets the swarm snapshot returned for a hash.
    pub async fn set_swarm(&self, hash: &str, swarm: SwarmInfo) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.torrents.get_mut(hash) {
            t.swarm = Some(swarm);
        }
    }

    /// All piece sets prioritized for a hash, in request order.
    pub async fn prioritized_sets(&self, hash: &str) -> Vec<Vec<u32>> {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(hash)
            .map(|t| t.prioritized.clone())
            .unwrap_or_default()
    }

    /// Hashes removed via [`PeerClient::remove`], with their delete flag.
    pub async fn removed(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().removed.clone()
    }

    /// Whether a magnet for this hash was ever submitted.
    pub async fn was_added(&self, hash: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(hash)
            .map(|t| t.added)
            .unwrap_or(false)
    }

    fn hash_from_magnet(magnet: &str) -> Option<String> {
        magnet
            .split_once("xt=urn:btih:")
            .map(|(_, rest)| rest.split('&').next().unwrap_or(rest).to_lowercase())
    }
}

#[async_trait]
impl PeerClient for MockPeerClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn add_magnet(&self, magnet: &str, metadata_deadline: Duration) -> Result<(), PeerError> {
        let hash = Self::hash_from_magnet(magnet)
            .ok_or_else(|| PeerError::Session(format!("unparseable magnet: {magnet}")))?;

        let unresolvable = self.state.lock().unwrap().unresolvable.contains(&hash);
        if unresolvable {
            tokio::time::sleep(metadata_deadline).await;
            return Err(PeerError::MetadataTimeout(metadata_deadline));
        }

        let mut state = self.state.lock().unwrap();
        match state.torrents.get_mut(&hash) {
            Some(t) => {
                t.added = true;
                Ok(())
            }
            None => Err(PeerError::NotFound(hash)),
        }
    }

    async fn metadata(&self, info_hash: &str) -> Result<TorrentMeta, PeerError> {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(info_hash)
            .map(|t| t.meta.clone())
            .ok_or_else(|| PeerError::NotFound(info_hash.to_string()))
    }

    async fn prioritize_pieces(&self, info_hash: &str, pieces: &[u32]) -> Result<(), PeerError> {
        let mut state = self.state.lock().unwrap();
        let auto = state.auto_complete;
        let t = state
            .torrents
            .get_mut(info_hash)
            .ok_or_else(|| PeerError::NotFound(info_hash.to_string()))?;
        t.prioritized.push(pieces.to_vec());
        if auto {
            t.completed.extend(pieces.iter().copied());
            t.downloaded += pieces.len() as u64 * t.meta.piece_length;
        }
        Ok(())
    }

    async fn piece_complete(&self, info_hash: &str, index: u32) -> Result<bool, PeerError> {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(info_hash)
            .map(|t| t.completed.contains(&index))
            .ok_or_else(|| PeerError::NotFound(info_hash.to_string()))
    }

    async fn transfer_totals(&self, info_hash: &str) -> TransferTotals {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(info_hash)
            .map(|t| TransferTotals {
                downloaded: t.downloaded,
                uploaded: t.uploaded,
            })
            .unwrap_or_default()
    }

    async fn swarm(&self, info_hash: &str) -> Option<SwarmInfo> {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(info_hash)
            .and_then(|t| t.swarm.clone())
    }

    async fn file_entries(&self, info_hash: &str) -> Vec<FileInfo> {
        self.state
            .lock()
            .unwrap()
            .torrents
            .get(info_hash)
            .map(|t| {
                t.meta
                    .files
                    .iter()
                    .map(|f| FileInfo {
                        path: f.path.clone(),
                        size: f.length,
                        ext: f.ext(),
                        reason: None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn remove(&self, info_hash: &str, delete_files: bool) {
        let mut state = self.state.lock().unwrap();
        state.torrents.remove(info_hash);
        state.removed.push((info_hash.to_string(), delete_files));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::build_magnet;

    const HASH: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[tokio::test]
    async fn test_add_and_metadata() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 20, 64 * 1024);

        client
            .add_magnet(&build_magnet(HASH), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(client.was_added(HASH).await);

        let meta = client.metadata(HASH).await.unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.num_pieces, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_times_out() {
        let client = MockPeerClient::new();
        client.set_unresolvable(HASH);

        let err = client
            .add_magnet(&build_magnet(HASH), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::MetadataTimeout(_)));
    }

    #[tokio::test]
    async fn test_piece_completion_tracking() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 20, 64 * 1024);

        assert!(!client.piece_complete(HASH, 3).await.unwrap());
        client.complete_pieces(HASH, &[3]).await;
        assert!(client.piece_complete(HASH, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_auto_complete_on_prioritize() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 20, 64 * 1024);
        client.auto_complete_pieces();

        client.prioritize_pieces(HASH, &[0, 1, 2]).await.unwrap();
        assert!(client.piece_complete(HASH, 2).await.unwrap());
        assert_eq!(client.prioritized_sets(HASH).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_records() {
        let client = MockPeerClient::new();
        client.add_single_file_torrent(HASH, "Movie.mkv", 1 << 20, 64 * 1024);
        client.remove(HASH, true).await;

        assert_eq!(client.removed().await, vec![(HASH.to_string(), true)]);
        assert!(client.metadata(HASH).await.is_err());
    }
}

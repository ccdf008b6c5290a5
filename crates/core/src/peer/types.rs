//! Types and capability traits for the BitTorrent peer layer.
//!
//! The scanning engine never talks to a torrent library directly. It consumes
//! the small capability set below, keyed by info hash, so tests can substitute
//! an in-memory fake and the library-backed session stays swappable.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::scan::{FileInfo, SwarmInfo};

/// Errors surfaced by a peer session backend.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Torrent metadata did not arrive before the deadline.
    #[error("metadata timeout after {0:?}")]
    MetadataTimeout(Duration),

    /// The session does not know the given info hash.
    #[error("torrent not found: {0}")]
    NotFound(String),

    /// The backing library rejected the operation.
    #[error("peer session error: {0}")]
    Session(String),
}

/// Immutable torrent metadata, resolved once per scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMeta {
    pub name: String,
    pub piece_length: u64,
    pub num_pieces: u32,
    pub files: Vec<TorrentFileMeta>,
}

/// One file entry within resolved torrent metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileMeta {
    /// Path relative to the torrent root. May itself start with the torrent
    /// name for multi-file torrents; the scratch resolver handles both forms.
    pub path: String,
    pub length: u64,
    /// First piece covering any byte of this file.
    pub begin_piece: u32,
    /// One past the last piece covering any byte of this file.
    pub end_piece: u32,
}

impl TorrentFileMeta {
    /// Lowercased extension including the leading dot, or empty.
    pub fn ext(&self) -> String {
        std::path::Path::new(&self.path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_default()
    }

    /// Final path component.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Cumulative payload transfer totals for one torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Capability set the scanning engine requires from a torrent backend.
///
/// All operations are keyed by lowercase 40-hex info hash. A backend owns at
/// most one live torrent per hash; `remove` releases it and optionally deletes
/// whatever the backend wrote under its data directory.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Submits a magnet URI and waits for metadata up to `metadata_deadline`.
    ///
    /// Fails with [`PeerError::MetadataTimeout`] when the swarm never
    /// produces the info dictionary in time.
    async fn add_magnet(&self, magnet: &str, metadata_deadline: Duration) -> Result<(), PeerError>;

    /// Returns the resolved metadata for a previously added torrent.
    async fn metadata(&self, info_hash: &str) -> Result<TorrentMeta, PeerError>;

    /// Marks the given piece indices as needed immediately. No pieces outside
    /// the union of all prioritized sets are requested from the swarm.
    async fn prioritize_pieces(&self, info_hash: &str, pieces: &[u32]) -> Result<(), PeerError>;

    /// Whether a single piece has been downloaded and validated.
    async fn piece_complete(&self, info_hash: &str, index: u32) -> Result<bool, PeerError>;

    /// Cumulative transfer totals; zero when the hash is unknown.
    async fn transfer_totals(&self, info_hash: &str) -> TransferTotals;

    /// Swarm health snapshot, when the torrent is still active.
    async fn swarm(&self, info_hash: &str) -> Option<SwarmInfo>;

    /// Complete file listing from resolved metadata; empty when unresolved.
    async fn file_entries(&self, info_hash: &str) -> Vec<FileInfo>;

    /// Drops the torrent and, when `delete_files`, its on-disk data.
    async fn remove(&self, info_hash: &str, delete_files: bool);
}

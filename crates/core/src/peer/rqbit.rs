//! librqbit-backed peer session.
//!
//! Maps the hash-keyed [`PeerClient`] capability set onto an embedded
//! librqbit session. librqbit exposes file-level selection and validated
//! streaming rather than raw per-piece priorities, so piece sets are
//! translated into byte ranges pulled through `FileStream` readers; a stream
//! position past a piece's end offset implies that piece is downloaded and
//! hash-checked.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session, SessionOptions,
};
use librqbit_core::lengths::Lengths;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::scan::{FileInfo, SwarmInfo};

use super::{PeerClient, PeerError, TorrentFileMeta, TorrentMeta, TransferTotals};

const STREAM_CHUNK: usize = 64 * 1024;

/// One byte range being pulled through a validated stream.
struct RangeFetch {
    file_index: usize,
    /// Offset relative to the start of the file.
    start: u64,
    /// Exclusive end offset relative to the start of the file.
    end: u64,
    /// Bytes consumed from `start` so far.
    read: Arc<AtomicU64>,
}

struct TorrentEntry {
    handle: Arc<ManagedTorrent>,
    meta: TorrentMeta,
    /// Byte offset of each file within the torrent, parallel to `meta.files`.
    offsets: Vec<u64>,
    ranges: Vec<RangeFetch>,
}

/// Embedded librqbit client scoped to a single data directory.
pub struct RqbitClient {
    session: Arc<Session>,
    data_dir: PathBuf,
    torrents: RwLock<HashMap<String, TorrentEntry>>,
}

impl RqbitClient {
    /// Creates a session writing under `data_dir`.
    ///
    /// The session never seeds: uploads are disabled and no persistence is
    /// configured, so torrent state dies with the session. Storage is
    /// librqbit's file-backed writer (no mmap), configured here at
    /// construction time.
    pub async fn new(data_dir: impl Into<PathBuf>) -> Result<Self, PeerError> {
        let data_dir = data_dir.into();

        if !data_dir.exists() {
            std::fs::create_dir_all(&data_dir).map_err(|e| {
                PeerError::Session(format!("create data dir {}: {e}", data_dir.display()))
            })?;
        }

        let opts = SessionOptions {
            disable_dht: false,
            disable_dht_persistence: true,
            disable_upload: true,
            persistence: None,
            ..Default::default()
        };

        info!(data_dir = %data_dir.display(), "initializing librqbit session");

        let session = Session::new_with_opts(data_dir.clone(), opts)
            .await
            .map_err(|e| PeerError::Session(format!("initialize session: {e:#}")))?;

        Ok(Self {
            session,
            data_dir,
            torrents: RwLock::new(HashMap::new()),
        })
    }

    /// Directory the session writes torrent data under.
    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    fn resolve_meta(handle: &Arc<ManagedTorrent>) -> Result<(TorrentMeta, Vec<u64>), PeerError> {
        let hash = handle.info_hash().as_string();
        let name = handle
            .name()
            .unwrap_or_else(|| format!("torrent-{}", &hash[..8.min(hash.len())]));

        let resolved = handle
            .with_metadata(|m| {
                let lengths = Lengths::from_torrent(&m.info)
                    .map_err(|e| PeerError::Session(format!("torrent lengths: {e:#}")))?;
                let piece_length = u64::from(lengths.default_piece_length());
                let num_pieces = lengths.total_pieces();

                let mut files = Vec::with_capacity(m.file_infos.len());
                let mut offsets = Vec::with_capacity(m.file_infos.len());
                for fi in m.file_infos.iter() {
                    let begin_piece = (fi.offset_in_torrent / piece_length) as u32;
                    let end_piece = if fi.len == 0 {
                        begin_piece
                    } else {
                        ((fi.offset_in_torrent + fi.len).div_ceil(piece_length)) as u32
                    };
                    files.push(TorrentFileMeta {
                        path: fi
                            .relative_filename
                            .to_string_lossy()
                            .replace('\\', "/"),
                        length: fi.len,
                        begin_piece,
                        end_piece,
                    });
                    offsets.push(fi.offset_in_torrent);
                }

                Ok::<_, PeerError>((
                    TorrentMeta {
                        name: name.clone(),
                        piece_length,
                        num_pieces,
                        files,
                    },
                    offsets,
                ))
            })
            .map_err(|e| PeerError::Session(format!("torrent metadata: {e:#}")))??;

        Ok(resolved)
    }

    /// Groups sorted piece indices into contiguous `[start, end)` runs.
    fn piece_runs(pieces: &[u32]) -> Vec<(u32, u32)> {
        let mut sorted: Vec<u32> = pieces.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut runs = Vec::new();
        let mut iter = sorted.into_iter();
        let Some(first) = iter.next() else {
            return runs;
        };
        let (mut start, mut end) = (first, first + 1);
        for p in iter {
            if p == end {
                end += 1;
            } else {
                runs.push((start, end));
                start = p;
                end = p + 1;
            }
        }
        runs.push((start, end));
        runs
    }

    fn spawn_range_reader(
        handle: Arc<ManagedTorrent>,
        file_index: usize,
        start: u64,
        end: u64,
        read: Arc<AtomicU64>,
    ) {
        tokio::spawn(async move {
            let mut stream = match handle.stream(file_index) {
                Ok(s) => s,
                Err(e) => {
                    warn!(file_index, "open torrent stream failed: {e:#}");
                    return;
                }
            };
            if let Err(e) = stream.seek(SeekFrom::Start(start)).await {
                warn!(file_index, start, "seek torrent stream failed: {e}");
                return;
            }

            let mut remaining = end - start;
            let mut buf = vec![0u8; STREAM_CHUNK];
            while remaining > 0 {
                let cap = buf.len().min(remaining as usize);
                match stream.read(&mut buf[..cap]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        read.fetch_add(n as u64, Ordering::Relaxed);
                        remaining -= n as u64;
                    }
                    Err(e) => {
                        debug!(file_index, "torrent stream read ended: {e}");
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PeerClient for RqbitClient {
    fn name(&self) -> &str {
        "librqbit"
    }

    async fn add_magnet(&self, magnet: &str, metadata_deadline: Duration) -> Result<(), PeerError> {
        let opts = AddTorrentOptions {
            overwrite: true,
            ..Default::default()
        };

        // add_torrent on a magnet resolves the info dictionary before
        // returning, so the metadata wait is the add itself.
        let add_future = self
            .session
            .add_torrent(AddTorrent::from_url(magnet), Some(opts));
        let response = tokio::time::timeout(metadata_deadline, add_future)
            .await
            .map_err(|_| PeerError::MetadataTimeout(metadata_deadline))?
            .map_err(|e| PeerError::Session(format!("add magnet: {e:#}")))?;

        let handle = match response {
            AddTorrentResponse::Added(_, handle) => handle,
            AddTorrentResponse::AlreadyManaged(_, handle) => {
                warn!(hash = %handle.info_hash().as_string(), "torrent already managed");
                handle
            }
            AddTorrentResponse::ListOnly(_) => {
                return Err(PeerError::Session(
                    "torrent was added in list-only mode".to_string(),
                ));
            }
        };

        let hash = handle.info_hash().as_string();
        let (meta, offsets) = Self::resolve_meta(&handle)?;

        debug!(
            hash = %hash,
            name = %meta.name,
            files = meta.files.len(),
            pieces = meta.num_pieces,
            "torrent metadata resolved"
        );

        self.torrents.write().await.insert(
            hash,
            TorrentEntry {
                handle,
                meta,
                offsets,
                ranges: Vec::new(),
            },
        );

        Ok(())
    }

    async fn metadata(&self, info_hash: &str) -> Result<TorrentMeta, PeerError> {
        self.torrents
            .read()
            .await
            .get(info_hash)
            .map(|e| e.meta.clone())
            .ok_or_else(|| PeerError::NotFound(info_hash.to_string()))
    }

    async fn prioritize_pieces(&self, info_hash: &str, pieces: &[u32]) -> Result<(), PeerError> {
        let mut torrents = self.torrents.write().await;
        let entry = torrents
            .get_mut(info_hash)
            .ok_or_else(|| PeerError::NotFound(info_hash.to_string()))?;

        let piece_len = entry.meta.piece_length;
        let runs = Self::piece_runs(pieces);

        // Restrict the session to the files the runs touch so nothing else
        // is requested from the swarm.
        let mut file_indices: HashSet<usize> = HashSet::new();
        for &(run_start, _) in &runs {
            if let Some(idx) = entry
                .meta
                .files
                .iter()
                .position(|f| f.begin_piece <= run_start && run_start < f.end_piece)
            {
                file_indices.insert(idx);
            }
        }
        self.session
            .update_only_files(&entry.handle, &file_indices)
            .await
            .map_err(|e| PeerError::Session(format!("select files: {e:#}")))?;

        for (run_start, run_end) in runs {
            let Some(file_index) = entry
                .meta
                .files
                .iter()
                .position(|f| f.begin_piece <= run_start && run_start < f.end_piece)
            else {
                continue;
            };
            let file = &entry.meta.files[file_index];
            let offset = entry.offsets[file_index];

            let global_start = u64::from(run_start) * piece_len;
            let global_end = u64::from(run_end) * piece_len;
            let start = global_start.saturating_sub(offset);
            let end = (global_end.saturating_sub(offset)).min(file.length);
            if start >= end {
                continue;
            }

            let already = entry
                .ranges
                .iter()
                .any(|r| r.file_index == file_index && r.start == start && r.end == end);
            if already {
                continue;
            }

            let read = Arc::new(AtomicU64::new(0));
            Self::spawn_range_reader(
                entry.handle.clone(),
                file_index,
                start,
                end,
                read.clone(),
            );
            entry.ranges.push(RangeFetch {
                file_index,
                start,
                end,
                read,
            });
        }

        Ok(())
    }

    async fn piece_complete(&self, info_hash: &str, index: u32) -> Result<bool, PeerError> {
        let torrents = self.torrents.read().await;
        let entry = torrents
            .get(info_hash)
            .ok_or_else(|| PeerError::NotFound(info_hash.to_string()))?;

        if entry.handle.stats().finished {
            return Ok(true);
        }

        let piece_len = entry.meta.piece_length;
        let piece_start = u64::from(index) * piece_len;
        let piece_end = piece_start + piece_len;

        for range in &entry.ranges {
            let offset = entry.offsets[range.file_index];
            let file_len = entry.meta.files[range.file_index].length;
            let rel_start = piece_start.saturating_sub(offset);
            let rel_end = (piece_end.saturating_sub(offset)).min(file_len);
            if rel_start >= rel_end {
                continue;
            }
            let consumed = range.read.load(Ordering::Relaxed);
            if range.start <= rel_start && rel_end <= range.start + consumed {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn transfer_totals(&self, info_hash: &str) -> TransferTotals {
        let torrents = self.torrents.read().await;
        match torrents.get(info_hash) {
            Some(entry) => {
                let stats = entry.handle.stats();
                TransferTotals {
                    downloaded: stats.progress_bytes,
                    uploaded: stats.uploaded_bytes,
                }
            }
            None => TransferTotals::default(),
        }
    }

    async fn swarm(&self, info_hash: &str) -> Option<SwarmInfo> {
        let torrents = self.torrents.read().await;
        let entry = torrents.get(info_hash)?;
        let stats = entry.handle.stats();

        let (active_peers, total_peers) = stats
            .live
            .as_ref()
            .map(|live| {
                let peers = &live.snapshot.peer_stats;
                (
                    peers.live as u32,
                    (peers.live + peers.queued + peers.connecting) as u32,
                )
            })
            .unwrap_or((0, 0));

        Some(SwarmInfo {
            active_peers,
            total_peers,
            // librqbit does not expose per-peer piece counts.
            seeds: 0,
            download_bytes_total: stats.progress_bytes,
            upload_bytes_total: stats.uploaded_bytes,
        })
    }

    async fn file_entries(&self, info_hash: &str) -> Vec<FileInfo> {
        let torrents = self.torrents.read().await;
        match torrents.get(info_hash) {
            Some(entry) => entry
                .meta
                .files
                .iter()
                .map(|f| FileInfo {
                    path: f.path.clone(),
                    size: f.length,
                    ext: f.ext(),
                    reason: None,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    async fn remove(&self, info_hash: &str, delete_files: bool) {
        let entry = self.torrents.write().await.remove(info_hash);
        let Some(entry) = entry else {
            return;
        };

        let id = entry.handle.id();
        if let Err(e) = self.session.delete(id.into(), delete_files).await {
            warn!(hash = %info_hash, "remove torrent: {e:#}");
        } else {
            debug!(hash = %info_hash, delete_files, "torrent removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_runs_groups_contiguous_indices() {
        let runs = RqbitClient::piece_runs(&[0, 1, 2, 3, 40, 41, 7]);
        assert_eq!(runs, vec![(0, 4), (7, 8), (40, 42)]);
    }

    #[test]
    fn test_piece_runs_deduplicates() {
        let runs = RqbitClient::piece_runs(&[5, 5, 6, 6]);
        assert_eq!(runs, vec![(5, 7)]);
    }

    #[test]
    fn test_piece_runs_empty() {
        assert!(RqbitClient::piece_runs(&[]).is_empty());
    }
}

//! Scratch-path resolution.
//!
//! After the planned pieces complete, the file physically exists somewhere
//! under the session's data directory, but the exact layout depends on the
//! backend: wrapped in the torrent name, flat, suffixed `.part` while
//! incomplete, or nested inside tracker wrapper directories. This module
//! enumerates the known layouts in a fixed order and falls back to a
//! recursive walk, retrying briefly because the backend may not have flushed
//! at the moment piece completion was observed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::fetcher::FetchError;

const RESOLVE_ATTEMPTS: u32 = 3;
const RESOLVE_BACKOFF: Duration = Duration::from_secs(1);

/// Locates the downloaded file on disk.
///
/// `file_path` is the path from torrent metadata (which for some torrents
/// already starts with the torrent name). Retries up to three times with a
/// one-second backoff; exhaustion yields [`FetchError::FileNotFound`] after
/// logging a two-level listing of the scratch directory.
pub async fn resolve_scratch_path(
    root: &Path,
    torrent_name: &str,
    file_path: &str,
) -> Result<PathBuf, FetchError> {
    for attempt in 0..RESOLVE_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(RESOLVE_BACKOFF).await;
        }
        if let Some(found) = try_resolve(root, torrent_name, file_path) {
            debug!(path = %found.display(), attempt, "scratch file resolved");
            return Ok(found);
        }
    }

    warn!(
        root = %root.display(),
        torrent_name,
        file_path,
        "downloaded file not found on disk"
    );
    log_directory_listing(root);

    Err(FetchError::FileNotFound {
        root: root.to_path_buf(),
    })
}

fn try_resolve(root: &Path, torrent_name: &str, file_path: &str) -> Option<PathBuf> {
    let basename = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.to_string());

    let mut bases: Vec<PathBuf> = Vec::new();

    // When the metadata path already carries the torrent name, the naive
    // <root>/<name>/<path> candidate double-nests; try the deduplicated
    // form first.
    if let Some(rel) = file_path.strip_prefix(&format!("{torrent_name}/")) {
        bases.push(root.join(torrent_name).join(rel));
    }

    bases.push(root.join(torrent_name).join(file_path));
    bases.push(root.join(file_path));
    bases.push(root.join(torrent_name).join(&basename));
    // Single-file torrents may be stored as <root>/<name> itself.
    bases.push(root.join(torrent_name));

    for base in bases {
        for candidate in [base.clone(), part_suffixed(&base)] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    // Wrapper directories inserted by some trackers defeat the static list;
    // walk the torrent directory, then the whole scratch root, matching on
    // basename.
    let part_name = format!("{basename}.part");
    for walk_root in [root.join(torrent_name), root.to_path_buf()] {
        if !walk_root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&walk_root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name == basename.as_str() || name == part_name.as_str() {
                return Some(entry.into_path());
            }
        }
    }

    None
}

fn part_suffixed(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".part");
    PathBuf::from(s)
}

/// Logs the scratch directory two levels deep to aid diagnosis of unknown
/// storage layouts.
fn log_directory_listing(root: &Path) {
    let Ok(entries) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "cannot list scratch root");
        return;
    };
    for entry in entries.flatten() {
        warn!("  {}", entry.path().display());
        if entry.path().is_dir() {
            if let Ok(nested) = std::fs::read_dir(entry.path()) {
                for inner in nested.flatten() {
                    warn!("    {}", inner.path().display());
                }
            }
        }
    }
}

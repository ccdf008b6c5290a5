//! Input normalization.
//!
//! Scan inputs may be raw info hashes, magnet links, `.torrent` files, or
//! directories of `.torrent` files. Everything funnels down to lowercase
//! 40-hex info hashes.

use std::path::Path;

use librqbit_core::magnet::Magnet;
use librqbit_core::torrent_metainfo::{torrent_from_bytes, TorrentMetaV1Owned};
use thiserror::Error;

/// Errors from input normalization.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("failed to read {path}: {reason}")]
    TorrentFileUnreadable { path: String, reason: String },

    #[error("not a valid info hash: {0:?}")]
    InvalidHash(String),

    #[error("no .torrent files found in {0}")]
    EmptyDirectory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Resolves one raw input into info hashes.
///
/// A directory yields one hash per contained `.torrent` file; every other
/// input form yields exactly one.
pub fn normalize_input(input: &str) -> Result<Vec<String>, InputError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }

    if input.starts_with("magnet:") {
        let magnet =
            Magnet::parse(input).map_err(|e| InputError::InvalidMagnet(e.to_string()))?;
        let hash = magnet
            .as_id20()
            .ok_or_else(|| InputError::InvalidMagnet("missing btih info hash".to_string()))?;
        return Ok(vec![hash.as_string()]);
    }

    let path = Path::new(input);
    if path.is_dir() {
        return hashes_from_torrent_dir(path);
    }
    if path.is_file() && input.to_lowercase().ends_with(".torrent") {
        return Ok(vec![hash_from_torrent_file(path)?]);
    }

    // Raw info hash: 40 hex chars.
    let lower = input.to_lowercase();
    if lower.len() == 40 && lower.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(vec![lower]);
    }

    Err(InputError::InvalidHash(input.to_string()))
}

fn hash_from_torrent_file(path: &Path) -> Result<String, InputError> {
    let bytes = std::fs::read(path)?;
    let torrent: TorrentMetaV1Owned =
        torrent_from_bytes(&bytes).map_err(|e| InputError::TorrentFileUnreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    Ok(torrent.info_hash.as_string())
}

fn hashes_from_torrent_dir(dir: &Path) -> Result<Vec<String>, InputError> {
    let mut hashes = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !name.ends_with(".torrent") {
            continue;
        }
        hashes.push(hash_from_torrent_file(&path)?);
    }

    if hashes.is_empty() {
        return Err(InputError::EmptyDirectory(dir.display().to_string()));
    }
    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_raw_hash_lowercased() {
        let upper = HASH.to_uppercase();
        assert_eq!(normalize_input(&upper).unwrap(), vec![HASH.to_string()]);
    }

    #[test]
    fn test_raw_hash_rejects_wrong_length() {
        assert!(matches!(
            normalize_input("abc123"),
            Err(InputError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_raw_hash_rejects_non_hex() {
        let bad = "z".repeat(40);
        assert!(matches!(
            normalize_input(&bad),
            Err(InputError::InvalidHash(_))
        ));
    }

    #[test]
    fn test_magnet_extracts_hash() {
        let magnet = format!("magnet:?xt=urn:btih:{HASH}&dn=Example");
        assert_eq!(normalize_input(&magnet).unwrap(), vec![HASH.to_string()]);
    }

    #[test]
    fn test_invalid_magnet_is_error() {
        assert!(matches!(
            normalize_input("magnet:?dn=nothing-here"),
            Err(InputError::InvalidMagnet(_))
        ));
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(normalize_input("   ").unwrap().is_empty());
    }

    #[test]
    fn test_empty_directory_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = normalize_input(tmp.path().to_str().unwrap());
        assert!(matches!(result, Err(InputError::EmptyDirectory(_))));
    }

    #[test]
    fn test_garbage_torrent_file_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("bad.torrent");
        std::fs::write(&path, b"not bencode").unwrap();

        let result = normalize_input(path.to_str().unwrap());
        assert!(matches!(
            result,
            Err(InputError::TorrentFileUnreadable { .. })
        ));
    }
}

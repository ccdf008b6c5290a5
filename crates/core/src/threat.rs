//! File-listing classification and threat detection.
//!
//! Torrents advertising media sometimes ship executables or droppers
//! alongside. Classification is keyed purely by lowercase extension plus a
//! double-extension filename check.

use std::path::Path;

use crate::scan::{FileInfo, TorrentFiles};

/// Direct executables and scripts.
fn dangerous_reason(ext: &str) -> Option<&'static str> {
    Some(match ext {
        ".exe" => "Windows executable",
        ".msi" => "Windows installer",
        ".bat" => "Windows batch script",
        ".cmd" => "Windows command script",
        ".com" => "DOS executable",
        ".scr" => "Windows screensaver (executable)",
        ".pif" => "Program Information File (executable)",
        ".lnk" => "Windows shortcut (can execute commands)",
        ".vbs" => "VBScript",
        ".vbe" => "Encoded VBScript",
        ".jse" => "Encoded JScript",
        ".wsf" => "Windows Script File",
        ".wsh" => "Windows Script Host settings",
        ".ps1" => "PowerShell script",
        ".psm1" => "PowerShell module",
        ".psd1" => "PowerShell data file",
        ".reg" => "Windows Registry file",
        ".inf" => "Setup Information file",
        ".cpl" => "Control Panel extension",
        ".hta" => "HTML Application (executable)",
        ".dll" => "Dynamic Link Library",
        ".sys" => "System driver file",
        ".drv" => "Device driver",
        ".ocx" => "ActiveX control",
        _ => return None,
    })
}

/// Containers that could hold executables.
fn warning_reason(ext: &str) -> Option<&'static str> {
    Some(match ext {
        ".zip" => "Archive (may contain executables)",
        ".rar" => "Archive (may contain executables)",
        ".7z" => "Archive (may contain executables)",
        ".cab" => "Windows Cabinet archive",
        ".iso" => "Disk image (may auto-run)",
        ".img" => "Disk image",
        ".dmg" => "macOS disk image",
        ".apk" => "Android package",
        ".deb" => "Debian package",
        ".rpm" => "RPM package",
        ".appimage" => "Linux AppImage",
        ".js" => "JavaScript file (review if unexpected)",
        _ => return None,
    })
}

const VIDEO_EXTS: [&str; 16] = [
    ".mkv", ".mp4", ".avi", ".m4v", ".wmv", ".ts", ".mov", ".flv", ".webm", ".mpg", ".mpeg",
    ".m2ts", ".vob", ".ogv", ".divx", ".3gp",
];

const AUDIO_EXTS: [&str; 15] = [
    ".mp3", ".flac", ".aac", ".ogg", ".wav", ".wma", ".m4a", ".opus", ".ac3", ".dts", ".eac3",
    ".mka", ".ape", ".alac", ".aiff",
];

const SUBTITLE_EXTS: [&str; 8] = [".srt", ".ass", ".ssa", ".sub", ".idx", ".sup", ".vtt", ".smi"];

const IMAGE_EXTS: [&str; 8] = [".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".tiff", ".ico"];

/// Safe non-media files commonly found in torrents.
const SAFE_EXTS: [&str; 16] = [
    ".nfo", ".txt", ".nzb", ".sfv", ".md5", ".sha1", ".sha256", ".log", ".cue", ".url", ".html",
    ".htm", ".pdf", ".md", ".rtf", ".xml",
];

fn in_set(set: &[&str], ext: &str) -> bool {
    set.contains(&ext)
}

/// Categorizes torrent files and derives an aggregate threat level.
pub fn analyze_files(files: &[FileInfo]) -> TorrentFiles {
    let mut tf = TorrentFiles {
        total: files.len(),
        total_size: 0,
        video_files: Vec::new(),
        audio_files: Vec::new(),
        sub_files: Vec::new(),
        image_files: Vec::new(),
        other_files: Vec::new(),
        suspicious: Vec::new(),
        threat_level: String::new(),
    };

    let mut has_dangerous = false;
    let mut has_warning = false;

    for file in files {
        tf.total_size += file.size;
        let ext = file.ext.to_lowercase();
        let mut file = file.clone();

        if let Some(reason) = dangerous_reason(&ext) {
            file.reason = Some(reason.to_string());
            tf.suspicious.push(file);
            has_dangerous = true;
            continue;
        }

        if let Some(reason) = warning_reason(&ext) {
            file.reason = Some(reason.to_string());
            tf.suspicious.push(file);
            has_warning = true;
            continue;
        }

        let basename = Path::new(&file.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if has_suspicious_pattern(&basename) {
            file.reason = Some("Suspicious filename pattern".to_string());
            tf.suspicious.push(file);
            has_dangerous = true;
            continue;
        }

        if in_set(&VIDEO_EXTS, &ext) {
            tf.video_files.push(file);
        } else if in_set(&AUDIO_EXTS, &ext) {
            tf.audio_files.push(file);
        } else if in_set(&SUBTITLE_EXTS, &ext) {
            tf.sub_files.push(file);
        } else if in_set(&IMAGE_EXTS, &ext) {
            tf.image_files.push(file);
        } else {
            tf.other_files.push(file);
        }
    }

    tf.threat_level = if has_dangerous {
        "dangerous"
    } else if has_warning {
        "warning"
    } else {
        "clean"
    }
    .to_string();

    tf
}

/// Flags filenames where a media extension is followed by a non-media one
/// (the "movie.mp4.xyz" dropper trick), and absurdly long names.
fn has_suspicious_pattern(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() >= 3 {
        let second_to_last = format!(".{}", parts[parts.len() - 2]);
        if in_set(&VIDEO_EXTS, &second_to_last) || in_set(&AUDIO_EXTS, &second_to_last) {
            let last = format!(".{}", parts[parts.len() - 1]);
            let known = in_set(&SAFE_EXTS, &last)
                || in_set(&VIDEO_EXTS, &last)
                || in_set(&AUDIO_EXTS, &last)
                || in_set(&SUBTITLE_EXTS, &last)
                || in_set(&IMAGE_EXTS, &last);
            if !known {
                return true;
            }
        }
    }

    name.len() > 255
}

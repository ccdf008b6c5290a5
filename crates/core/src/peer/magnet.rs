//! Magnet URI construction.

/// Public UDP trackers appended to every magnet so rare hashes still resolve
/// when DHT alone is slow.
pub const DEFAULT_TRACKERS: [&str; 5] = [
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://open.demonii.com:1337/announce",
    "udp://exodus.desync.com:6969/announce",
];

/// Builds a magnet URI for an info hash with the default tracker set.
pub fn build_magnet(info_hash: &str) -> String {
    let mut params = vec![format!("xt=urn:btih:{info_hash}")];
    for tracker in DEFAULT_TRACKERS {
        params.push(format!("tr={}", urlencoding::encode(tracker)));
    }
    format!("magnet:?{}", params.join("&"))
}

//! BitTorrent peer layer.
//!
//! The engine consumes the [`PeerClient`] capability set; [`RqbitClient`]
//! backs it with an embedded librqbit session.

mod magnet;
mod rqbit;
mod types;

pub use magnet::{build_magnet, DEFAULT_TRACKERS};
pub use rqbit::RqbitClient;
pub use types::*;

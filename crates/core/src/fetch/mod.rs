//! Partial-fetch machinery: piece planning, completion polling with stall
//! discipline, and scratch-path resolution.

mod fetcher;
mod plan;
mod resolver;

pub use fetcher::{await_pieces, FetchError, FetchTimeouts};
pub use plan::{
    is_mp4_family, is_video_ext, plan_pieces, select_target, PiecePlan, MP4_FAMILY,
    VIDEO_EXTENSIONS,
};
pub use resolver::resolve_scratch_path;

//! A Rust library implementing the core of an MPEG-DASH adaptive streaming client.
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP), also called MPEG-DASH, is a technology used for media streaming over the
//! web, for both on-demand and live/OTT TV services. The Media Presentation Description (MPD) is a
//! description of the resources (manifest or “playlist”) forming a streaming service, that a DASH
//! client uses to determine which assets to request in order to perform adaptive streaming of the
//! content.
//!
//! This library turns an MPD manifest plus a set of segmented media URLs into an ordered stream of
//! demultiplexed audio, video and text samples ready for a downstream decoder. It covers manifest
//! refresh for dynamic presentations, period/representation/segment bookkeeping, adaptive
//! representation selection driven by a bandwidth estimate, chunked fetching with cancellation,
//! per-track rolling sample queues, presentation-time alignment across tracks, seeking and
//! trick-play rate changes, and DRM session coordination against an external CDM.
//!
//! It deliberately does not decode or render media, and does not parse media containers itself:
//! container demuxers, the decoder and the renderer are external collaborators behind the
//! [`demux::SegmentDemuxer`], [`player::PlayerHost`] and [`upstream::DataSource`] traits.

#![forbid(unsafe_code)]

pub mod bandwidth;
pub mod chunk;
pub mod chunk_source;
pub mod demux;
pub mod driver;
pub mod drm;
pub mod evaluator;
pub mod holders;
pub mod manifest_fetcher;
pub mod mpd;
pub mod playback_rate;
pub mod player;
pub mod qoe;
pub mod sample_queue;
pub mod sample_source;
pub mod time_range;
pub mod upstream;
pub mod xml;

pub use crate::player::{DashPlayer, PlayerConfig, PlayerHost};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};


/// Errors produced by the streaming core. Recoverable conditions (a dropped chunk, a dropped
/// sample) are handled internally and logged; these are the errors that bubble out of the control
/// entry points.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DashError {
    #[error("parse error {0}")]
    Parsing(String),
    #[error("network error {0}")]
    Network(String),
    #[error("network timeout {0}")]
    NetworkTimeout(String),
    #[error("connection error {0}")]
    NetworkConnect(String),
    #[error("I/O error {1} ({0})")]
    Io(#[source] std::io::Error, String),
    /// A live manifest refresh left a gap between the old and new segment indexes: playback has
    /// slipped behind the live window and the track cannot proceed.
    #[error("behind live window")]
    BehindLiveWindow,
    #[error("chunk load failed: {0}")]
    ChunkLoad(String),
    #[error("DRM error {0}")]
    Drm(String),
    #[error("codecs not received within the startup window")]
    CodecTimeout,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Other(String),
}

/// Sentinel returned by duration queries when the duration is not (yet) known.
pub const DURATION_UNKNOWN_MS: i64 = -1;

/// A clock expressed as microseconds since the UNIX epoch. Injected so that live-window
/// arithmetic and refresh scheduling can be driven deterministically from tests.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> i64;
}

/// The wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_us(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            Err(_) => 0,
        }
    }
}

/// Shared handle to a clock.
pub type ClockRef = Arc<dyn Clock>;

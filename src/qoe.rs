//! Quality-of-experience reporting seam.
//!
//! Playback state changes and structured errors funnel through here on their way to the host.
//! The manager also keeps the last reported error so control entry points can surface it.

use parking_lot::Mutex;
use tracing::{error, info, warn};

/// Full internal error code space. The public API exposes the subset in
/// [`crate::player::PlaybackErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoErrorCode {
    MediaFetchError,
    MediaDrmError,
    MediaDecodeError,
    MediaUnknownError,
}

/// Coarse playback states reported by the consumer and forwarded to QoE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Buffering,
    Playing,
    Paused,
    Seeking,
}

#[derive(Debug, Clone)]
pub struct ReportedError {
    pub code: VideoErrorCode,
    pub details: String,
    pub is_fatal: bool,
}

/// Collects QoE signals. Reports are logged; fatal errors are retained for inspection by the
/// driver when deciding whether to end playback.
#[derive(Default)]
pub struct QoeManager {
    last_error: Mutex<Option<ReportedError>>,
    last_state: Mutex<Option<StreamState>>,
}

impl QoeManager {
    pub fn new() -> QoeManager {
        QoeManager::default()
    }

    pub fn report_state(&self, state: StreamState) {
        info!("Playback state {state:?}");
        *self.last_state.lock() = Some(state);
    }

    pub fn report_video_error(&self, code: VideoErrorCode, details: &str, is_fatal: bool) {
        if is_fatal {
            error!("Playback error {code:?}: {details} (fatal)");
        } else {
            warn!("Playback error {code:?}: {details}");
        }
        *self.last_error.lock() = Some(ReportedError {
            code,
            details: String::from(details),
            is_fatal,
        });
    }

    pub fn last_error(&self) -> Option<ReportedError> {
        self.last_error.lock().clone()
    }

    pub fn last_state(&self) -> Option<StreamState> {
        *self.last_state.lock()
    }
}

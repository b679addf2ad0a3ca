//! Bandwidth estimation from observed transfers.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::upstream::TransferListener;

/// Returned by [`BandwidthMeter::estimate_bps`] before any transfer has been observed.
pub const NO_ESTIMATE: i64 = -1;

/// Transfers shorter than this contribute no reliable timing signal and are folded into the
/// next sample instead of producing a wild estimate.
const MIN_ELAPSED_FOR_ESTIMATE: Duration = Duration::from_millis(10);

/// Smoothing factor for the exponentially weighted moving average; higher values favour the
/// accumulated history over the newest sample.
const EWMA_HISTORY_WEIGHT: f64 = 0.85;

type EstimateCallback = Box<dyn Fn(Duration, i64, i64) + Send + Sync>;

struct MeterState {
    estimate_bps: i64,
    pending_bytes: i64,
    pending_elapsed: Duration,
}

/// Accumulates `(bytes, elapsed)` transfer samples into a running bits-per-second estimate.
/// Data sources on any thread may record concurrently; each new estimate is delivered to the
/// registered callback.
pub struct BandwidthMeter {
    state: Mutex<MeterState>,
    callback: Mutex<Option<EstimateCallback>>,
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl BandwidthMeter {
    pub fn new() -> BandwidthMeter {
        BandwidthMeter {
            state: Mutex::new(MeterState {
                estimate_bps: NO_ESTIMATE,
                pending_bytes: 0,
                pending_elapsed: Duration::ZERO,
            }),
            callback: Mutex::new(None),
        }
    }

    /// Registers the callback receiving `(elapsed, bytes, estimate_bps)` after each estimate
    /// update.
    pub fn set_callback(&self, cb: EstimateCallback) {
        *self.callback.lock() = Some(cb);
    }

    pub fn estimate_bps(&self) -> i64 {
        self.state.lock().estimate_bps
    }
}

impl TransferListener for BandwidthMeter {
    fn on_transfer(&self, bytes: i64, elapsed: Duration) {
        if bytes <= 0 {
            return;
        }
        let (sample_bytes, sample_elapsed, estimate) = {
            let mut s = self.state.lock();
            s.pending_bytes += bytes;
            s.pending_elapsed += elapsed;
            if s.pending_elapsed < MIN_ELAPSED_FOR_ESTIMATE {
                return;
            }
            let sample_bytes = s.pending_bytes;
            let sample_elapsed = s.pending_elapsed;
            s.pending_bytes = 0;
            s.pending_elapsed = Duration::ZERO;
            let sample_bps =
                (sample_bytes as f64 * 8.0 / sample_elapsed.as_secs_f64()).round() as i64;
            s.estimate_bps = if s.estimate_bps == NO_ESTIMATE {
                sample_bps
            } else {
                (s.estimate_bps as f64 * EWMA_HISTORY_WEIGHT
                    + sample_bps as f64 * (1.0 - EWMA_HISTORY_WEIGHT)) as i64
            };
            (sample_bytes, sample_elapsed, s.estimate_bps)
        };
        trace!("Bandwidth sample {sample_bytes}B/{sample_elapsed:?} -> estimate {estimate}bps");
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(sample_elapsed, sample_bytes, estimate);
        }
    }
}

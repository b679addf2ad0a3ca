//! Adaptive bitrate policy: choosing a representation among the candidates of the selected
//! adaptation set.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::bandwidth::{BandwidthMeter, NO_ESTIMATE};
use crate::chunk::{MediaChunkMeta, Trigger};
use crate::mpd::Format;
use crate::playback_rate::PlaybackRate;

/// The evaluator's standing decision: which format to load next and how much of the already
/// buffered queue to keep. `queue_size` smaller than the current queue length instructs the
/// sample source to discard the tail.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub queue_size: usize,
    pub format: Option<Format>,
    pub trigger: Trigger,
}

impl Default for Evaluation {
    fn default() -> Self {
        Evaluation { queue_size: 0, format: None, trigger: Trigger::Initial }
    }
}

/// Picks the representation to fetch next. `formats` lists the candidates of the selected
/// period in manifest order; the previous decision arrives in `evaluation` and is updated in
/// place.
pub trait FormatEvaluator: Send {
    fn enable(&mut self) {}
    fn disable(&mut self) {}
    fn evaluate(
        &mut self,
        queue: &VecDeque<MediaChunkMeta>,
        playback_position_us: i64,
        formats: &[Format],
        evaluation: &mut Evaluation,
        playback_rate: PlaybackRate,
    );
}

/// Always selects the first candidate. Used for text tracks and in tests.
#[derive(Debug, Default)]
pub struct FixedEvaluator;

impl FormatEvaluator for FixedEvaluator {
    fn evaluate(
        &mut self,
        queue: &VecDeque<MediaChunkMeta>,
        _playback_position_us: i64,
        formats: &[Format],
        evaluation: &mut Evaluation,
        _playback_rate: PlaybackRate,
    ) {
        evaluation.queue_size = queue.len();
        if evaluation.format.is_none() {
            evaluation.trigger = Trigger::Initial;
        }
        evaluation.format = formats.first().cloned();
    }
}

/// Bitrate assumed before the bandwidth meter has produced an estimate.
const DEFAULT_STARTUP_BITRATE: i32 = 800_000;
/// Fraction of the estimated bandwidth considered safely sustainable.
const BANDWIDTH_FRACTION: f64 = 0.75;
/// Buffered media required before switching up, to damp oscillation.
const MIN_DURATION_FOR_QUALITY_INCREASE_US: i64 = 10_000_000;
/// Buffered media beyond which a switch down is deferred (the buffer will ride it out).
const MAX_DURATION_FOR_QUALITY_DECREASE_US: i64 = 25_000_000;
/// On a switch down, buffered media of the old representation kept before the pruned tail.
const MIN_DURATION_TO_RETAIN_AFTER_DISCARD_US: i64 = 25_000_000;

/// Selects the highest-bitrate representation sustainable under a conservative fraction of the
/// measured bandwidth, with hold-down windows against oscillation. On a switch down the
/// already-buffered tail of the old representation may be pruned so the new stream is reached
/// sooner.
pub struct AdaptiveEvaluator {
    meter: Arc<BandwidthMeter>,
    startup_bitrate: i32,
}

impl AdaptiveEvaluator {
    pub fn new(meter: Arc<BandwidthMeter>) -> AdaptiveEvaluator {
        AdaptiveEvaluator { meter, startup_bitrate: DEFAULT_STARTUP_BITRATE }
    }

    fn ideal_format(&self, formats: &[Format]) -> Option<Format> {
        let estimate = self.meter.estimate_bps();
        let usable = if estimate == NO_ESTIMATE {
            self.startup_bitrate as i64
        } else {
            (estimate as f64 * BANDWIDTH_FRACTION) as i64
        };
        formats
            .iter()
            .filter(|f| f.bitrate as i64 <= usable)
            .max_by_key(|f| f.bitrate)
            .or_else(|| formats.iter().min_by_key(|f| f.bitrate))
            .cloned()
    }
}

impl FormatEvaluator for AdaptiveEvaluator {
    fn evaluate(
        &mut self,
        queue: &VecDeque<MediaChunkMeta>,
        playback_position_us: i64,
        formats: &[Format],
        evaluation: &mut Evaluation,
        _playback_rate: PlaybackRate,
    ) {
        evaluation.queue_size = queue.len();
        let current = evaluation.format.clone();
        let Some(ideal) = self.ideal_format(formats) else {
            evaluation.format = None;
            return;
        };
        let buffered_us = queue
            .back()
            .map(|tail| tail.end_time_us - playback_position_us)
            .unwrap_or(0);

        let selected = match &current {
            None => ideal,
            Some(current_format) if *current_format == ideal => ideal,
            Some(current_format) => {
                let switching_up = ideal.bitrate > current_format.bitrate;
                if switching_up && buffered_us < MIN_DURATION_FOR_QUALITY_INCREASE_US {
                    // Not enough buffer to absorb a mistake; hold the current quality.
                    current_format.clone()
                } else if !switching_up && buffered_us >= MAX_DURATION_FOR_QUALITY_DECREASE_US {
                    // Plenty buffered; ride out the dip at the current quality.
                    current_format.clone()
                } else {
                    if !switching_up {
                        // Prune buffered tail of the old representation so playback reaches
                        // the lower bitrate sooner.
                        let retain_until =
                            playback_position_us + MIN_DURATION_TO_RETAIN_AFTER_DISCARD_US;
                        let keep = queue
                            .iter()
                            .position(|c| c.start_time_us >= retain_until)
                            .unwrap_or(queue.len());
                        // Always retain at least the chunk being played out.
                        evaluation.queue_size = keep.max(queue.len().min(1));
                    }
                    debug!(
                        "Adaptive switch {} -> {} ({}bps)",
                        current_format.id, ideal.id, ideal.bitrate
                    );
                    ideal
                }
            }
        };

        if evaluation.format.is_none() {
            evaluation.trigger = Trigger::Initial;
        } else if evaluation.format.as_ref() != Some(&selected) {
            evaluation.trigger = Trigger::Adaptive;
        }
        evaluation.format = Some(selected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::TransferListener;
    use std::time::Duration;

    fn formats() -> Vec<Format> {
        vec![
            Format::new("hi", "video/mp4", 3_000_000),
            Format::new("mid", "video/mp4", 1_500_000),
            Format::new("lo", "video/mp4", 400_000),
        ]
    }

    fn meta(format: &Format, start_us: i64, end_us: i64) -> MediaChunkMeta {
        MediaChunkMeta {
            parent_id: 0,
            format: format.clone(),
            start_time_us: start_us,
            end_time_us: end_us,
            chunk_index: 0,
            uri: String::from("seg"),
            first_sample_index: 0,
        }
    }

    #[test]
    fn fixed_always_picks_first() {
        let mut eval = Evaluation::default();
        FixedEvaluator.evaluate(
            &VecDeque::new(),
            0,
            &formats(),
            &mut eval,
            PlaybackRate::default(),
        );
        assert_eq!(eval.format.as_ref().map(|f| f.id.as_str()), Some("hi"));
    }

    #[test]
    fn adaptive_respects_bandwidth_fraction() {
        let meter = Arc::new(BandwidthMeter::new());
        // 2 Mbps measured; 0.75 * 2M = 1.5M allows "mid" but not "hi".
        meter.on_transfer(250_000, Duration::from_secs(1));
        let mut evaluator = AdaptiveEvaluator::new(meter);
        let mut eval = Evaluation::default();
        evaluator.evaluate(
            &VecDeque::new(),
            0,
            &formats(),
            &mut eval,
            PlaybackRate::default(),
        );
        assert_eq!(eval.format.as_ref().map(|f| f.id.as_str()), Some("mid"));
        assert_eq!(eval.trigger, Trigger::Initial);
    }

    #[test]
    fn adaptive_falls_back_to_lowest_when_starved() {
        let meter = Arc::new(BandwidthMeter::new());
        meter.on_transfer(1_000, Duration::from_secs(1)); // 8 kbps
        let mut evaluator = AdaptiveEvaluator::new(meter);
        let mut eval = Evaluation::default();
        evaluator.evaluate(
            &VecDeque::new(),
            0,
            &formats(),
            &mut eval,
            PlaybackRate::default(),
        );
        assert_eq!(eval.format.as_ref().map(|f| f.id.as_str()), Some("lo"));
    }

    #[test]
    fn upswitch_held_until_buffer_builds() {
        let meter = Arc::new(BandwidthMeter::new());
        meter.on_transfer(10_000_000, Duration::from_secs(1)); // 80 Mbps
        let mut evaluator = AdaptiveEvaluator::new(meter);
        let lo = &formats()[2];
        let mut eval = Evaluation {
            queue_size: 1,
            format: Some(lo.clone()),
            trigger: Trigger::Initial,
        };
        // Only 4s buffered: hold the current format.
        let queue = VecDeque::from([meta(lo, 0, 4_000_000)]);
        evaluator.evaluate(&queue, 0, &formats(), &mut eval, PlaybackRate::default());
        assert_eq!(eval.format.as_ref().map(|f| f.id.as_str()), Some("lo"));
        // 12s buffered: switch up.
        let queue = VecDeque::from([meta(lo, 0, 12_000_000)]);
        evaluator.evaluate(&queue, 0, &formats(), &mut eval, PlaybackRate::default());
        assert_eq!(eval.format.as_ref().map(|f| f.id.as_str()), Some("hi"));
        assert_eq!(eval.trigger, Trigger::Adaptive);
    }

    #[test]
    fn downswitch_prunes_buffered_tail() {
        let meter = Arc::new(BandwidthMeter::new());
        meter.on_transfer(25_000, Duration::from_secs(1)); // 200 kbps -> only "lo" fits
        let mut evaluator = AdaptiveEvaluator::new(meter);
        let hi = &formats()[0];
        let mut eval = Evaluation {
            queue_size: 3,
            format: Some(hi.clone()),
            trigger: Trigger::Initial,
        };
        // Three 10s chunks buffered but position at 8s keeps the buffer under the
        // ride-it-out threshold.
        let queue = VecDeque::from([
            meta(hi, 0, 10_000_000),
            meta(hi, 10_000_000, 20_000_000),
            meta(hi, 20_000_000, 30_000_000),
        ]);
        evaluator.evaluate(&queue, 8_000_000, &formats(), &mut eval, PlaybackRate::default());
        assert_eq!(eval.format.as_ref().map(|f| f.id.as_str()), Some("lo"));
        // Nothing starts at or after 8s + 25s, so the whole queue is retained.
        assert_eq!(eval.queue_size, 3);
    }
}

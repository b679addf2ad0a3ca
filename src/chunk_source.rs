//! Per-track chunk selection: turning a timeline position and the state of the chunk queue into
//! the next initialization or media chunk to fetch.
//!
//! All methods run on the driver task. The source tracks the manifest's periods through
//! [`PeriodHolder`]s, consults the format evaluator for representation choice, and latches a
//! fatal error when playback falls behind the live window.

use std::collections::{BTreeMap, VecDeque};
use std::collections::btree_map::Entry;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunk::{Chunk, InitializationChunk, MediaChunk, MediaChunkMeta, MediaPayload, Trigger};
use crate::demux::{DemuxerFactory, MediaFormat};
use crate::evaluator::{Evaluation, FormatEvaluator};
use crate::holders::{PeriodHolder, RepresentationHolder, TrackCriteria};
use crate::manifest_fetcher::ManifestFetcher;
use crate::mpd::{
    AdaptationType, Format, MediaPresentation, RangedUri, WrappingSegmentIndex,
};
use crate::playback_rate::PlaybackRate;
use crate::qoe::{QoeManager, VideoErrorCode};
use crate::time_range::{DynamicTimeRange, StaticTimeRange, TimeRange};
use crate::upstream::DataSpec;
use crate::{ClockRef, DashError};

/// What the source wants the track to do next.
pub enum ChunkOp {
    /// Nothing to fetch right now (waiting on a refresh, an error, or the live edge).
    None,
    /// Fetch this chunk.
    Chunk(Chunk),
    /// The stream is exhausted.
    EndOfStream,
}

/// The chunk decision plus the queue length the evaluator wants retained. A `queue_size`
/// smaller than the current queue instructs the caller to discard the tail before appending.
pub struct ChunkOperation {
    pub queue_size: usize,
    pub op: ChunkOp,
}

pub type RangeChangedCallback = Box<dyn Fn(&TimeRange) + Send>;

const REFRESH_FLOOR_MS: i64 = 5_000;

pub struct DashChunkSource {
    manifest_fetcher: Option<Arc<ManifestFetcher>>,
    current_manifest: Arc<MediaPresentation>,
    evaluator: Box<dyn FormatEvaluator>,
    adaptation_type: AdaptationType,
    demuxer_factory: Arc<dyn DemuxerFactory>,
    qoe: Option<Arc<QoeManager>>,
    clock: ClockRef,
    live_edge_latency_us: i64,
    live: bool,
    start_at_live_edge: bool,
    playback_rate: PlaybackRate,
    period_holders: BTreeMap<i32, PeriodHolder>,
    next_period_holder_index: i32,
    available_range: TimeRange,
    evaluation: Evaluation,
    last_chunk_was_initialization: bool,
    fatal_error: bool,
    track_enabled: bool,
    criteria: Option<TrackCriteria>,
    range_changed_cb: Option<RangeChangedCallback>,
    prepare_called: bool,
}

impl DashChunkSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest_fetcher: Option<Arc<ManifestFetcher>>,
        initial_manifest: Arc<MediaPresentation>,
        adaptation_type: AdaptationType,
        evaluator: Box<dyn FormatEvaluator>,
        demuxer_factory: Arc<dyn DemuxerFactory>,
        qoe: Option<Arc<QoeManager>>,
        clock: ClockRef,
        live_edge_latency_us: i64,
        start_at_live_edge: bool,
        playback_rate: PlaybackRate,
    ) -> DashChunkSource {
        let live = initial_manifest.dynamic;
        DashChunkSource {
            manifest_fetcher,
            current_manifest: initial_manifest,
            evaluator,
            adaptation_type,
            demuxer_factory,
            qoe,
            clock,
            live_edge_latency_us,
            live,
            start_at_live_edge,
            playback_rate,
            period_holders: BTreeMap::new(),
            next_period_holder_index: 0,
            available_range: TimeRange::Static(StaticTimeRange::default()),
            evaluation: Evaluation::default(),
            last_chunk_was_initialization: false,
            fatal_error: false,
            track_enabled: false,
            criteria: None,
            range_changed_cb: None,
            prepare_called: false,
        }
    }

    pub fn set_range_changed_callback(&mut self, cb: RangeChangedCallback) {
        self.range_changed_cb = Some(cb);
    }

    pub fn set_playback_rate(&mut self, rate: PlaybackRate) {
        self.playback_rate = rate;
    }

    pub fn content_type(&self) -> &'static str {
        self.adaptation_type.as_str()
    }

    pub fn prepare(&mut self) -> bool {
        if !self.prepare_called {
            self.prepare_called = true;
        }
        !self.fatal_error
    }

    pub fn can_continue_buffering(&self) -> bool {
        if self.fatal_error {
            return false;
        }
        match &self.manifest_fetcher {
            Some(fetcher) => fetcher.can_continue_buffering(),
            None => true,
        }
    }

    pub fn duration_us(&self) -> i64 {
        if self.live {
            0
        } else {
            self.current_manifest.duration_ms * 1_000
        }
    }

    pub fn available_range(&self) -> &TimeRange {
        &self.available_range
    }

    pub fn has_fatal_error(&self) -> bool {
        self.fatal_error
    }

    pub fn enable(&mut self, criteria: &TrackCriteria) {
        self.track_enabled = true;
        self.criteria = Some(criteria.clone());
        self.evaluator.enable();
        if let Some(fetcher) = self.manifest_fetcher.clone() {
            fetcher.enable();
            if let Some(manifest) = fetcher.current() {
                self.process_manifest(manifest);
                return;
            }
        }
        let manifest = Arc::clone(&self.current_manifest);
        self.process_manifest(manifest);
    }

    pub fn disable(&mut self) {
        debug_assert!(self.track_enabled);
        self.evaluator.disable();
        if let Some(fetcher) = &self.manifest_fetcher {
            fetcher.disable();
        }
        self.period_holders.clear();
        self.evaluation = Evaluation::default();
        self.available_range = TimeRange::Static(StaticTimeRange::default());
        self.fatal_error = false;
        self.track_enabled = false;
        self.criteria = None;
    }

    /// Called on every buffering tick: picks up refreshed manifests and re-arms the next
    /// refresh for dynamic presentations.
    pub fn continue_buffering(&mut self, _playback_position_us: i64) {
        let Some(fetcher) = self.manifest_fetcher.clone() else {
            return;
        };
        if !self.current_manifest.dynamic || self.fatal_error {
            return;
        }
        if let Some(manifest) = fetcher.current() {
            if !Arc::ptr_eq(&manifest, &self.current_manifest) {
                debug!("New manifest");
                self.process_manifest(manifest);
            }
        }

        // A zero minimum update period would have us refresh continuously; hold refreshes to a
        // floor instead, pending explicit in-stream signalling.
        let mut min_update_period_ms = self.current_manifest.min_update_period_ms;
        if min_update_period_ms <= 0 {
            min_update_period_ms = REFRESH_FLOOR_MS;
        }
        if self.clock.now_us() > fetcher.load_start_timestamp_us() + min_update_period_ms * 1_000 {
            fetcher.request_refresh();
        }
    }

    /// Snaps a seek target to the closer edge of the segment containing it. Targets outside all
    /// periods, before the containing period's start, or in periods without an index are
    /// returned unmodified; at the last segment the snap always rounds down.
    pub fn get_adjusted_seek(&self, target_position_us: i64) -> i64 {
        let Some(period_key) = self.find_period_key(target_position_us) else {
            warn!("Can't adjust seek, no period will produce media");
            return target_position_us;
        };
        let holder = &self.period_holders[&period_key];
        if target_position_us < holder.start_time_us {
            warn!(
                "Can't adjust seek ({target_position_us}) before the period start ({})",
                holder.start_time_us
            );
            return target_position_us;
        }
        let Some(index) = holder.arbitrary_segment_index() else {
            info!("Can't adjust seek ({target_position_us}): no segment index");
            return target_position_us;
        };

        let target_in_period = target_position_us - holder.start_time_us;
        let (segment_num, last_segment_num) = match holder.available_end_time_us {
            Some(end_us) => (
                index.segment_num(target_in_period, end_us),
                index.last_segment_num(end_us),
            ),
            None => {
                // Unbounded index: we cannot know the next boundary, so pretend the target's
                // segment is the last and round down.
                let n = index.segment_num(target_in_period, target_in_period + 1);
                (n, n)
            }
        };

        let segment_start = index.time_us(segment_num);
        if segment_num == last_segment_num {
            return holder.start_time_us + segment_start;
        }
        let next_segment_start = index.time_us(segment_num + 1);
        let adjusted = if target_in_period - segment_start > next_segment_start - target_in_period {
            next_segment_start
        } else {
            segment_start
        };
        holder.start_time_us + adjusted
    }

    pub fn get_chunk_operation(
        &mut self,
        queue: &VecDeque<MediaChunkMeta>,
        playback_position_us: i64,
    ) -> ChunkOperation {
        if self.fatal_error {
            return ChunkOperation { queue_size: queue.len(), op: ChunkOp::None };
        }
        if self.period_holders.is_empty() {
            return ChunkOperation { queue_size: queue.len(), op: ChunkOp::None };
        }

        let dynamic = self.current_manifest.dynamic;
        let bounds = self.available_range.current_bounds();
        let mut position = playback_position_us;
        let starting_new_period: bool;
        let period_key: i32;

        if queue.is_empty() {
            if self.live {
                if position != 0 {
                    // A non-zero position means the client knows where it's seeking.
                    self.start_at_live_edge = false;
                }
                if self.start_at_live_edge {
                    position = bounds.0.max(bounds.1 - self.live_edge_latency_us);
                } else {
                    // The upper bound is exclusive.
                    position = position.min(bounds.1 - 1).max(bounds.0);
                }
            }
            match self.find_period_key(position) {
                Some(key) => period_key = key,
                None => {
                    let op = if dynamic { ChunkOp::None } else { ChunkOp::EndOfStream };
                    return ChunkOperation { queue_size: queue.len(), op };
                }
            }
            starting_new_period = true;
        } else {
            if self.start_at_live_edge {
                // The player is consuming chunks now; let the user seek freely.
                self.start_at_live_edge = false;
            }

            let previous = queue.back().expect("non-empty queue");
            let next_segment_start_us = previous.end_time_us;
            if self.live && next_segment_start_us < bounds.0 {
                self.fatal_error = true;
                self.report_behind_live_window();
                return ChunkOperation { queue_size: queue.len(), op: ChunkOp::None };
            }
            if dynamic && next_segment_start_us >= bounds.1 {
                // Beyond the manifest's last chunk; wait for a refresh.
                return ChunkOperation { queue_size: queue.len(), op: ChunkOp::None };
            }

            // A period's duration is the maximum over its representations, so the available
            // range may not line up exactly with real content. Double-check against the last
            // period's index before declaring the stream finished.
            if let Some((_, last_holder)) = self.period_holders.iter().next_back() {
                if previous.parent_id == last_holder.local_index {
                    if let Some(rh) = last_holder.representation_holder(&previous.format.id) {
                        let fell_off_end = if self.playback_rate.is_forward() {
                            rh.is_beyond_last_segment(previous.next_chunk_index())
                        } else {
                            rh.is_before_first_segment(previous.prev_chunk_index())
                        };
                        if fell_off_end {
                            // Don't trip end-of-stream while tricking.
                            let op = if !dynamic && self.playback_rate.is_normal() {
                                ChunkOp::EndOfStream
                            } else {
                                ChunkOp::None
                            };
                            return ChunkOperation { queue_size: queue.len(), op };
                        }
                    }
                }
            }

            match self.step_period(previous) {
                PeriodStep::Stay(key) => {
                    period_key = key;
                    starting_new_period = false;
                }
                PeriodStep::Moved(key) => {
                    period_key = key;
                    starting_new_period = true;
                }
                PeriodStep::EndOfStream => {
                    return ChunkOperation { queue_size: queue.len(), op: ChunkOp::EndOfStream };
                }
                PeriodStep::Wait => {
                    return ChunkOperation { queue_size: queue.len(), op: ChunkOp::None };
                }
            }
        }

        self.evaluation.queue_size = queue.len();
        if self.evaluation.format.is_none() || !self.last_chunk_was_initialization {
            let formats = self.period_holders[&period_key].formats();
            self.evaluator.evaluate(
                queue,
                position,
                &formats,
                &mut self.evaluation,
                self.playback_rate,
            );
        }
        let mut selected = match self.evaluation.format.clone() {
            Some(f) => f,
            None => {
                return ChunkOperation { queue_size: self.evaluation.queue_size, op: ChunkOp::None }
            }
        };
        if self.period_holders[&period_key].representation_holder(&selected.id).is_none() {
            // The standing decision refers to a representation of another period; re-evaluate
            // against this period's candidates.
            self.evaluation.format = None;
            let formats = self.period_holders[&period_key].formats();
            self.evaluator.evaluate(
                queue,
                position,
                &formats,
                &mut self.evaluation,
                self.playback_rate,
            );
            selected = match self.evaluation.format.clone() {
                Some(f) if self.period_holders[&period_key]
                    .representation_holder(&f.id)
                    .is_some() => f,
                _ => {
                    return ChunkOperation {
                        queue_size: self.evaluation.queue_size,
                        op: ChunkOp::None,
                    }
                }
            };
        }

        let period_holder = &self.period_holders[&period_key];
        let representation_holder = period_holder
            .representation_holder(&selected.id)
            .expect("selected representation present");

        let mut pending_initialization_uri: Option<RangedUri> = None;
        let mut pending_index_uri: Option<RangedUri> = None;
        if representation_holder.media_format.is_none() {
            pending_initialization_uri = representation_holder.representation.initialization_uri();
        }
        if representation_holder.segment_index().is_none() {
            pending_index_uri = representation_holder.representation.index_uri();
        }
        if pending_initialization_uri.is_some() || pending_index_uri.is_some() {
            let chunk = new_initialization_chunk(
                pending_initialization_uri,
                pending_index_uri,
                representation_holder,
                period_holder.local_index,
                self.evaluation.trigger,
            );
            self.last_chunk_was_initialization = true;
            return ChunkOperation {
                queue_size: self.evaluation.queue_size,
                op: ChunkOp::Chunk(chunk),
            };
        }
        if representation_holder.segment_index().is_none() {
            // No index in the manifest and nowhere to fetch one from.
            return ChunkOperation { queue_size: self.evaluation.queue_size, op: ChunkOp::None };
        }

        // The evaluator may have trimmed the queue; the effective tail is the last retained
        // chunk, which the caller discards down to before starting this load.
        let tail = queue
            .iter()
            .take(self.evaluation.queue_size.min(queue.len()))
            .next_back();
        let segment_num = match tail {
            None => representation_holder.segment_num(position),
            Some(_) if starting_new_period => representation_holder.first_available_segment_num(),
            Some(tail) if self.playback_rate.is_forward() => Some(tail.next_chunk_index()),
            Some(tail) => Some(tail.prev_chunk_index()),
        };
        let Some(segment_num) = segment_num else {
            return ChunkOperation { queue_size: self.evaluation.queue_size, op: ChunkOp::None };
        };

        let Some(chunk) = new_media_chunk(
            period_holder,
            representation_holder,
            self.adaptation_type,
            segment_num,
            self.evaluation.trigger,
        ) else {
            return ChunkOperation { queue_size: self.evaluation.queue_size, op: ChunkOp::None };
        };
        self.last_chunk_was_initialization = false;
        ChunkOperation {
            queue_size: self.evaluation.queue_size,
            op: ChunkOp::Chunk(Chunk::Media(chunk)),
        }
    }

    /// Copies an initialization chunk's side products into the holders: the media format, the
    /// segment index (only when the manifest did not supply one) and the DRM init data (only
    /// when the period had none, per DASH-IF IOP 7.5.3).
    pub fn on_chunk_load_completed(&mut self, chunk: &Chunk) {
        let Chunk::Init(init) = chunk else {
            return;
        };
        let Some(period_holder) = self.period_holders.get_mut(&init.parent_id) else {
            // The period for this chunk may no longer be on the manifest.
            return;
        };
        {
            let Some(representation_holder) =
                period_holder.representation_holder_mut(&init.format.id)
            else {
                return;
            };
            if let Some(format) = &init.media_format {
                representation_holder.give_media_format(format.clone());
            }
            if representation_holder.segment_index().is_none() {
                if let Some(seek_map) = &init.seek_map {
                    representation_holder.give_segment_index(Arc::new(
                        WrappingSegmentIndex::new(seek_map.clone(), &init.data_spec.uri),
                    ));
                }
            }
        }
        if period_holder.drm_init_data.is_none() {
            if let Some(drm_init_data) = &init.drm_init_data {
                period_holder.set_drm_init_data(Arc::clone(drm_init_data));
            }
        }
    }

    pub fn on_chunk_load_error(&mut self, _chunk: &Chunk, error: &DashError) {
        warn!("Chunk load error: {error}");
        if let Some(qoe) = &self.qoe {
            qoe.report_video_error(VideoErrorCode::MediaFetchError, "ChunkLoadError", false);
        }
    }

    fn report_behind_live_window(&self) {
        warn!("BehindLiveWindow");
        if let Some(qoe) = &self.qoe {
            qoe.report_video_error(VideoErrorCode::MediaFetchError, "BehindLiveWindow", false);
        }
    }

    /// First period able to produce media at or after `position`: positions before the first
    /// period resolve to the first period with representations.
    fn find_period_key(&self, position_us: i64) -> Option<i32> {
        let (first_key, first_holder) = self.period_holders.iter().next()?;
        if position_us < first_holder.available_start_time_us
            && first_holder.num_representation_holders() > 0
        {
            return Some(*first_key);
        }
        for (key, holder) in &self.period_holders {
            let end = holder.available_end_time_us.unwrap_or(i64::MAX);
            if position_us < end && holder.num_representation_holders() > 0 {
                return Some(*key);
            }
        }
        None
    }

    fn step_period(&self, previous: &MediaChunkMeta) -> PeriodStep {
        let prev_key = previous.parent_id;
        let Some(holder) = self.period_holders.get(&prev_key) else {
            // The previous chunk's period left the manifest; restart from the first remaining
            // period (the segment number cannot carry over).
            return match self.period_holders.keys().next() {
                Some(key) => PeriodStep::Moved(*key),
                None => PeriodStep::Wait,
            };
        };
        if holder.index_is_unbounded {
            return PeriodStep::Stay(prev_key);
        }
        let Some(rh) = holder.representation_holder(&previous.format.id) else {
            return PeriodStep::Stay(prev_key);
        };
        if self.playback_rate.is_forward() && rh.is_beyond_last_segment(previous.next_chunk_index())
        {
            // Step forward, skipping periods with no representations for this track.
            for (key, candidate) in self.period_holders.range(prev_key + 1..) {
                if candidate.num_representation_holders() > 0 {
                    return PeriodStep::Moved(*key);
                }
            }
            if self.current_manifest.dynamic {
                PeriodStep::Wait
            } else {
                PeriodStep::EndOfStream
            }
        } else if !self.playback_rate.is_forward()
            && rh.is_before_first_segment(previous.prev_chunk_index())
        {
            for (key, candidate) in self.period_holders.range(..prev_key).rev() {
                if candidate.num_representation_holders() > 0 {
                    return PeriodStep::Moved(*key);
                }
            }
            PeriodStep::Wait
        } else {
            PeriodStep::Stay(prev_key)
        }
    }

    fn process_manifest(&mut self, manifest: Arc<MediaPresentation>) {
        if manifest.period_count() == 0 {
            warn!("Ignoring manifest with no periods");
            return;
        }
        // Evict leading periods that fell out of the manifest.
        let first_period_start_ms = manifest.period(0).start_ms;
        loop {
            let evict = match self.period_holders.iter().next() {
                Some((&key, holder)) if holder.start_time_us / 1_000 < first_period_start_ms => {
                    Some(key)
                }
                _ => None,
            };
            match evict {
                Some(key) => {
                    self.period_holders.remove(&key);
                }
                None => break,
            }
        }

        // After discarding old periods we should never hold more periods than the manifest
        // lists; a manifest server that is out of sync and behind can violate this. Discard
        // such a manifest and try again later.
        if self.period_holders.len() > manifest.period_count() {
            warn!("Discarding out-of-sync manifest: fewer periods than currently held");
            return;
        }

        // Update existing periods. Only the first and last can change.
        let criteria = self.criteria.clone().unwrap_or_else(|| TrackCriteria::new("*"));
        let holder_count = self.period_holders.len();
        if holder_count > 0 {
            let first_key = *self.period_holders.keys().next().expect("non-empty holders");
            if let Some(holder) = self.period_holders.get_mut(&first_key) {
                if holder.update_period(&manifest, 0, &criteria).is_err() {
                    self.fatal_error = true;
                    self.report_behind_live_window();
                    return;
                }
            }
            if holder_count > 1 {
                let last_key = *self.period_holders.keys().next_back().expect("non-empty holders");
                let last_index = holder_count - 1;
                if let Some(holder) = self.period_holders.get_mut(&last_key) {
                    if holder.update_period(&manifest, last_index, &criteria).is_err() {
                        self.fatal_error = true;
                        self.report_behind_live_window();
                        return;
                    }
                }
            }
        }

        // Add new periods.
        for manifest_index in self.period_holders.len()..manifest.period_count() {
            let local_index = self.next_period_holder_index;
            let holder = PeriodHolder::new(
                local_index,
                &manifest,
                manifest_index,
                &criteria,
                self.playback_rate,
                self.demuxer_factory.as_ref(),
            );
            match self.period_holders.entry(local_index) {
                Entry::Vacant(entry) => {
                    entry.insert(holder);
                }
                Entry::Occupied(_) => unreachable!("period holder indices are unique"),
            }
            self.next_period_holder_index += 1;
        }

        self.current_manifest = manifest;
        let new_range = self.compute_available_range();
        let changed = {
            let old = self.available_range.current_bounds();
            let new = new_range.current_bounds();
            old != new || self.available_range.is_static() != new_range.is_static()
        };
        self.available_range = new_range;
        if changed {
            if let Some(cb) = &self.range_changed_cb {
                cb(&self.available_range);
            } else {
                debug!("Available range changed; no callback");
            }
        }
    }

    fn compute_available_range(&self) -> TimeRange {
        let first = self.period_holders.values().next();
        let last = self.period_holders.values().next_back();
        let (Some(first), Some(last)) = (first, last) else {
            return TimeRange::Static(StaticTimeRange::default());
        };

        if !self.current_manifest.dynamic || last.index_is_explicit {
            return TimeRange::Static(StaticTimeRange::new(
                first.available_start_time_us,
                last.available_end_time_us.unwrap_or(first.available_start_time_us),
            ));
        }

        let min_start_us = first.available_start_time_us;
        let max_end_us = last.available_end_time_us.unwrap_or(i64::MAX);
        let time_at_zero_us = self.current_manifest.availability_start_time_ms * 1_000;
        let buffer_depth_us = if self.current_manifest.time_shift_buffer_depth_ms == -1 {
            0
        } else {
            self.current_manifest.time_shift_buffer_depth_ms * 1_000
        };
        TimeRange::Dynamic(DynamicTimeRange::new(
            min_start_us,
            max_end_us,
            time_at_zero_us,
            buffer_depth_us,
            Arc::clone(&self.clock),
        ))
    }
}

enum PeriodStep {
    Stay(i32),
    Moved(i32),
    EndOfStream,
    Wait,
}

fn is_raw_text_mime(mime_type: &str) -> bool {
    mime_type.starts_with("text/vtt") || mime_type.starts_with("application/ttml+xml")
}

/// Derives the decoder-facing mime type for a manifest format, mapping MP4-boxed text codecs
/// onto their media mime types.
pub fn media_mime_type(format: &Format) -> String {
    if format.mime_type == "application/mp4" {
        if format.codecs == "stpp" {
            return String::from("application/ttml+xml");
        }
        if format.codecs == "wvtt" {
            return String::from("application/x-mp4vtt");
        }
    }
    format.mime_type.clone()
}

/// The media format for a track as derivable from the manifest alone, used for raw text chunks
/// that never pass through a demuxer.
pub fn track_media_format(
    adaptation_type: AdaptationType,
    format: &Format,
    duration_us: i64,
) -> MediaFormat {
    let mime = media_mime_type(format);
    match adaptation_type {
        AdaptationType::Video => MediaFormat::video(
            &format.id,
            &mime,
            &format.codecs,
            format.bitrate,
            duration_us,
            format.width,
            format.height,
        ),
        AdaptationType::Audio => MediaFormat::audio(
            &format.id,
            &mime,
            &format.codecs,
            format.bitrate,
            duration_us,
            format.audio_channels,
            format.audio_sampling_rate,
            &format.language,
        ),
        AdaptationType::Text => MediaFormat::text(
            &format.id,
            &mime,
            format.bitrate,
            duration_us,
            &format.language,
        ),
    }
}

/// Builds the initialization/index fetch for a representation, merging the two ranges into one
/// request when they are adjacent in the same resource.
fn new_initialization_chunk(
    initialization_uri: Option<RangedUri>,
    index_uri: Option<RangedUri>,
    representation_holder: &RepresentationHolder,
    parent_id: i32,
    trigger: Trigger,
) -> Chunk {
    let request_uri = match (&initialization_uri, &index_uri) {
        (Some(init), Some(index)) => {
            // Initialization and index data are commonly adjacent; fetch both at once when
            // possible.
            init.attempt_merge(index).unwrap_or_else(|| init.clone())
        }
        (Some(init), None) => init.clone(),
        (None, Some(index)) => index.clone(),
        (None, None) => unreachable!("initialization chunk with nothing to fetch"),
    };
    let representation = &representation_holder.representation;
    let data_spec = DataSpec::new(
        &request_uri.uri_string(),
        request_uri.start,
        request_uri.length,
        Some(&representation.cache_key),
    );
    Chunk::Init(InitializationChunk::new(
        data_spec,
        trigger,
        representation.format.clone(),
        Arc::clone(&representation_holder.demuxer),
        parent_id,
    ))
}

fn new_media_chunk(
    period_holder: &PeriodHolder,
    representation_holder: &RepresentationHolder,
    adaptation_type: AdaptationType,
    segment_num: i32,
    trigger: Trigger,
) -> Option<MediaChunk> {
    let representation = &representation_holder.representation;
    let start_time_us = representation_holder.segment_start_time_us(segment_num)?;
    let end_time_us = representation_holder.segment_end_time_us(segment_num)?;
    let segment_uri = representation_holder.segment_uri(segment_num)?;
    let data_spec = DataSpec::new(
        &segment_uri.uri_string(),
        segment_uri.start,
        segment_uri.length,
        Some(&representation.cache_key),
    );
    let sample_offset_us =
        period_holder.start_time_us - representation.presentation_time_offset_us;

    if is_raw_text_mime(&representation.format.mime_type) {
        let media_format = track_media_format(
            adaptation_type,
            &representation.format,
            end_time_us - start_time_us,
        );
        Some(MediaChunk::new(
            data_spec,
            Trigger::Initial,
            representation.format.clone(),
            start_time_us,
            end_time_us,
            segment_num,
            sample_offset_us,
            MediaPayload::SingleSample,
            Some(media_format),
            None,
            true,
            period_holder.local_index,
        ))
    } else {
        let media_format = representation_holder.media_format.clone();
        let is_media_format_final = media_format.is_some();
        Some(MediaChunk::new(
            data_spec,
            trigger,
            representation.format.clone(),
            start_time_us,
            end_time_us,
            segment_num,
            sample_offset_us,
            MediaPayload::Container(Arc::clone(&representation_holder.demuxer)),
            media_format,
            period_holder.drm_init_data.clone(),
            is_media_format_final,
            period_holder.local_index,
        ))
    }
}

//! Per-track sample source: owns the chunk source, the loader and the rolling sample queue,
//! and exposes the read side the pull thread consumes.
//!
//! Buffering control (`continue_buffering`, seeks, enable/disable) runs on the driver task;
//! the [`TrackStream`] handle is shared with the consumer thread and is safe to read from
//! there. Load completions come back through the event sink as [`SourceEvent`]s, which the
//! driver routes into [`ChunkSampleSource::on_load_done`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, Loader, LoadOutcome, MediaChunkMeta};
use crate::chunk_source::{ChunkOp, DashChunkSource};
use crate::demux::MediaFormat;
use crate::drm::DrmInitData;
use crate::holders::TrackCriteria;
use crate::playback_rate::PlaybackRate;
use crate::sample_queue::{RollingSampleQueue, SampleHolder};
use crate::upstream::DataSourceFactory;

/// Outcome of one `read_data` call on a track stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    /// A new media format was delivered; no sample was read.
    FormatRead,
    /// A sample was copied into the holder.
    SampleRead,
    /// Nothing available yet.
    NothingRead,
    /// The track is exhausted.
    EndOfStream,
}

/// Events a sample source emits from background tasks; the driver feeds them back in on its
/// own task.
pub enum SourceEvent {
    LoadDone { generation: u64, chunk: Box<Chunk>, outcome: LoadOutcome },
    /// A demuxer announced the track's media format mid-load (early codec information).
    UpstreamFormat(MediaFormat),
}

pub type SourceEventSink = Arc<dyn Fn(SourceEvent) + Send + Sync>;

#[derive(Default)]
struct StreamShared {
    /// Format awaiting delivery to the consumer; delivered before any sample that uses it.
    pending_format: Option<MediaFormat>,
    /// Pending seek boundary, consumed by `read_discontinuity`.
    discontinuity_us: Option<i64>,
    eos: bool,
    /// Init data covering the samples currently flowing, for license checks on encrypted
    /// samples.
    drm_init_data: Option<Arc<DrmInitData>>,
}

/// The consumer-facing half of a track: the rolling sample queue plus delivery state. Shared
/// between the driver task and the host pull thread.
pub struct TrackStream {
    queue: Arc<RollingSampleQueue>,
    shared: Mutex<StreamShared>,
}

impl TrackStream {
    pub(crate) fn new(queue: Arc<RollingSampleQueue>) -> Arc<TrackStream> {
        Arc::new(TrackStream { queue, shared: Mutex::new(StreamShared::default()) })
    }

    /// Takes the pending seek boundary, if one is waiting.
    pub fn read_discontinuity(&self) -> Option<i64> {
        self.shared.lock().discontinuity_us.take()
    }

    /// Non-blocking read: a pending format wins over samples, end-of-stream only reports once
    /// the queue has drained.
    pub fn read_data(
        &self,
        format_holder: &mut Option<MediaFormat>,
        sample_holder: &mut SampleHolder,
    ) -> ReadResult {
        {
            let mut shared = self.shared.lock();
            if let Some(format) = shared.pending_format.take() {
                *format_holder = Some(format);
                return ReadResult::FormatRead;
            }
            if shared.discontinuity_us.is_some() {
                return ReadResult::NothingRead;
            }
        }
        if self.queue.peek_sample(sample_holder) {
            return ReadResult::SampleRead;
        }
        if self.shared.lock().eos {
            ReadResult::EndOfStream
        } else {
            ReadResult::NothingRead
        }
    }

    /// Advances past the sample most recently peeked.
    pub fn advance(&self) {
        self.queue.move_to_next_sample();
    }

    pub fn drm_init_data(&self) -> Option<Arc<DrmInitData>> {
        self.shared.lock().drm_init_data.clone()
    }

    pub fn queue(&self) -> &RollingSampleQueue {
        &self.queue
    }
}

/// Driver-side track pipeline: chunk source + loader + sample queue + the buffer governor.
pub struct ChunkSampleSource {
    pub chunk_source: DashChunkSource,
    queue: Arc<RollingSampleQueue>,
    stream: Arc<TrackStream>,
    loader: Loader,
    data_source_factory: Arc<dyn DataSourceFactory>,
    events: SourceEventSink,
    media_chunks: VecDeque<MediaChunkMeta>,
    buffer_bytes_budget: usize,
    playback_rate: PlaybackRate,
    enabled: bool,
    loading_finished: bool,
    downstream_position_us: i64,
    last_announced_format: Option<MediaFormat>,
    /// Bumped on seek/disable/discard so stale load completions are ignored.
    load_generation: u64,
}

impl ChunkSampleSource {
    pub fn new(
        chunk_source: DashChunkSource,
        data_source_factory: Arc<dyn DataSourceFactory>,
        events: SourceEventSink,
        buffer_bytes_budget: usize,
        runtime: tokio::runtime::Handle,
    ) -> ChunkSampleSource {
        let queue = Arc::new(RollingSampleQueue::new());
        let stream = TrackStream::new(Arc::clone(&queue));
        ChunkSampleSource {
            chunk_source,
            queue,
            stream,
            loader: Loader::new(runtime),
            data_source_factory,
            events,
            media_chunks: VecDeque::new(),
            buffer_bytes_budget,
            playback_rate: PlaybackRate::default(),
            enabled: false,
            loading_finished: false,
            downstream_position_us: 0,
            last_announced_format: None,
            load_generation: 0,
        }
    }

    pub fn stream(&self) -> Arc<TrackStream> {
        Arc::clone(&self.stream)
    }

    pub fn prepare(&mut self, _position_us: i64) -> bool {
        self.chunk_source.prepare()
    }

    pub fn enable(&mut self, criteria: &TrackCriteria, position_us: i64, rate: PlaybackRate) {
        debug_assert!(!self.enabled);
        self.enabled = true;
        self.playback_rate = rate;
        self.chunk_source.set_playback_rate(rate);
        self.chunk_source.enable(criteria);
        self.restart_from(position_us);
    }

    /// Disables the track. Any in-flight load is canceled; its completion event is ignored
    /// once it arrives.
    pub fn disable(&mut self) {
        debug_assert!(self.enabled);
        self.enabled = false;
        self.load_generation += 1;
        self.loader.cancel_loading();
        self.loader.done_loading();
        self.chunk_source.disable();
        self.media_chunks.clear();
        self.queue.clear();
        self.last_announced_format = None;
        let mut shared = self.stream.shared.lock();
        shared.pending_format = None;
        shared.discontinuity_us = None;
        shared.eos = false;
        shared.drm_init_data = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn duration_us(&self) -> i64 {
        self.chunk_source.duration_us()
    }

    /// One buffering tick. Returns true when the consumer has something to chew on: samples
    /// are queued or the stream has ended.
    pub fn continue_buffering(&mut self, position_us: i64) -> bool {
        if !self.enabled {
            return false;
        }
        self.downstream_position_us = position_us;
        self.chunk_source.continue_buffering(position_us);
        self.maybe_start_loading();
        self.queue.sample_count() > 0 || self.loading_finished
    }

    /// Buffered media horizon: the end of the last requested chunk, or `i64::MAX` once loading
    /// has finished.
    pub fn buffered_position_us(&self) -> i64 {
        if self.loading_finished {
            i64::MAX
        } else {
            self.media_chunks
                .back()
                .map(|c| c.end_time_us)
                .unwrap_or(self.downstream_position_us)
        }
    }

    /// Repositions the track. Seeks landing inside the buffered window skip forward to the
    /// preceding keyframe without disturbing upstream state; anything else restarts loading
    /// from the target position.
    pub fn seek_to_us(&mut self, position_us: i64) {
        debug_assert!(self.enabled);
        self.downstream_position_us = position_us;
        if self.playback_rate.is_forward()
            && self.queue.skip_to_keyframe_before(position_us).is_some()
        {
            debug!("Seek to {position_us} satisfied from the buffer");
            return;
        }
        self.restart_from(position_us);
    }

    pub fn set_playback_rate(&mut self, rate: PlaybackRate) {
        self.playback_rate = rate;
        self.chunk_source.set_playback_rate(rate);
    }

    fn restart_from(&mut self, position_us: i64) {
        self.load_generation += 1;
        self.loader.cancel_loading();
        self.loader.done_loading();
        self.queue.clear();
        self.media_chunks.clear();
        self.loading_finished = false;
        self.downstream_position_us = position_us;
        let mut shared = self.stream.shared.lock();
        shared.discontinuity_us = Some(position_us);
        shared.eos = false;
    }

    fn maybe_start_loading(&mut self) {
        if self.loader.is_loading()
            || self.loading_finished
            || !self.chunk_source.can_continue_buffering()
        {
            return;
        }
        if self.queue.bytes_buffered() >= self.buffer_bytes_budget {
            return;
        }

        let operation = self
            .chunk_source
            .get_chunk_operation(&self.media_chunks, self.downstream_position_us);
        if operation.queue_size < self.media_chunks.len() {
            self.discard_upstream_media_chunks(operation.queue_size);
        }
        match operation.op {
            ChunkOp::None => {}
            ChunkOp::EndOfStream => {
                info!("End of stream reached");
                self.loading_finished = true;
                self.stream.shared.lock().eos = true;
            }
            ChunkOp::Chunk(mut chunk) => {
                let generation = self.load_generation;
                let events = Arc::clone(&self.events);
                let format_events = Arc::clone(&self.events);
                chunk.set_format_given_callback(Arc::new(move |format: &MediaFormat| {
                    format_events(SourceEvent::UpstreamFormat(format.clone()));
                }));
                if let Chunk::Media(media) = &chunk {
                    let mut meta = media.meta();
                    meta.first_sample_index = self.queue.write_index();
                    self.media_chunks.push_back(meta);
                }
                let source = self.data_source_factory.create();
                self.loader.start_loading(
                    chunk,
                    source,
                    Arc::clone(&self.queue),
                    Box::new(move |chunk, outcome| {
                        events(SourceEvent::LoadDone {
                            generation,
                            chunk: Box::new(chunk),
                            outcome,
                        });
                    }),
                );
            }
        }
    }

    /// Routes a load completion back into the source. Stale completions (from a generation
    /// before a seek, discard or disable) are dropped.
    pub fn on_load_done(&mut self, generation: u64, chunk: Chunk, outcome: LoadOutcome) {
        if generation != self.load_generation {
            debug!("Dropping stale load completion");
            return;
        }
        self.loader.done_loading();
        match outcome {
            LoadOutcome::Succeeded => {
                self.chunk_source.on_chunk_load_completed(&chunk);
                if let Chunk::Media(media) = &chunk {
                    let mut shared = self.stream.shared.lock();
                    if media.drm_init_data.is_some() {
                        shared.drm_init_data = media.drm_init_data.clone();
                    }
                    if let Some(format) = &media.media_format {
                        if self.last_announced_format.as_ref() != Some(format) {
                            shared.pending_format = Some(format.clone());
                            self.last_announced_format = Some(format.clone());
                        }
                    }
                }
            }
            LoadOutcome::Canceled => {
                debug!("Load canceled after {} bytes", chunk.bytes_loaded());
            }
            LoadOutcome::Failed(error) => {
                self.chunk_source.on_chunk_load_error(&chunk, &error);
                // Unwind the failed chunk so the next tick re-requests the same segment.
                if let Chunk::Media(_) = &chunk {
                    if let Some(failed) = self.media_chunks.pop_back() {
                        self.queue.discard_upstream_samples(failed.first_sample_index);
                    }
                }
            }
        }
    }

    fn discard_upstream_media_chunks(&mut self, keep: usize) {
        if keep >= self.media_chunks.len() {
            return;
        }
        // Discarding the tail invalidates the in-flight load (it is always the newest chunk).
        if self.loader.is_loading() {
            self.load_generation += 1;
            self.loader.cancel_loading();
            self.loader.done_loading();
        }
        let mut first_discarded_index = None;
        while self.media_chunks.len() > keep {
            if let Some(chunk) = self.media_chunks.pop_back() {
                first_discarded_index = Some(chunk.first_sample_index);
            }
        }
        if let Some(index) = first_discarded_index {
            let watermark = self.queue.discard_upstream_samples(index);
            warn!("Discarded buffered tail; new watermark {watermark}");
        }
    }
}

//! Chunk types and the background loader.
//!
//! A chunk is one HTTP fetch unit: either an initialization/index fetch or a media segment. A
//! load opens a data source, drives the track's demuxer over it and routes the demuxer's output
//! either into the rolling sample queue (media chunks) or into captured side products
//! (initialization chunks). Cancellation is a flag polled between reads, never an error.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::demux::{
    run_demuxer, ChunkIndex, DemuxResult, DemuxerHandle, MediaFormat, TrackOutput,
    OFFSET_SAMPLE_RELATIVE,
};
use crate::drm::DrmInitData;
use crate::mpd::Format;
use crate::sample_queue::{CryptoInfo, RollingSampleQueue, SAMPLE_FLAG_SYNC};
use crate::upstream::{CancelFlag, DataSource, DataSpec, LENGTH_UNBOUNDED};
use crate::DashError;

/// Why a chunk was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Initial,
    Manual,
    Adaptive,
    TrickPlay,
}

/// What a chunk fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    MediaInit,
    Media,
}

/// How a chunk load ended.
#[derive(Debug)]
pub enum LoadOutcome {
    Succeeded,
    Canceled,
    Failed(DashError),
}

/// Callback fired when a demuxer announces the media format mid-load, so the driver can answer
/// codec queries before the first sample is delivered.
pub type FormatGivenCallback = Arc<dyn Fn(&MediaFormat) + Send + Sync>;

/// Immutable descriptor of a media chunk, kept in the sample source's chunk queue while the
/// loadable itself is off being loaded. Everything the chunk source and format evaluator need
/// to reason about the queue tail lives here.
#[derive(Debug, Clone)]
pub struct MediaChunkMeta {
    pub parent_id: i32,
    pub format: Format,
    pub start_time_us: i64,
    pub end_time_us: i64,
    pub chunk_index: i32,
    pub uri: String,
    /// Sample-queue write index at which this chunk's first sample landed; anchors upstream
    /// discards at chunk granularity.
    pub first_sample_index: i32,
}

impl MediaChunkMeta {
    pub fn next_chunk_index(&self) -> i32 {
        self.chunk_index + 1
    }

    pub fn prev_chunk_index(&self) -> i32 {
        self.chunk_index - 1
    }
}

/// An initialization and/or index fetch. Sample data from the demuxer is a programming error
/// here; the interesting output is the captured media format, segment index sidecar and DRM
/// init data, which the chunk source copies into the representation holder on completion.
pub struct InitializationChunk {
    pub data_spec: DataSpec,
    pub trigger: Trigger,
    pub format: Format,
    pub parent_id: i32,
    pub demuxer: DemuxerHandle,
    pub cancel: CancelFlag,
    bytes_loaded: i64,
    pub media_format: Option<MediaFormat>,
    pub seek_map: Option<ChunkIndex>,
    pub drm_init_data: Option<Arc<DrmInitData>>,
    pub format_given_cb: Option<FormatGivenCallback>,
}

impl InitializationChunk {
    pub fn new(
        data_spec: DataSpec,
        trigger: Trigger,
        format: Format,
        demuxer: DemuxerHandle,
        parent_id: i32,
    ) -> InitializationChunk {
        debug!("+InitChunk {}", format.mime_type);
        InitializationChunk {
            data_spec,
            trigger,
            format,
            parent_id,
            demuxer,
            cancel: CancelFlag::new(),
            bytes_loaded: 0,
            media_format: None,
            seek_map: None,
            drm_init_data: None,
            format_given_cb: None,
        }
    }

    pub fn bytes_loaded(&self) -> i64 {
        self.bytes_loaded
    }

    pub fn has_format(&self) -> bool {
        self.media_format.is_some()
    }

    pub fn has_seek_map(&self) -> bool {
        self.seek_map.is_some()
    }

    pub fn load(&mut self, source: &mut dyn DataSource) -> LoadOutcome {
        let load_spec = self.data_spec.remainder(self.bytes_loaded);
        let open_length = match source.open(&load_spec, &self.cancel) {
            Ok(n) => n,
            Err(e) => {
                info!("Failed to open {:?}: {e}", load_spec.uri);
                source.close();
                return LoadOutcome::Failed(e);
            }
        };
        if self.cancel.is_set() {
            source.close();
            return LoadOutcome::Canceled;
        }
        if self.bytes_loaded == 0 {
            self.demuxer.lock().init();
        }
        let demuxer = Arc::clone(&self.demuxer);
        let cancel = self.cancel.clone();
        let mut sink = InitializationSink { chunk: self };
        let (result, final_position) = run_demuxer(
            &demuxer,
            source,
            load_spec.position,
            open_length,
            &cancel,
            &mut sink,
        );
        self.bytes_loaded = match result {
            DemuxResult::IoError => 0,
            _ => final_position - self.data_spec.position,
        };
        source.close();
        match result {
            DemuxResult::EndOfInput => LoadOutcome::Succeeded,
            DemuxResult::Continue => LoadOutcome::Canceled,
            DemuxResult::Seek(_) => {
                LoadOutcome::Failed(DashError::ChunkLoad(String::from(
                    "seek requested while parsing initialization data",
                )))
            }
            DemuxResult::IoError => {
                LoadOutcome::Failed(DashError::ChunkLoad(String::from(
                    "I/O error parsing initialization data",
                )))
            }
        }
    }
}

struct InitializationSink<'a> {
    chunk: &'a mut InitializationChunk,
}

impl TrackOutput for InitializationSink<'_> {
    fn give_format(&mut self, format: MediaFormat) {
        if let Some(cb) = &self.chunk.format_given_cb {
            cb(&format);
        }
        self.chunk.media_format = Some(format);
    }

    fn give_seek_map(&mut self, index: ChunkIndex) {
        self.chunk.seek_map = Some(index);
    }

    fn give_drm_init_data(&mut self, drm_init_data: Arc<DrmInitData>) {
        self.chunk.drm_init_data = Some(drm_init_data);
    }

    fn write_sample_data(&mut self, _data: &[u8]) -> i64 {
        panic!("unexpected sample data in initialization chunk");
    }

    fn write_sample_metadata(
        &mut self,
        _time_us: i64,
        _duration_us: i64,
        _flags: u32,
        _offset: i64,
        _size: i32,
        _crypto: Option<CryptoInfo>,
    ) {
        panic!("unexpected sample data in initialization chunk");
    }
}

/// How a media chunk turns bytes into samples.
pub enum MediaPayload {
    /// Run the track's container demuxer over the bytes.
    Container(DemuxerHandle),
    /// The whole chunk is one raw text sample (WebVTT/TTML fetched as-is).
    SingleSample,
}

/// A media segment fetch feeding one track's rolling sample queue.
pub struct MediaChunk {
    pub data_spec: DataSpec,
    pub trigger: Trigger,
    pub format: Format,
    pub parent_id: i32,
    pub start_time_us: i64,
    pub end_time_us: i64,
    pub chunk_index: i32,
    /// Added to every parsed sample timestamp to place it on the master timeline.
    pub sample_offset_us: i64,
    /// True when `media_format` is known not to change once the chunk is parsed.
    pub is_media_format_final: bool,
    pub media_format: Option<MediaFormat>,
    pub drm_init_data: Option<Arc<DrmInitData>>,
    pub payload: MediaPayload,
    pub cancel: CancelFlag,
    pub format_given_cb: Option<FormatGivenCallback>,
    bytes_loaded: i64,
}

impl MediaChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_spec: DataSpec,
        trigger: Trigger,
        format: Format,
        start_time_us: i64,
        end_time_us: i64,
        chunk_index: i32,
        sample_offset_us: i64,
        payload: MediaPayload,
        media_format: Option<MediaFormat>,
        drm_init_data: Option<Arc<DrmInitData>>,
        is_media_format_final: bool,
        parent_id: i32,
    ) -> MediaChunk {
        let media_format =
            media_format.map(|f| Self::adjusted_media_format(f, sample_offset_us));
        MediaChunk {
            data_spec,
            trigger,
            format,
            parent_id,
            start_time_us,
            end_time_us,
            chunk_index,
            sample_offset_us,
            is_media_format_final,
            media_format,
            drm_init_data,
            payload,
            cancel: CancelFlag::new(),
            format_given_cb: None,
            bytes_loaded: 0,
        }
    }

    pub fn meta(&self) -> MediaChunkMeta {
        MediaChunkMeta {
            parent_id: self.parent_id,
            format: self.format.clone(),
            start_time_us: self.start_time_us,
            end_time_us: self.end_time_us,
            chunk_index: self.chunk_index,
            uri: self.data_spec.uri.clone(),
            first_sample_index: 0,
        }
    }

    pub fn bytes_loaded(&self) -> i64 {
        self.bytes_loaded
    }

    /// Applies the chunk's sample offset to a demuxer-announced format, so subsample timing
    /// stays consistent with the shifted sample timestamps.
    fn adjusted_media_format(format: MediaFormat, sample_offset_us: i64) -> MediaFormat {
        if sample_offset_us != 0 && format.subsample_offset_us != OFFSET_SAMPLE_RELATIVE {
            let adjusted = format.subsample_offset_us + sample_offset_us;
            format.with_subsample_offset(adjusted)
        } else {
            format
        }
    }

    pub fn load(
        &mut self,
        source: &mut dyn DataSource,
        queue: &RollingSampleQueue,
    ) -> LoadOutcome {
        match &self.payload {
            MediaPayload::SingleSample => self.load_single_sample(source, queue),
            MediaPayload::Container(_) => self.load_container(source, queue),
        }
    }

    fn load_container(
        &mut self,
        source: &mut dyn DataSource,
        queue: &RollingSampleQueue,
    ) -> LoadOutcome {
        let demuxer = match &self.payload {
            MediaPayload::Container(d) => Arc::clone(d),
            MediaPayload::SingleSample => unreachable!(),
        };
        let mut load_spec = self.data_spec.remainder(self.bytes_loaded);
        loop {
            let open_length = match source.open(&load_spec, &self.cancel) {
                Ok(n) => n,
                Err(e) => {
                    info!(
                        "Chunk {} [{}-{}us] failed to open {}: {e}",
                        self.format.mime_type, self.start_time_us, self.end_time_us,
                        load_spec.uri
                    );
                    source.close();
                    return LoadOutcome::Failed(e);
                }
            };
            if self.cancel.is_set() {
                info!(
                    "Chunk {} [{}-{}us] canceled {}",
                    self.format.mime_type, self.start_time_us, self.end_time_us, load_spec.uri
                );
                source.close();
                return LoadOutcome::Canceled;
            }
            if self.bytes_loaded == 0 {
                demuxer.lock().init();
            }
            let cancel = self.cancel.clone();
            let position = load_spec.position;
            let (result, final_position) = {
                let mut sink = MediaSink { chunk: self, queue };
                run_demuxer(&demuxer, source, position, open_length, &cancel, &mut sink)
            };
            self.bytes_loaded = final_position - self.data_spec.position;
            source.close();
            match result {
                DemuxResult::EndOfInput => return LoadOutcome::Succeeded,
                DemuxResult::Continue => return LoadOutcome::Canceled,
                DemuxResult::IoError => {
                    return LoadOutcome::Failed(DashError::ChunkLoad(String::from(
                        "I/O error parsing media segment",
                    )))
                }
                DemuxResult::Seek(new_position) => {
                    // The demuxer wants the stream repositioned; resume reading from there.
                    debug!("Demuxer requested seek to byte {new_position}");
                    let remaining = if self.data_spec.length == LENGTH_UNBOUNDED {
                        LENGTH_UNBOUNDED
                    } else {
                        self.data_spec.position + self.data_spec.length - new_position as i64
                    };
                    load_spec = DataSpec {
                        uri: self.data_spec.uri.clone(),
                        position: new_position as i64,
                        length: remaining,
                        cache_key: self.data_spec.cache_key.clone(),
                    };
                }
            }
        }
    }

    fn load_single_sample(
        &mut self,
        source: &mut dyn DataSource,
        queue: &RollingSampleQueue,
    ) -> LoadOutcome {
        let load_spec = self.data_spec.remainder(self.bytes_loaded);
        if let Err(e) = source.open(&load_spec, &self.cancel) {
            info!("Failed to open {}: {e}", load_spec.uri);
            source.close();
            return LoadOutcome::Failed(e);
        }
        if self.cancel.is_set() {
            source.close();
            return LoadOutcome::Canceled;
        }
        let mut payload = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        loop {
            if self.cancel.is_set() {
                source.close();
                return LoadOutcome::Canceled;
            }
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => payload.extend_from_slice(&buf[..n]),
                Err(e) => {
                    info!("Failed to read {}: {e}", load_spec.uri);
                    source.close();
                    return LoadOutcome::Failed(e);
                }
            }
        }
        self.bytes_loaded += payload.len() as i64;
        let offset = queue.write_sample_data(&payload);
        queue.commit_sample(
            self.start_time_us,
            self.end_time_us - self.start_time_us,
            SAMPLE_FLAG_SYNC,
            offset,
            payload.len() as i32,
            None,
        );
        source.close();
        LoadOutcome::Succeeded
    }
}

struct MediaSink<'a> {
    chunk: &'a mut MediaChunk,
    queue: &'a RollingSampleQueue,
}

impl TrackOutput for MediaSink<'_> {
    fn give_format(&mut self, format: MediaFormat) {
        let adjusted =
            MediaChunk::adjusted_media_format(format, self.chunk.sample_offset_us);
        if let Some(cb) = &self.chunk.format_given_cb {
            cb(&adjusted);
        }
        self.chunk.media_format = Some(adjusted);
    }

    fn give_seek_map(&mut self, _index: ChunkIndex) {
        // Media chunks do not replace the segment index.
    }

    fn give_drm_init_data(&mut self, drm_init_data: Arc<DrmInitData>) {
        self.chunk.drm_init_data = Some(drm_init_data);
    }

    fn write_sample_data(&mut self, data: &[u8]) -> i64 {
        self.queue.write_sample_data(data)
    }

    fn write_sample_metadata(
        &mut self,
        time_us: i64,
        duration_us: i64,
        flags: u32,
        offset: i64,
        size: i32,
        crypto: Option<CryptoInfo>,
    ) {
        self.queue.commit_sample(
            time_us + self.chunk.sample_offset_us,
            duration_us,
            flags,
            offset,
            size,
            crypto,
        );
    }
}

/// Either kind of loadable chunk.
pub enum Chunk {
    Init(InitializationChunk),
    Media(MediaChunk),
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Init(_) => ChunkType::MediaInit,
            Chunk::Media(_) => ChunkType::Media,
        }
    }

    pub fn format(&self) -> &Format {
        match self {
            Chunk::Init(c) => &c.format,
            Chunk::Media(c) => &c.format,
        }
    }

    pub fn data_spec(&self) -> &DataSpec {
        match self {
            Chunk::Init(c) => &c.data_spec,
            Chunk::Media(c) => &c.data_spec,
        }
    }

    pub fn parent_id(&self) -> i32 {
        match self {
            Chunk::Init(c) => c.parent_id,
            Chunk::Media(c) => c.parent_id,
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        match self {
            Chunk::Init(c) => c.cancel.clone(),
            Chunk::Media(c) => c.cancel.clone(),
        }
    }

    pub fn bytes_loaded(&self) -> i64 {
        match self {
            Chunk::Init(c) => c.bytes_loaded(),
            Chunk::Media(c) => c.bytes_loaded(),
        }
    }

    pub fn set_format_given_callback(&mut self, cb: FormatGivenCallback) {
        match self {
            Chunk::Init(c) => c.format_given_cb = Some(cb),
            Chunk::Media(c) => c.format_given_cb = Some(cb),
        }
    }

    pub fn load(&mut self, source: &mut dyn DataSource, queue: &RollingSampleQueue) -> LoadOutcome {
        match self {
            Chunk::Init(c) => c.load(source),
            Chunk::Media(c) => c.load(source, queue),
        }
    }
}

/// Runs one chunk load at a time on a background task and hands the chunk back through the
/// completion callback. Cancellation flips the chunk's flag; the running load notices it
/// between reads and winds down as "canceled", not as an error.
pub struct Loader {
    runtime: tokio::runtime::Handle,
    current_cancel: Option<CancelFlag>,
}

impl Loader {
    pub fn new(runtime: tokio::runtime::Handle) -> Loader {
        Loader { runtime, current_cancel: None }
    }

    pub fn is_loading(&self) -> bool {
        self.current_cancel.is_some()
    }

    pub fn start_loading(
        &mut self,
        mut chunk: Chunk,
        mut source: Box<dyn DataSource>,
        queue: Arc<RollingSampleQueue>,
        on_done: Box<dyn FnOnce(Chunk, LoadOutcome) + Send>,
    ) {
        if self.is_loading() {
            warn!("start_loading while a load is in flight; canceling previous load");
            self.cancel_loading();
        }
        self.current_cancel = Some(chunk.cancel_flag());
        self.runtime.spawn_blocking(move || {
            let outcome = chunk.load(source.as_mut(), &queue);
            on_done(chunk, outcome);
        });
    }

    /// Requests cancellation of the in-flight load, if any. The completion callback still fires
    /// (with a canceled outcome) once the load winds down.
    pub fn cancel_loading(&mut self) {
        if let Some(cancel) = self.current_cancel.take() {
            cancel.set();
        }
    }

    /// Marks the in-flight load as finished. Called when the completion callback's event is
    /// processed.
    pub fn done_loading(&mut self) {
        self.current_cancel = None;
    }
}

//! The container-demuxer seam.
//!
//! The core does not parse fMP4, WebM or RawCC itself. A [`SegmentDemuxer`] consumes bytes from
//! a [`DemuxerInput`] and pushes typed samples, the media format, DRM init data and (for
//! initialization chunks) a [`ChunkIndex`] sidecar into a [`TrackOutput`]. Production demuxers
//! live outside this crate; tests script them.

use std::sync::Arc;

use crate::drm::DrmInitData;
use crate::sample_queue::CryptoInfo;
use crate::upstream::{CancelFlag, DataSource};
use crate::DashError;

/// Value used for numeric format fields that are not known.
pub const NO_VALUE: i32 = -1;

/// Subsample timestamps are relative to the sample timestamp rather than a fixed offset.
pub const OFFSET_SAMPLE_RELATIVE: i64 = i64::MAX;

/// The format of a media track as determined by a demuxer (or synthesized from the manifest for
/// raw text tracks).
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFormat {
    pub track_id: String,
    pub mime_type: String,
    pub codecs: String,
    pub bitrate: i32,
    pub duration_us: i64,
    pub width: i32,
    pub height: i32,
    pub channel_count: i32,
    pub sample_rate: i32,
    pub language: String,
    /// Fixed offset added to subsample timestamps, or [`OFFSET_SAMPLE_RELATIVE`].
    pub subsample_offset_us: i64,
}

impl MediaFormat {
    pub fn video(
        track_id: &str,
        mime_type: &str,
        codecs: &str,
        bitrate: i32,
        duration_us: i64,
        width: i32,
        height: i32,
    ) -> MediaFormat {
        MediaFormat {
            track_id: String::from(track_id),
            mime_type: String::from(mime_type),
            codecs: String::from(codecs),
            bitrate,
            duration_us,
            width,
            height,
            channel_count: NO_VALUE,
            sample_rate: NO_VALUE,
            language: String::new(),
            subsample_offset_us: OFFSET_SAMPLE_RELATIVE,
        }
    }

    pub fn audio(
        track_id: &str,
        mime_type: &str,
        codecs: &str,
        bitrate: i32,
        duration_us: i64,
        channel_count: i32,
        sample_rate: i32,
        language: &str,
    ) -> MediaFormat {
        MediaFormat {
            track_id: String::from(track_id),
            mime_type: String::from(mime_type),
            codecs: String::from(codecs),
            bitrate,
            duration_us,
            width: NO_VALUE,
            height: NO_VALUE,
            channel_count,
            sample_rate,
            language: String::from(language),
            subsample_offset_us: OFFSET_SAMPLE_RELATIVE,
        }
    }

    pub fn text(
        track_id: &str,
        mime_type: &str,
        bitrate: i32,
        duration_us: i64,
        language: &str,
    ) -> MediaFormat {
        MediaFormat {
            track_id: String::from(track_id),
            mime_type: String::from(mime_type),
            codecs: String::new(),
            bitrate,
            duration_us,
            width: NO_VALUE,
            height: NO_VALUE,
            channel_count: NO_VALUE,
            sample_rate: NO_VALUE,
            language: String::from(language),
            subsample_offset_us: OFFSET_SAMPLE_RELATIVE,
        }
    }

    pub fn with_subsample_offset(&self, offset_us: i64) -> MediaFormat {
        let mut copy = self.clone();
        copy.subsample_offset_us = offset_us;
        copy
    }
}

/// A parsed segment index sidecar: per-chunk sizes, byte offsets, durations and start times of
/// equal length, with non-decreasing times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkIndex {
    pub sizes: Vec<u32>,
    pub offsets: Vec<u64>,
    pub durations_us: Vec<i64>,
    pub times_us: Vec<i64>,
}

impl ChunkIndex {
    pub fn new(
        sizes: Vec<u32>,
        offsets: Vec<u64>,
        durations_us: Vec<i64>,
        times_us: Vec<i64>,
    ) -> ChunkIndex {
        debug_assert!(!times_us.is_empty());
        debug_assert_eq!(sizes.len(), offsets.len());
        debug_assert_eq!(sizes.len(), durations_us.len());
        debug_assert_eq!(sizes.len(), times_us.len());
        debug_assert!(times_us.windows(2).all(|w| w[0] <= w[1]));
        ChunkIndex { sizes, offsets, durations_us, times_us }
    }

    pub fn len(&self) -> usize {
        self.times_us.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times_us.is_empty()
    }

    /// Index of the chunk containing `time_us`; negative times map to the first chunk, times
    /// past the end to the last.
    pub fn chunk_index(&self, time_us: i64) -> i32 {
        if time_us < 0 {
            return 0;
        }
        // First chunk with start >= time_us, then step back unless it starts exactly there.
        let idx = self.times_us.partition_point(|&t| t < time_us);
        if idx == self.times_us.len() {
            return idx as i32 - 1;
        }
        if self.times_us[idx] == time_us {
            idx as i32
        } else {
            (idx as i32 - 1).max(0)
        }
    }

    /// Byte position of the chunk containing `time_us`.
    pub fn position_for(&self, time_us: i64) -> u64 {
        self.offsets[self.chunk_index(time_us) as usize]
    }
}

/// Where a demuxer routes its output while parsing one chunk. Implemented by the chunk types:
/// media chunks append to the track's rolling sample queue, initialization chunks capture the
/// side products and reject sample data.
pub trait TrackOutput {
    /// Announces the media format. May be called at most once per chunk, before any sample.
    fn give_format(&mut self, format: MediaFormat);

    /// Hands over a segment index parsed from the stream.
    fn give_seek_map(&mut self, index: ChunkIndex);

    /// Hands over DRM initialization data found in the stream.
    fn give_drm_init_data(&mut self, drm_init_data: Arc<DrmInitData>);

    /// Appends sample payload bytes. Returns the absolute byte offset at which the data landed.
    fn write_sample_data(&mut self, data: &[u8]) -> i64;

    /// Commits metadata for a sample whose payload was appended with
    /// [`TrackOutput::write_sample_data`].
    fn write_sample_metadata(
        &mut self,
        time_us: i64,
        duration_us: i64,
        flags: u32,
        offset: i64,
        size: i32,
        crypto: Option<CryptoInfo>,
    );
}

/// Outcome of one [`SegmentDemuxer::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxResult {
    /// More input is needed; call `read` again.
    Continue,
    /// The chunk has been fully consumed.
    EndOfInput,
    /// The demuxer needs the input repositioned to this absolute byte offset.
    Seek(u64),
    /// The input failed irrecoverably.
    IoError,
}

/// Positioned reader handed to demuxers, wrapping the open data source of the current load.
pub struct DemuxerInput<'a> {
    source: &'a mut dyn DataSource,
    position: i64,
    /// Resolved length of the open range, or -1 when unknown.
    length: i64,
}

impl<'a> DemuxerInput<'a> {
    pub fn new(source: &'a mut dyn DataSource, position: i64, length: i64) -> DemuxerInput<'a> {
        DemuxerInput { source, position, length }
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` means end of input.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, DashError> {
        let n = self.source.read(buf)?;
        self.position += n as i64;
        Ok(n)
    }

    /// Absolute position of the next byte to be read.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn length(&self) -> i64 {
        self.length
    }
}

/// A container demuxer bound to one track. `init` is called once before the first `read` of a
/// chunk sequence; `read` consumes input and pushes results into `output` until it reports
/// [`DemuxResult::EndOfInput`].
pub trait SegmentDemuxer: Send {
    fn init(&mut self);
    fn read(&mut self, input: &mut DemuxerInput<'_>, output: &mut dyn TrackOutput) -> DemuxResult;
}

/// Handle shared between the representation holder that owns a demuxer and the chunk loads
/// that drive it. Only one load per track is in flight at a time, so the lock is uncontended.
pub type DemuxerHandle = Arc<parking_lot::Mutex<Box<dyn SegmentDemuxer>>>;

pub fn demuxer_handle(demuxer: Box<dyn SegmentDemuxer>) -> DemuxerHandle {
    Arc::new(parking_lot::Mutex::new(demuxer))
}

/// Creates the demuxers attached to each representation when a period is instantiated. The
/// audio object type allow-list and the RawCC truncation window mirror what the period holder
/// derives from the manifest.
pub trait DemuxerFactory: Send + Sync {
    /// Fragmented-MP4 demuxer for audio or video. `audio_object_types` is the allow-list of
    /// audio object types to accept (empty for video); `reverse` is true when playback is
    /// running backwards.
    fn create_fmp4(&self, audio_object_types: &[i32], reverse: bool) -> Box<dyn SegmentDemuxer>;

    /// RawCC caption demuxer. `sample_offset_us` is added to parsed sample times;
    /// `truncate_window_us`, when present, discards samples outside `[start, end)` at parse
    /// time (single-file unindexed caption streams spanning the whole asset).
    fn create_rawcc(
        &self,
        sample_offset_us: i64,
        truncate_window_us: Option<(i64, i64)>,
    ) -> Box<dyn SegmentDemuxer>;
}

/// Audio object types accepted by the fMP4 demuxer on audio tracks.
pub const AUDIO_OBJECT_TYPE_AAC: i32 = 0x40;
pub const AUDIO_OBJECT_TYPE_AC3: i32 = 0xA5;
pub const AUDIO_OBJECT_TYPE_EAC3: i32 = 0xA6;

/// Drains the open data source through a demuxer until end of input, cancellation or error.
/// Returns the demux outcome together with the final input position. A [`DemuxResult::Seek`]
/// is surfaced to the caller, which reopens the source at the requested position.
pub fn run_demuxer(
    demuxer: &DemuxerHandle,
    source: &mut dyn DataSource,
    position: i64,
    length: i64,
    cancel: &CancelFlag,
    output: &mut dyn TrackOutput,
) -> (DemuxResult, i64) {
    let mut input = DemuxerInput::new(source, position, length);
    let mut demuxer = demuxer.lock();
    loop {
        if cancel.is_set() {
            return (DemuxResult::Continue, input.position());
        }
        match demuxer.read(&mut input, output) {
            DemuxResult::Continue => continue,
            other => return (other, input.position()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> ChunkIndex {
        ChunkIndex::new(
            vec![100, 200, 300],
            vec![0, 100, 300],
            vec![10, 10, 10],
            vec![0, 10, 20],
        )
    }

    #[test]
    fn chunk_index_maps_times_to_chunks() {
        let idx = index();
        for n in 0..idx.len() as i32 {
            let t = idx.times_us[n as usize];
            let d = idx.durations_us[n as usize];
            assert_eq!(idx.chunk_index(t), n);
            assert_eq!(idx.chunk_index(t + d - 1), n);
        }
    }

    #[test]
    fn chunk_index_clamps_out_of_range_times() {
        let idx = index();
        assert_eq!(idx.chunk_index(-5), 0);
        assert_eq!(idx.chunk_index(1_000), 2);
        assert_eq!(idx.position_for(1_000), 300);
        assert_eq!(idx.position_for(15), 100);
    }
}

//! Shared code for our test harness: scripted collaborators standing in for the network and
//! the container demuxers, plus manifest builders.

// Each integration test binary compiles this module and uses a different subset of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use dash_stream::demux::{
    DemuxResult, DemuxerFactory, DemuxerInput, MediaFormat, SegmentDemuxer, TrackOutput,
};
use dash_stream::mpd::{
    AdaptationSet, AdaptationType, Format, MediaPresentation, MultiSegmentIndex, Period,
    RangedUri, Representation, SegmentBase, SegmentUrlSource, TimelineElement, UrlTemplate,
};
use dash_stream::upstream::{CancelFlag, DataSource, DataSourceFactory, DataSpec};
use dash_stream::DashError;

static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    TRACING_INIT.call_once(|| {
        let fmt_layer = fmt::layer().compact().with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info,reqwest=warn,hyper=warn"))
            .expect("initializing logging");
        tracing_subscriber::registry().with(filter_layer).with(fmt_layer).init();
    });
}

/// One recorded fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub uri: String,
    pub position: i64,
    pub length: i64,
}

#[derive(Default)]
struct ScriptInner {
    resources: HashMap<String, Vec<u8>>,
    log: Vec<RecordedRequest>,
}

/// Data-source factory serving canned resources by URI and recording every open.
#[derive(Clone, Default)]
pub struct ScriptedSources {
    inner: Arc<Mutex<ScriptInner>>,
}

impl ScriptedSources {
    pub fn new() -> ScriptedSources {
        ScriptedSources::default()
    }

    pub fn add(&self, uri: &str, data: impl Into<Vec<u8>>) {
        self.inner.lock().resources.insert(String::from(uri), data.into());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().log.clone()
    }

    pub fn request_uris(&self) -> Vec<String> {
        self.inner.lock().log.iter().map(|r| r.uri.clone()).collect()
    }
}

impl DataSourceFactory for ScriptedSources {
    fn create(&self) -> Box<dyn DataSource> {
        Box::new(ScriptedDataSource { inner: Arc::clone(&self.inner), open: None })
    }
}

struct ScriptedDataSource {
    inner: Arc<Mutex<ScriptInner>>,
    open: Option<(Vec<u8>, usize)>,
}

impl DataSource for ScriptedDataSource {
    fn open(&mut self, spec: &DataSpec, _cancel: &CancelFlag) -> Result<i64, DashError> {
        let mut inner = self.inner.lock();
        inner.log.push(RecordedRequest {
            uri: spec.uri.clone(),
            position: spec.position,
            length: spec.length,
        });
        let Some(resource) = inner.resources.get(&spec.uri) else {
            return Err(DashError::Network(format!("no such resource: {}", spec.uri)));
        };
        let start = (spec.position.max(0) as usize).min(resource.len());
        let end = if spec.length < 0 {
            resource.len()
        } else {
            (start + spec.length as usize).min(resource.len())
        };
        let window = resource[start..end].to_vec();
        let len = window.len() as i64;
        self.open = Some((window, 0));
        Ok(len)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DashError> {
        let Some((data, cursor)) = self.open.as_mut() else {
            return Err(DashError::Other(String::from("read on unopened scripted source")));
        };
        let remaining = data.len() - *cursor;
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&data[*cursor..*cursor + n]);
        *cursor += n;
        Ok(n)
    }

    fn close(&mut self) {
        self.open = None;
    }
}

/// Demuxer driven by a line-oriented fixture format, so test resources fully script what a
/// container parse would produce:
///
/// ```text
/// F|mime|codecs|width|height|channels|rate|lang
/// S|time_us|duration_us|flags|payload
/// ```
pub struct StubDemuxer {
    sample_offset_us: i64,
    buffer: Vec<u8>,
}

impl StubDemuxer {
    fn emit(&mut self, output: &mut dyn TrackOutput) {
        let text = String::from_utf8_lossy(&self.buffer).into_owned();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let fields: Vec<&str> = line.split('|').collect();
            match fields[0] {
                "F" => {
                    let mime = fields[1];
                    let codecs = fields.get(2).copied().unwrap_or("");
                    let width: i32 = fields.get(3).and_then(|v| v.parse().ok()).unwrap_or(-1);
                    let height: i32 = fields.get(4).and_then(|v| v.parse().ok()).unwrap_or(-1);
                    let channels: i32 = fields.get(5).and_then(|v| v.parse().ok()).unwrap_or(-1);
                    let rate: i32 = fields.get(6).and_then(|v| v.parse().ok()).unwrap_or(-1);
                    let lang = fields.get(7).copied().unwrap_or("");
                    let format = if mime.starts_with("audio/") {
                        MediaFormat::audio("t", mime, codecs, 0, 0, channels, rate, lang)
                    } else if mime.starts_with("video/") {
                        MediaFormat::video("t", mime, codecs, 0, 0, width, height)
                    } else {
                        MediaFormat::text("t", mime, 0, 0, lang)
                    };
                    output.give_format(format);
                }
                "S" => {
                    let time_us: i64 = fields[1].parse().unwrap();
                    let duration_us: i64 = fields[2].parse().unwrap();
                    let flags: u32 = fields[3].parse().unwrap();
                    let payload = fields.get(4).copied().unwrap_or("").as_bytes();
                    let offset = output.write_sample_data(payload);
                    output.write_sample_metadata(
                        time_us + self.sample_offset_us,
                        duration_us,
                        flags,
                        offset,
                        payload.len() as i32,
                        None,
                    );
                }
                other => panic!("unknown fixture directive {other}"),
            }
        }
    }
}

impl SegmentDemuxer for StubDemuxer {
    fn init(&mut self) {
        self.buffer.clear();
    }

    fn read(&mut self, input: &mut DemuxerInput<'_>, output: &mut dyn TrackOutput) -> DemuxResult {
        let mut chunk = [0u8; 4096];
        match input.read(&mut chunk) {
            Ok(0) => {
                self.emit(output);
                DemuxResult::EndOfInput
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                DemuxResult::Continue
            }
            Err(_) => DemuxResult::IoError,
        }
    }
}

/// Hands out [`StubDemuxer`]s for every track type. The RawCC `sample_offset` is honoured so
/// text fixtures behave like the production parser.
#[derive(Default)]
pub struct StubDemuxerFactory;

impl DemuxerFactory for StubDemuxerFactory {
    fn create_fmp4(&self, _audio_object_types: &[i32], _reverse: bool) -> Box<dyn SegmentDemuxer> {
        Box::new(StubDemuxer { sample_offset_us: 0, buffer: Vec::new() })
    }

    fn create_rawcc(
        &self,
        sample_offset_us: i64,
        _truncate_window_us: Option<(i64, i64)>,
    ) -> Box<dyn SegmentDemuxer> {
        Box::new(StubDemuxer { sample_offset_us, buffer: Vec::new() })
    }
}

/// A representation whose index is an explicit timeline of `segment_durations_s`, addressed
/// through `media_template`/`init_template` against `base`.
pub fn timeline_representation(
    id: &str,
    mime: &str,
    bitrate: i32,
    base: &str,
    media_template: &str,
    init_template: Option<&str>,
    segment_durations_s: &[u64],
    start_number: i32,
) -> Representation {
    let base_uri: Arc<str> = Arc::from(base);
    let mut start = 0;
    let timeline: Vec<TimelineElement> = segment_durations_s
        .iter()
        .map(|&d| {
            let element = TimelineElement { start, duration: d };
            start += d;
            element
        })
        .collect();
    let initialization = init_template.map(|init| RangedUri::new(&base_uri, init, 0, -1));
    let index = MultiSegmentIndex {
        base_uri: Arc::clone(&base_uri),
        initialization,
        timescale: 1,
        presentation_time_offset: 0,
        start_number,
        duration: 0,
        timeline: Some(Arc::new(timeline)),
        source: SegmentUrlSource::Template(UrlTemplate::new(media_template)),
        format_id: String::from(id),
        bandwidth: bitrate,
    };
    let mut format = Format::new(id, mime, bitrate);
    format.codecs = String::from(if mime.starts_with("video/") { "avc1.4d401e" } else { "mp4a.40.2" });
    Representation::new("test-content", 0, format, SegmentBase::Multi(Arc::new(index)), false)
}

pub fn video_adaptation_set(id: &str, representations: Vec<Representation>) -> AdaptationSet {
    AdaptationSet {
        id: String::from(id),
        set_type: AdaptationType::Video,
        representations,
        content_protections: vec![],
        supplemental_properties: vec![],
        essential_properties: vec![],
    }
}

pub fn audio_adaptation_set(id: &str, representations: Vec<Representation>) -> AdaptationSet {
    AdaptationSet {
        id: String::from(id),
        set_type: AdaptationType::Audio,
        representations,
        content_protections: vec![],
        supplemental_properties: vec![],
        essential_properties: vec![],
    }
}

/// Static presentation with the given periods; period starts must already be laid out.
pub fn vod_presentation(duration_ms: i64, periods: Vec<Period>) -> Arc<MediaPresentation> {
    Arc::new(MediaPresentation {
        availability_start_time_ms: 0,
        duration_ms,
        min_buffer_time_ms: 1_000,
        dynamic: false,
        min_update_period_ms: -1,
        time_shift_buffer_depth_ms: -1,
        location: None,
        periods,
    })
}

pub fn period(id: &str, start_ms: i64, adaptation_sets: Vec<AdaptationSet>) -> Period {
    Period { id: String::from(id), start_ms, adaptation_sets }
}

// The per-track pipeline end to end: buffer governor, load completion routing, format-before-
// sample ordering on the read side, failed-load unwinding and end-of-stream latching.
//
// To run only these tests while enabling printing to stdout/stderr
//
//    cargo test --test sample_source -- --show-output

pub mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use common::{
    period, setup_logging, timeline_representation, video_adaptation_set, vod_presentation,
    ScriptedSources, StubDemuxerFactory,
};
use dash_stream::chunk_source::DashChunkSource;
use dash_stream::evaluator::FixedEvaluator;
use dash_stream::holders::TrackCriteria;
use dash_stream::mpd::AdaptationType;
use dash_stream::playback_rate::PlaybackRate;
use dash_stream::sample_queue::SampleHolder;
use dash_stream::sample_source::{ChunkSampleSource, ReadResult, SourceEvent};
use dash_stream::SystemClock;

const US: i64 = 1_000_000;

fn single_period_source(
    sources: &ScriptedSources,
    runtime: tokio::runtime::Handle,
) -> (ChunkSampleSource, mpsc::Receiver<SourceEvent>) {
    let manifest = vod_presentation(
        10_000,
        vec![period(
            "p0",
            0,
            vec![video_adaptation_set(
                "video",
                vec![timeline_representation(
                    "v",
                    "video/mp4",
                    600_000,
                    "http://test/",
                    "seg-$Number$.m4s",
                    Some("init.mp4"),
                    &[5, 5],
                    0,
                )],
            )],
        )],
    );
    let chunk_source = DashChunkSource::new(
        None,
        manifest,
        AdaptationType::Video,
        Box::new(FixedEvaluator),
        Arc::new(StubDemuxerFactory),
        None,
        Arc::new(SystemClock),
        0,
        false,
        PlaybackRate::default(),
    );
    let (tx, rx) = mpsc::channel();
    let events: Arc<dyn Fn(SourceEvent) + Send + Sync> = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    let source =
        ChunkSampleSource::new(chunk_source, Arc::new(sources.clone()), events, 5 << 20, runtime);
    (source, rx)
}

/// Runs buffering ticks, feeding load completions back in, until the source reports samples
/// or end of stream `rounds` times.
fn drive(
    source: &mut ChunkSampleSource,
    rx: &mpsc::Receiver<SourceEvent>,
    formats_seen: &mut Vec<String>,
    position_us: i64,
    rounds: usize,
) {
    for _ in 0..rounds {
        source.continue_buffering(position_us);
        while let Ok(event) = rx.recv_timeout(Duration::from_millis(500)) {
            match event {
                SourceEvent::LoadDone { generation, chunk, outcome } => {
                    source.on_load_done(generation, *chunk, outcome);
                    break;
                }
                SourceEvent::UpstreamFormat(format) => {
                    formats_seen.push(format.mime_type.clone());
                }
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffers_and_delivers_samples_in_order() {
    setup_logging();
    let sources = ScriptedSources::new();
    sources.add("http://test/init.mp4", "F|video/mp4|avc1.4d401e|640|360||\n");
    sources.add("http://test/seg-0.m4s", "S|0|5000000|1|seg0\n");
    sources.add("http://test/seg-1.m4s", "S|5000000|5000000|1|seg1\n");

    let (mut source, rx) = single_period_source(&sources, tokio::runtime::Handle::current());
    source.prepare(0);
    source.enable(&TrackCriteria::new("video/*"), 0, PlaybackRate::default());
    let stream = source.stream();

    let mut formats_seen = Vec::new();
    // init + two media loads + the end-of-stream tick.
    drive(&mut source, &rx, &mut formats_seen, 0, 4);

    // The demuxer announced the codec during the initialization load.
    assert_eq!(formats_seen, vec![String::from("video/mp4")]);
    assert_eq!(
        sources.request_uris(),
        vec![
            String::from("http://test/init.mp4"),
            String::from("http://test/seg-0.m4s"),
            String::from("http://test/seg-1.m4s"),
        ]
    );

    // Read side: the pending boundary first, then the format, then samples in order, then EOS.
    assert_eq!(stream.read_discontinuity(), Some(0));
    let mut format_holder = None;
    let mut holder = SampleHolder::default();
    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::FormatRead);
    assert_eq!(format_holder.as_ref().map(|f| f.mime_type.as_str()), Some("video/mp4"));

    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::SampleRead);
    assert_eq!(holder.time_us, 0);
    assert_eq!(holder.data, b"seg0");
    stream.advance();

    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::SampleRead);
    assert_eq!(holder.time_us, 5 * US);
    assert_eq!(holder.data, b"seg1");
    stream.advance();

    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::EndOfStream);
    assert!(source.continue_buffering(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_media_load_is_unwound_and_retried() {
    setup_logging();
    let sources = ScriptedSources::new();
    sources.add("http://test/init.mp4", "F|video/mp4|avc1.4d401e|640|360||\n");
    sources.add("http://test/seg-0.m4s", "S|0|5000000|1|seg0\n");
    // seg-1 is missing at first: its load fails and gets unwound.

    let (mut source, rx) = single_period_source(&sources, tokio::runtime::Handle::current());
    source.prepare(0);
    source.enable(&TrackCriteria::new("video/*"), 0, PlaybackRate::default());
    let stream = source.stream();

    let mut formats_seen = Vec::new();
    drive(&mut source, &rx, &mut formats_seen, 0, 3);

    // Now the segment appears upstream; the next ticks re-request and complete it.
    sources.add("http://test/seg-1.m4s", "S|5000000|5000000|1|seg1\n");
    drive(&mut source, &rx, &mut formats_seen, 0, 2);

    let seg1_requests = sources
        .request_uris()
        .iter()
        .filter(|uri| uri.ends_with("seg-1.m4s"))
        .count();
    assert!(seg1_requests >= 2, "expected a retry of seg-1, saw {seg1_requests}");

    stream.read_discontinuity();
    let mut format_holder = None;
    let mut holder = SampleHolder::default();
    // Both samples arrive despite the intermediate failure.
    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::FormatRead);
    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::SampleRead);
    assert_eq!(holder.data, b"seg0");
    stream.advance();
    assert_eq!(stream.read_data(&mut format_holder, &mut holder), ReadResult::SampleRead);
    assert_eq!(holder.data, b"seg1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seek_outside_buffer_restarts_loading() {
    setup_logging();
    let sources = ScriptedSources::new();
    sources.add("http://test/init.mp4", "F|video/mp4|avc1.4d401e|640|360||\n");
    sources.add("http://test/seg-0.m4s", "S|0|5000000|1|seg0\n");
    sources.add("http://test/seg-1.m4s", "S|5000000|5000000|1|seg1\n");

    let (mut source, rx) = single_period_source(&sources, tokio::runtime::Handle::current());
    source.prepare(0);
    source.enable(&TrackCriteria::new("video/*"), 0, PlaybackRate::default());
    let stream = source.stream();

    let mut formats_seen = Vec::new();
    drive(&mut source, &rx, &mut formats_seen, 0, 2);
    stream.read_discontinuity();

    // Seek to the second segment: outside the keyframe-skippable window once the queue is
    // drained, so loading restarts there.
    source.seek_to_us(6 * US);
    assert_eq!(stream.read_discontinuity(), Some(6 * US));

    // Drain events from the canceled generation and keep buffering; the next media request
    // must be for the segment containing 6s.
    let mut formats_seen = Vec::new();
    drive(&mut source, &rx, &mut formats_seen, 6 * US, 3);
    let last_media = sources
        .request_uris()
        .into_iter()
        .filter(|uri| uri.contains("seg-"))
        .next_back();
    assert_eq!(last_media.as_deref(), Some("http://test/seg-1.m4s"));
}

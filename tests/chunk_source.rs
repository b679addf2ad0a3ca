// Chunk selection across a static multi-period presentation: the sequence of initialization
// and media fetches, period skipping, and seek adjustment at period boundaries.
//
// To run only these tests while enabling printing to stdout/stderr
//
//    cargo test --test chunk_source -- --show-output

pub mod common;

use std::collections::VecDeque;
use std::sync::Arc;

use common::{
    period, setup_logging, timeline_representation, video_adaptation_set, vod_presentation,
    StubDemuxerFactory,
};
use dash_stream::chunk::{Chunk, MediaChunkMeta};
use dash_stream::chunk_source::{ChunkOp, DashChunkSource};
use dash_stream::demux::MediaFormat;
use dash_stream::evaluator::FixedEvaluator;
use dash_stream::holders::TrackCriteria;
use dash_stream::mpd::{AdaptationType, MediaPresentation, Period};
use dash_stream::playback_rate::PlaybackRate;
use dash_stream::SystemClock;

const US: i64 = 1_000_000;

fn video_period(index: usize, start_ms: i64, segment_durations_s: &[u64]) -> Period {
    let file = format!("p{index}.mp4");
    let hi = timeline_representation(
        "v-hi",
        "video/mp4",
        2_000_000,
        "http://test/",
        &file,
        Some(&file),
        segment_durations_s,
        0,
    );
    let lo = timeline_representation(
        "v-lo",
        "video/mp4",
        500_000,
        "http://test/",
        &file,
        Some(&file),
        segment_durations_s,
        0,
    );
    period(&format!("p{index}"), start_ms, vec![video_adaptation_set("video", vec![hi, lo])])
}

fn new_source(manifest: Arc<MediaPresentation>) -> DashChunkSource {
    let mut source = DashChunkSource::new(
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
    source.enable(&TrackCriteria::new("video/*"));
    source
}

fn file_name(uri: &str) -> String {
    uri.rsplit('/').next().unwrap_or(uri).to_string()
}

/// Pulls chunk operations out of the source the way a sample source would, simulating each
/// load's completion, and returns the delivered `(kind, file)` sequence.
fn drive_to_completion(source: &mut DashChunkSource) -> Vec<(char, String)> {
    let mut queue: VecDeque<MediaChunkMeta> = VecDeque::new();
    let mut delivered = Vec::new();
    for _ in 0..64 {
        let operation = source.get_chunk_operation(&queue, 0);
        match operation.op {
            ChunkOp::Chunk(Chunk::Init(mut init)) => {
                delivered.push(('i', file_name(&init.data_spec.uri)));
                // Simulate the load: the demuxer announces the stream's media format.
                init.media_format = Some(MediaFormat::video(
                    "v-hi",
                    "video/mp4",
                    "avc1.4d401e",
                    2_000_000,
                    0,
                    640,
                    360,
                ));
                source.on_chunk_load_completed(&Chunk::Init(init));
            }
            ChunkOp::Chunk(Chunk::Media(media)) => {
                delivered.push(('m', file_name(&media.data_spec.uri)));
                queue.push_back(media.meta());
            }
            ChunkOp::EndOfStream => {
                delivered.push(('e', String::from("eos")));
                return delivered;
            }
            ChunkOp::None => panic!("unexpected idle chunk operation"),
        }
    }
    panic!("chunk source never reached end of stream: {delivered:?}");
}

#[test]
fn static_multi_period_fetch_sequence() {
    setup_logging();
    // Three 10s periods, two 5s segments each, two representations per period.
    let manifest = vod_presentation(
        30_000,
        vec![
            video_period(0, 0, &[5, 5]),
            video_period(1, 10_000, &[5, 5]),
            video_period(2, 20_000, &[5, 5]),
        ],
    );
    let mut source = new_source(manifest);
    let delivered = drive_to_completion(&mut source);
    let expected: Vec<(char, String)> = vec![
        ('i', "p0.mp4".into()),
        ('m', "p0.mp4".into()),
        ('m', "p0.mp4".into()),
        ('i', "p1.mp4".into()),
        ('m', "p1.mp4".into()),
        ('m', "p1.mp4".into()),
        ('i', "p2.mp4".into()),
        ('m', "p2.mp4".into()),
        ('m', "p2.mp4".into()),
        ('e', "eos".into()),
    ];
    assert_eq!(delivered, expected);
}

#[test]
fn period_without_matching_adaptation_set_is_skipped() {
    setup_logging();
    // The middle period carries only audio; the video track steps straight from period 0 to
    // period 2, which runs 20s (four segments) to the end of the presentation.
    let audio_only = period(
        "p1",
        10_000,
        vec![common::audio_adaptation_set(
            "audio",
            vec![timeline_representation(
                "a-main",
                "audio/mp4",
                128_000,
                "http://test/",
                "a1.mp4",
                Some("a1.mp4"),
                &[5, 5],
                0,
            )],
        )],
    );
    let manifest = vod_presentation(
        40_000,
        vec![video_period(0, 0, &[5, 5]), audio_only, video_period(2, 20_000, &[5, 5, 5, 5])],
    );
    let mut source = new_source(manifest);
    let delivered = drive_to_completion(&mut source);
    let expected: Vec<(char, String)> = vec![
        ('i', "p0.mp4".into()),
        ('m', "p0.mp4".into()),
        ('m', "p0.mp4".into()),
        ('i', "p2.mp4".into()),
        ('m', "p2.mp4".into()),
        ('m', "p2.mp4".into()),
        ('m', "p2.mp4".into()),
        ('m', "p2.mp4".into()),
        ('e', "eos".into()),
    ];
    assert_eq!(delivered, expected);
}

#[test]
fn seek_adjustment_snaps_to_period_segment_boundaries() {
    setup_logging();
    // Three 10s periods with a single 10s segment each.
    let manifest = vod_presentation(
        30_000,
        vec![
            video_period(0, 0, &[10]),
            video_period(1, 10_000, &[10]),
            video_period(2, 20_000, &[10]),
        ],
    );
    let source = new_source(manifest);

    assert_eq!(source.get_adjusted_seek(0), 0);
    assert_eq!(source.get_adjusted_seek(5 * US), 0);
    assert_eq!(source.get_adjusted_seek(13 * US), 10 * US);
    assert_eq!(source.get_adjusted_seek(17 * US), 10 * US);
    assert_eq!(source.get_adjusted_seek(21 * US), 20 * US);
    // Targets outside any period come back unmodified.
    assert_eq!(source.get_adjusted_seek(-10 * US), -10 * US);
    assert_eq!(source.get_adjusted_seek(62 * US), 62 * US);
}

#[test]
fn seek_adjustment_rounds_to_nearer_segment_edge() {
    setup_logging();
    // One 30s period with three 10s segments: interior boundaries allow rounding both ways.
    let manifest = vod_presentation(30_000, vec![video_period(0, 0, &[10, 10, 10])]);
    let source = new_source(manifest);

    assert_eq!(source.get_adjusted_seek(4 * US), 0);
    assert_eq!(source.get_adjusted_seek(6 * US), 10 * US);
    assert_eq!(source.get_adjusted_seek(14 * US), 10 * US);
    assert_eq!(source.get_adjusted_seek(26 * US), 20 * US);
}

// Full-pipeline tests: manifest XML in, pulled frames out, with the network and demuxers
// scripted. Covers startup codec discovery, cross-track delivery order, seeking and the
// end-of-stream contract of the pull API.
//
// To run only these tests while enabling printing to stdout/stderr
//
//    cargo test --test player -- --show-output

pub mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{setup_logging, ScriptedSources, StubDemuxerFactory};
use dash_stream::player::{
    AudioCodec, FrameInfo, FrameType, PlayerConfig, PlayerHost, VideoCodec,
    FRAME_FLAG_FIRST_FRAGMENT,
};
use dash_stream::xml::XmlManifestParser;
use dash_stream::{DashError, DashPlayer};

/// The pull-poll fallback interval while no frame is available.
const PULL_POLL_SLEEP: Duration = Duration::from_millis(50);
const PULL_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Default)]
struct StubHost;

impl PlayerHost for StubHost {
    fn get_media_time_ms(&self) -> i64 {
        // The decoder never reports a position; delivery is not drift-bounded.
        -1
    }

    fn decoder_flush(&self) {}

    fn open_cdm_session(&self) -> Result<String, DashError> {
        Ok(String::from("session-0"))
    }

    fn fetch_license(&self, _session_id: &str, _pssh: &[u8]) -> Result<(), DashError> {
        Ok(())
    }

    fn close_cdm_session(&self, _session_id: &str) -> Result<(), DashError> {
        Ok(())
    }
}

fn manifest_xml() -> String {
    let mut periods = String::new();
    for i in 0..3 {
        periods.push_str(&format!(
            r#"  <Period id="p{i}" start="PT{start}S" duration="PT10S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate media="p{i}-$Number$.m4s" initialization="p{i}-init.mp4"
                       timescale="1" startNumber="0">
        <SegmentTimeline><S t="0" d="5" r="1"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v{i}" bandwidth="600000" codecs="avc1.4d401e" width="640" height="360"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate media="a{i}-$Number$.m4s" initialization="a{i}-init.mp4"
                       timescale="1" startNumber="0">
        <SegmentTimeline><S t="0" d="5" r="1"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="a{i}" bandwidth="128000" codecs="mp4a.40.2" audioSamplingRate="48000">
        <AudioChannelConfiguration schemeIdUri="urn:mpeg:dash:23003:3:audio_channel_configuration:2011" value="2"/>
      </Representation>
    </AdaptationSet>
  </Period>
"#,
            start = i * 10,
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static"
     mediaPresentationDuration="PT30S" minBufferTime="PT1.5S">
{periods}</MPD>"#
    )
}

fn scripted_content() -> ScriptedSources {
    let sources = ScriptedSources::new();
    sources.add("http://test/manifest.mpd", manifest_xml());
    for i in 0..3 {
        sources.add(
            &format!("http://test/p{i}-init.mp4"),
            "F|video/mp4|avc1.4d401e|640|360||\n",
        );
        sources.add(
            &format!("http://test/a{i}-init.mp4"),
            "F|audio/mp4|mp4a.40.2|||2|48000|en\n",
        );
        for n in 0..2 {
            let t = n * 5_000_000;
            sources.add(
                &format!("http://test/p{i}-{n}.m4s"),
                format!("S|{t}|5000000|1|v{i}{n}\n"),
            );
            sources.add(
                &format!("http://test/a{i}-{n}.m4s"),
                format!("S|{t}|5000000|1|a{i}{n}\n"),
            );
        }
    }
    sources
}

fn new_player(sources: &ScriptedSources) -> DashPlayer {
    DashPlayer::with_collaborators(
        Arc::new(StubHost),
        Arc::new(StubDemuxerFactory),
        PlayerConfig::default(),
        Arc::new(XmlManifestParser),
        Arc::new(sources.clone()),
        Arc::new(sources.clone()),
    )
    .expect("creating player")
}

/// Polls `copy_frame` until end of stream, collecting the PTS of each first fragment per
/// track.
fn drain_to_eos(player: &DashPlayer) -> (Vec<i64>, Vec<i64>) {
    let mut video_pts = Vec::new();
    let mut audio_pts = Vec::new();
    let mut buf = [0u8; 4096];
    let mut info = FrameInfo::default();
    let deadline = Instant::now() + PULL_DEADLINE;
    loop {
        let n = player.copy_frame(&mut buf, &mut info);
        if n == 0 {
            break;
        }
        if n < 0 {
            assert!(Instant::now() < deadline, "stream did not finish in time");
            std::thread::sleep(PULL_POLL_SLEEP);
            continue;
        }
        if info.flags & FRAME_FLAG_FIRST_FRAGMENT != 0 {
            match info.frame_type {
                Some(FrameType::Video) => video_pts.push(info.pts),
                Some(FrameType::Audio) => audio_pts.push(info.pts),
                _ => {}
            }
        }
    }
    (video_pts, audio_pts)
}

#[test]
fn vod_playback_delivers_every_period_in_order() {
    setup_logging();
    let sources = scripted_content();
    let player = new_player(&sources);
    player.load("http://test/manifest.mpd", 0.0).expect("load");

    // Codec discovery happened during the initialization loads.
    let video = player.video_codec_settings().unwrap();
    assert_eq!(video.codec, VideoCodec::H264);
    assert_eq!((video.width, video.height), (640, 360));
    let audio = player.audio_codec_settings().unwrap();
    assert_eq!(audio.codec, AudioCodec::Aac);
    assert_eq!(audio.num_channels, 2);
    assert_eq!(audio.sample_rate, 48_000);

    assert_eq!(player.duration_ms(), 30_000);
    assert_eq!(player.first_time_ms(), 0);
    assert_eq!(player.stream_counts(), (1, 1, 0));

    let (video_pts, audio_pts) = drain_to_eos(&player);
    assert!(player.is_eos());

    // One sample per 5s segment, two per period, shifted onto the master timeline.
    let expected: Vec<i64> = (0..6).map(|n| n * 5 * 90_000).collect();
    assert_eq!(video_pts, expected);
    assert_eq!(audio_pts, expected);

    // Per-track fetch order: initialization first, then media, period by period.
    let video_requests: Vec<String> = sources
        .request_uris()
        .into_iter()
        .filter(|uri| uri.starts_with("http://test/p"))
        .collect();
    assert_eq!(
        video_requests,
        vec![
            "http://test/p0-init.mp4",
            "http://test/p0-0.m4s",
            "http://test/p0-1.m4s",
            "http://test/p1-init.mp4",
            "http://test/p1-0.m4s",
            "http://test/p1-1.m4s",
            "http://test/p2-init.mp4",
            "http://test/p2-0.m4s",
            "http://test/p2-1.m4s",
        ]
    );

    player.unload();
}

#[test]
fn seek_jumps_to_the_target_period() {
    setup_logging();
    let sources = scripted_content();
    let player = new_player(&sources);
    player.load("http://test/manifest.mpd", 0.0).expect("load");

    player.seek(20_000).expect("seek");
    let (video_pts, audio_pts) = drain_to_eos(&player);
    assert!(player.is_eos());

    // Everything delivered after the seek comes from the last period.
    assert!(!video_pts.is_empty());
    assert!(video_pts.iter().all(|&pts| pts >= 20 * 90_000));
    assert!(audio_pts.iter().all(|&pts| pts >= 20 * 90_000));

    player.unload();
}

#[test]
fn short_seeks_are_refused() {
    setup_logging();
    let sources = scripted_content();
    let player = new_player(&sources);
    player.load("http://test/manifest.mpd", 0.0).expect("load");

    // Within the 2s minimum distance of the current position and not a seek to zero.
    let result = player.seek(1_000);
    assert!(matches!(result, Err(DashError::InvalidArgument(_))), "got {result:?}");
    player.unload();
}

#[test]
fn load_fails_without_an_audio_track() {
    setup_logging();
    let sources = ScriptedSources::new();
    sources.add(
        "http://test/manifest.mpd",
        r#"<MPD type="static" mediaPresentationDuration="PT10S">
  <Period id="p0" start="PT0S" duration="PT10S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate media="p0-$Number$.m4s" initialization="p0-init.mp4"
                       timescale="1" startNumber="0">
        <SegmentTimeline><S t="0" d="5" r="1"/></SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v0" bandwidth="600000" codecs="avc1.4d401e" width="640" height="360"/>
    </AdaptationSet>
  </Period>
</MPD>"#,
    );
    let player = new_player(&sources);
    let result = player.load("http://test/manifest.mpd", 0.0);
    assert!(matches!(result, Err(DashError::InvalidArgument(_))), "got {result:?}");
}

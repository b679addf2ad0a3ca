//! The playback scheduler: per-track state, periodic buffering ticks, cross-track sample
//! selection and seek/rate coordination.
//!
//! The driver runs as a single task fed by a command channel and a periodic tick. All chunk
//! source, period and representation mutation happens here. The host's decoder pulls samples
//! through [`PullShared::copy_frame`] on its own thread; the pull state is the one structure
//! shared between the two sides and sits behind a mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bandwidth::{BandwidthMeter, NO_ESTIMATE};
use crate::chunk_source::DashChunkSource;
use crate::demux::{DemuxerFactory, MediaFormat};
use crate::drm::DrmSessionManager;
use crate::evaluator::{AdaptiveEvaluator, FixedEvaluator, FormatEvaluator};
use crate::holders::TrackCriteria;
use crate::manifest_fetcher::{ManifestFetcher, ManifestParser};
use crate::mpd::{AdaptationType, MediaPresentation};
use crate::playback_rate::PlaybackRate;
use crate::player::PlayerHost;
use crate::qoe::{QoeManager, StreamState, VideoErrorCode};
use crate::sample_queue::SampleHolder;
use crate::sample_source::{ChunkSampleSource, ReadResult, SourceEvent, TrackStream};
use crate::upstream::DataSourceFactory;
use crate::{ClockRef, DashError};

/// Scheduler tick period.
pub const TICK_PERIOD: Duration = Duration::from_millis(400);
/// Decoder media time is polled at most this often.
pub const MEDIA_TIME_POLL_PERIOD: Duration = Duration::from_secs(1);
/// Cadence of the per-track summary log line.
pub const TRACK_SUMMARY_PERIOD: Duration = Duration::from_secs(5);
/// Cadence of the bandwidth estimate log line.
pub const BANDWIDTH_LOG_PERIOD: Duration = Duration::from_secs(5);
/// How long `load` waits for both codecs to be announced.
pub const CODEC_WAIT_TIMEOUT: Duration = Duration::from_secs(6);
/// Distance from the live edge at which live playback starts.
pub const DEFAULT_LIVE_EDGE_LATENCY_US: i64 = 1_000_000;
/// Drift bound: no track may run ahead of the decoder position by more than this, scaled by
/// the playback rate magnitude.
pub const MAX_PR_BUFFER_US: i64 = 5_000_000;
/// Seeks shorter than this are refused, except seeks to zero.
pub const MIN_SEEK_DISTANCE_US: i64 = 2_000_000;

/// Per-track buffer budgets.
pub const VIDEO_BUFFER_BYTES: usize = 5 * 1024 * 1024;
pub const AUDIO_BUFFER_BYTES: usize = 2 * 1024 * 1024;
pub const TEXT_BUFFER_BYTES: usize = 3 * 1024 * 1024 / 2;

/// Player lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Preparing,
    Buffering,
    Ready,
    Ended,
}

/// The type of frame a pulled sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Video,
    Audio,
    Cc,
}

pub const FRAME_FLAG_FIRST_FRAGMENT: u32 = 1;
pub const FRAME_FLAG_LAST_FRAGMENT: u32 = 2;
pub const FRAME_FLAG_HAS_PTS: u32 = 4;

/// Metadata returned alongside each `copy_frame` fragment. Times are in 90 kHz ticks. Crypto
/// fields are populated only on the first fragment of an encrypted sample.
#[derive(Debug, Default, Clone)]
pub struct FrameInfo {
    pub frame_type: Option<FrameType>,
    pub flags: u32,
    pub pts: i64,
    pub duration: i64,
    pub width: i32,
    pub height: i32,
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub subsample_count: usize,
    pub clear_bytes: Vec<i32>,
    pub enc_bytes: Vec<i32>,
}

fn to_90khz(time_us: i64) -> i64 {
    time_us * 90 / 1_000
}

/// Commands serialized onto the driver task.
pub enum DriverCmd {
    Load {
        url: String,
        initial_time_sec: f32,
        reply: oneshot::Sender<Result<(), DashError>>,
    },
    Unload {
        reply: oneshot::Sender<()>,
    },
    Seek {
        media_time_ms: i64,
        reply: oneshot::Sender<Result<(), DashError>>,
    },
    SetRate {
        rate: f32,
    },
    Track(usize, SourceEvent),
}

/// Snapshot of session facts the API answers without a driver round-trip.
#[derive(Default)]
pub struct SessionInfo {
    inner: Mutex<SessionInfoInner>,
}

#[derive(Default)]
struct SessionInfoInner {
    video_format: Option<MediaFormat>,
    audio_format: Option<MediaFormat>,
    cc_format: Option<MediaFormat>,
    duration_ms: i64,
    sample_offset_ms: i64,
    stream_counts: (i32, i32, i32),
    state: Option<PlayerState>,
}

impl SessionInfo {
    pub fn video_format(&self) -> Option<MediaFormat> {
        self.inner.lock().video_format.clone()
    }

    pub fn audio_format(&self) -> Option<MediaFormat> {
        self.inner.lock().audio_format.clone()
    }

    pub fn cc_format(&self) -> Option<MediaFormat> {
        self.inner.lock().cc_format.clone()
    }

    pub fn duration_ms(&self) -> i64 {
        self.inner.lock().duration_ms
    }

    pub fn sample_offset_ms(&self) -> i64 {
        self.inner.lock().sample_offset_ms
    }

    pub fn stream_counts(&self) -> (i32, i32, i32) {
        self.inner.lock().stream_counts
    }

    pub fn state(&self) -> Option<PlayerState> {
        self.inner.lock().state
    }
}

/// Pull-side view of one track.
pub struct PullTrack {
    pub name: &'static str,
    pub frame_type: FrameType,
    pub stream: Arc<TrackStream>,
    pub format: Option<MediaFormat>,
    pub sample_holder: SampleHolder,
    pub has_sample: bool,
    pub is_eos: bool,
    /// Set after a format change; the next encrypted sample verifies license presence before
    /// delivery.
    pub check_pssh: bool,
    pub times_selected: u64,
}

#[derive(Default)]
pub struct PullState {
    pub tracks: Vec<PullTrack>,
    pub current_track: Option<usize>,
    /// Bytes of the current sample already copied out.
    pub sample_consumed: usize,
    pub reader_position_us: i64,
    pub decoder_position_us: i64,
    pub media_time_valid: bool,
    pub last_media_time_poll: Option<Instant>,
    pub rate: PlaybackRate,
    pub sample_offset_us: i64,
}

/// State shared between the driver task and the host pull thread.
pub struct PullShared {
    pub state: Mutex<PullState>,
    eos: AtomicBool,
}

impl Default for PullShared {
    fn default() -> Self {
        PullShared { state: Mutex::new(PullState::default()), eos: AtomicBool::new(false) }
    }
}

impl PullShared {
    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    fn set_eos(&self, eos: bool) {
        self.eos.store(eos, Ordering::SeqCst);
    }

    fn update_media_time(&self, host: &dyn PlayerHost, state: &mut PullState) {
        let due = state
            .last_media_time_poll
            .is_none_or(|last| last.elapsed() >= MEDIA_TIME_POLL_PERIOD);
        if !due {
            return;
        }
        state.last_media_time_poll = Some(Instant::now());
        let ms = host.get_media_time_ms();
        if ms >= 0 {
            state.decoder_position_us = ms * 1_000;
            state.media_time_valid = true;
        }
    }

    /// Ensures every non-EOS track has a peeked sample where possible, processing format
    /// deliveries and discarding decode-only audio/text samples on the way.
    fn fill_track_holders(&self, state: &mut PullState) {
        for track in &mut state.tracks {
            if let Some(boundary_us) = track.stream.read_discontinuity() {
                debug!("{}: discontinuity at {boundary_us}us", track.name);
            }
            if track.is_eos || track.has_sample {
                continue;
            }
            loop {
                let mut format_holder = None;
                match track.stream.read_data(&mut format_holder, &mut track.sample_holder) {
                    ReadResult::FormatRead => {
                        debug!("{}: format delivered", track.name);
                        track.format = format_holder;
                        track.check_pssh = true;
                        continue;
                    }
                    ReadResult::SampleRead => {
                        if track.frame_type != FrameType::Video
                            && track.sample_holder.is_decode_only()
                        {
                            // Seek alignment targets the nearest video sync frame; audio and
                            // text roll forward to the seek point by dropping decode-only
                            // samples.
                            if !track.sample_holder.is_sync() {
                                warn!(
                                    "{}: refusing to discard non-sync decode-only sample",
                                    track.name
                                );
                                track.has_sample = true;
                                break;
                            }
                            track.stream.advance();
                            continue;
                        }
                        track.has_sample = true;
                        break;
                    }
                    ReadResult::EndOfStream => {
                        info!("{}: end of stream", track.name);
                        track.is_eos = true;
                        break;
                    }
                    ReadResult::NothingRead => break,
                }
            }
        }
    }

    /// Picks the track whose sample should be delivered next, honouring media-time gating for
    /// text and the drift bound for everyone.
    fn select_next_track(&self, state: &PullState) -> Option<usize> {
        let forward = state.rate.is_forward();
        let media_time_track = state
            .tracks
            .iter()
            .position(|t| t.frame_type == FrameType::Audio)
            .or_else(|| state.tracks.iter().position(|t| t.frame_type == FrameType::Video));

        let drift_bound_us = (MAX_PR_BUFFER_US as f64 * state.rate.rate().abs() as f64) as i64;
        let mut best: Option<(usize, i64)> = None;
        for (index, track) in state.tracks.iter().enumerate() {
            if !track.has_sample {
                continue;
            }
            // Text is slaved to the media-time track and never delivered before media time
            // is known.
            if track.frame_type == FrameType::Cc
                && (!state.media_time_valid || media_time_track.is_none())
            {
                continue;
            }
            let time_us = track.sample_holder.time_us;
            if state.media_time_valid {
                let too_far = if forward {
                    time_us > state.decoder_position_us + drift_bound_us
                } else {
                    time_us < state.decoder_position_us - drift_bound_us
                };
                if too_far {
                    continue;
                }
            }
            let better = match best {
                None => true,
                Some((_, best_time)) => {
                    if forward {
                        time_us < best_time
                    } else {
                        time_us > best_time
                    }
                }
            };
            if better {
                best = Some((index, time_us));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Drops the current sample of `track` (license failure) so the pipeline can move on.
    fn drop_current_sample(track: &mut PullTrack) {
        track.stream.advance();
        track.sample_holder.clear();
        track.has_sample = false;
    }

    /// The pull-read entry point. Returns bytes copied, 0 at end of stream, or -1 when no
    /// frame is available yet.
    pub fn copy_frame(
        &self,
        host: &dyn PlayerHost,
        drm: &DrmSessionManager,
        qoe: &QoeManager,
        buf: &mut [u8],
        info: &mut FrameInfo,
    ) -> i64 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.update_media_time(host, state);
        self.fill_track_holders(state);

        let non_text_all_eos = {
            let mut any = false;
            let mut all_eos = true;
            for track in state.tracks.iter().filter(|t| t.frame_type != FrameType::Cc) {
                any = true;
                all_eos &= track.is_eos;
            }
            any && all_eos
        };
        if non_text_all_eos {
            self.set_eos(true);
            return 0;
        }

        if state.current_track.is_none() {
            let Some(selected) = self.select_next_track(state) else {
                return -1;
            };

            // License gate for encrypted samples after a format change.
            let needs_pssh_check = {
                let track = &state.tracks[selected];
                track.check_pssh && track.sample_holder.is_encrypted()
            };
            if needs_pssh_check {
                let pssh = state.tracks[selected]
                    .stream
                    .drm_init_data()
                    .and_then(|init| init.license_pssh().map(|s| s.data.clone()));
                let licensed = match &pssh {
                    Some(pssh) => drm.join(pssh),
                    None => false,
                };
                if licensed {
                    state.tracks[selected].check_pssh = false;
                } else {
                    qoe.report_video_error(
                        VideoErrorCode::MediaDrmError,
                        "license unavailable for encrypted sample",
                        false,
                    );
                    Self::drop_current_sample(&mut state.tracks[selected]);
                    return -1;
                }
            }

            let has_audio = state.tracks.iter().any(|t| t.frame_type == FrameType::Audio);
            let track = &mut state.tracks[selected];
            track.times_selected += 1;
            let is_media_time_track = match track.frame_type {
                FrameType::Audio => true,
                FrameType::Video => !has_audio,
                FrameType::Cc => false,
            };
            let sample_time = track.sample_holder.time_us;
            if is_media_time_track {
                state.reader_position_us = sample_time;
            }
            state.current_track = Some(selected);
            state.sample_consumed = 0;
        }

        let current = state.current_track.expect("current track selected");
        let first_fragment = state.sample_consumed == 0;
        let track = &mut state.tracks[current];
        let sample = &track.sample_holder;

        info.flags = 0;
        info.frame_type = Some(track.frame_type);
        if first_fragment {
            info.flags |= FRAME_FLAG_FIRST_FRAGMENT | FRAME_FLAG_HAS_PTS;
            info.pts = to_90khz(sample.time_us);
            info.duration = to_90khz(sample.duration_us);
            if let Some(format) = &track.format {
                info.width = format.width;
                info.height = format.height;
            }
            if let Some(crypto) = &sample.crypto {
                info.key_id = crypto.key_id.clone();
                info.iv = crypto.iv.clone();
                info.subsample_count = crypto.subsample_count();
                info.clear_bytes = crypto.num_bytes_clear.clone();
                info.enc_bytes = crypto.num_bytes_enc.clone();
            }
        }

        let offset = state.sample_consumed;
        let remaining = track.sample_holder.data.len() - offset;
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&track.sample_holder.data[offset..offset + n]);

        if n == remaining {
            info.flags |= FRAME_FLAG_LAST_FRAGMENT;
            track.stream.advance();
            track.sample_holder.clear();
            track.has_sample = false;
            state.current_track = None;
            state.sample_consumed = 0;
        } else {
            state.sample_consumed += n;
        }
        n as i64
    }
}

struct DriverTrack {
    name: &'static str,
    frame_type: FrameType,
    criteria: TrackCriteria,
    source: ChunkSampleSource,
    upstream_format: Option<MediaFormat>,
}

struct PendingLoad {
    reply: oneshot::Sender<Result<(), DashError>>,
    deadline: Instant,
    has_audio: bool,
    has_video: bool,
}

/// Everything the driver needs to build track pipelines.
pub struct DriverDeps {
    pub host: Arc<dyn PlayerHost>,
    pub drm: Arc<DrmSessionManager>,
    pub qoe: Arc<QoeManager>,
    pub clock: ClockRef,
    pub runtime: tokio::runtime::Handle,
    pub parser: Arc<dyn ManifestParser>,
    pub metered_factory: Arc<dyn DataSourceFactory>,
    pub unmetered_factory: Arc<dyn DataSourceFactory>,
    pub demuxer_factory: Arc<dyn DemuxerFactory>,
    pub bandwidth_meter: Arc<BandwidthMeter>,
    pub all_tracks_metered: bool,
    pub live_edge_latency_us: i64,
}

pub struct Driver {
    deps: DriverDeps,
    cmd_tx: mpsc::UnboundedSender<DriverCmd>,
    cmd_rx: mpsc::UnboundedReceiver<DriverCmd>,
    pull: Arc<PullShared>,
    session: Arc<SessionInfo>,
    state: PlayerState,
    tracks: Vec<DriverTrack>,
    manifest_fetcher: Option<Arc<ManifestFetcher>>,
    playback_rate: PlaybackRate,
    pending_load: Option<PendingLoad>,
    initial_position_us: i64,
    sample_offset_us: i64,
    last_track_summary: Instant,
    last_bandwidth_log: Instant,
}

impl Driver {
    pub fn new(
        deps: DriverDeps,
        cmd_tx: mpsc::UnboundedSender<DriverCmd>,
        cmd_rx: mpsc::UnboundedReceiver<DriverCmd>,
        pull: Arc<PullShared>,
        session: Arc<SessionInfo>,
    ) -> Driver {
        Driver {
            deps,
            cmd_tx,
            cmd_rx,
            pull,
            session,
            state: PlayerState::Idle,
            tracks: Vec::new(),
            manifest_fetcher: None,
            playback_rate: PlaybackRate::default(),
            pending_load: None,
            initial_position_us: 0,
            sample_offset_us: 0,
            last_track_summary: Instant::now(),
            last_bandwidth_log: Instant::now(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_cmd(cmd),
                        None => break,
                    }
                }
                _ = tick.tick() => self.on_tick(),
            }
        }
        self.teardown();
    }

    fn handle_cmd(&mut self, cmd: DriverCmd) {
        match cmd {
            DriverCmd::Load { url, initial_time_sec, reply } => {
                self.handle_load(&url, initial_time_sec, reply);
            }
            DriverCmd::Unload { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
            DriverCmd::Seek { media_time_ms, reply } => {
                let _ = reply.send(self.handle_seek(media_time_ms));
            }
            DriverCmd::SetRate { rate } => self.handle_set_rate(rate),
            DriverCmd::Track(index, event) => self.handle_track_event(index, event),
        }
    }

    fn handle_load(
        &mut self,
        url: &str,
        initial_time_sec: f32,
        reply: oneshot::Sender<Result<(), DashError>>,
    ) {
        if self.state != PlayerState::Idle {
            let _ = reply.send(Err(DashError::InvalidArgument(String::from(
                "load while already loaded",
            ))));
            return;
        }
        info!("Loading {url} from {initial_time_sec}s");
        let fetcher = Arc::new(ManifestFetcher::new(
            url,
            Arc::clone(&self.deps.parser),
            Arc::clone(&self.deps.metered_factory),
            Arc::clone(&self.deps.clock),
            self.deps.runtime.clone(),
        ));
        fetcher.request_refresh();
        self.manifest_fetcher = Some(fetcher);
        self.initial_position_us = (initial_time_sec as f64 * 1_000_000.0) as i64;
        self.pending_load = Some(PendingLoad {
            reply,
            deadline: Instant::now() + CODEC_WAIT_TIMEOUT,
            has_audio: false,
            has_video: false,
        });
        self.set_state(PlayerState::Preparing);
    }

    fn on_tick(&mut self) {
        match self.state {
            PlayerState::Idle | PlayerState::Ended => {}
            PlayerState::Preparing => self.tick_preparing(),
            PlayerState::Buffering | PlayerState::Ready => self.tick_buffering(),
        }
        self.check_pending_load_deadline();
        self.maybe_log_summaries();
    }

    fn tick_preparing(&mut self) {
        let Some(fetcher) = self.manifest_fetcher.clone() else {
            return;
        };
        if let Some(manifest) = fetcher.current() {
            self.build_tracks(&manifest, &fetcher);
            return;
        }
        if !fetcher.can_continue_buffering() {
            warn!("Manifest failed while preparing; ending playback");
            self.fail_pending_load(DashError::Parsing(String::from("manifest unusable")));
            self.set_state(PlayerState::Ended);
            return;
        }
        // Retry a transiently failed first fetch; a no-op while one is still in flight.
        fetcher.request_refresh();
    }

    fn tick_buffering(&mut self) {
        {
            let mut state = self.pull.state.lock();
            self.pull.update_media_time(self.deps.host.as_ref(), &mut state);
        }
        let reader_position_us = self.pull.state.lock().reader_position_us;
        let mut all_ready = true;
        for track in &mut self.tracks {
            if track.source.is_enabled() {
                let ready = track.source.continue_buffering(reader_position_us);
                if track.frame_type != FrameType::Cc {
                    all_ready &= ready;
                }
            }
        }
        let new_state = if all_ready { PlayerState::Ready } else { PlayerState::Buffering };
        if new_state != self.state {
            self.set_state(new_state);
        }
    }

    fn check_pending_load_deadline(&mut self) {
        let timed_out = self
            .pending_load
            .as_ref()
            .is_some_and(|pending| Instant::now() >= pending.deadline);
        if timed_out {
            warn!("Codecs not received within the startup window");
            self.fail_pending_load(DashError::CodecTimeout);
            self.set_state(PlayerState::Ended);
        }
    }

    fn fail_pending_load(&mut self, error: DashError) {
        if let Some(pending) = self.pending_load.take() {
            let _ = pending.reply.send(Err(error));
        }
    }

    /// Instantiates the per-track pipelines against the first manifest snapshot and moves to
    /// BUFFERING. Runs atomically on the driver task.
    fn build_tracks(&mut self, manifest: &Arc<MediaPresentation>, fetcher: &Arc<ManifestFetcher>) {
        let mut counts: HashMap<AdaptationType, i32> = HashMap::new();
        for period in &manifest.periods {
            let mut per_period: HashMap<AdaptationType, i32> = HashMap::new();
            for set in &period.adaptation_sets {
                *per_period.entry(set.set_type).or_default() += 1;
            }
            for (set_type, count) in per_period {
                let entry = counts.entry(set_type).or_default();
                *entry = (*entry).max(count);
            }
        }
        let has_video = counts.get(&AdaptationType::Video).copied().unwrap_or(0) > 0;
        let has_audio = counts.get(&AdaptationType::Audio).copied().unwrap_or(0) > 0;
        let has_text = counts.get(&AdaptationType::Text).copied().unwrap_or(0) > 0;
        if !has_video || !has_audio {
            warn!("Manifest is missing a video or audio track");
            self.fail_pending_load(DashError::InvalidArgument(String::from(
                "manifest missing audio or video",
            )));
            self.set_state(PlayerState::Ended);
            return;
        }

        // Master-timeline shift: the first period's start against the first representation's
        // presentation time offset.
        self.sample_offset_us = manifest
            .periods
            .first()
            .and_then(|p| p.adaptation_sets.first())
            .and_then(|s| s.representations.first())
            .map(|r| {
                manifest.periods[0].start_ms * 1_000 - r.presentation_time_offset_us
            })
            .unwrap_or(0);

        let duration_ms = if manifest.dynamic { 0 } else { manifest.duration_ms };
        {
            let mut session = self.session.inner.lock();
            session.duration_ms = duration_ms;
            session.sample_offset_ms = self.sample_offset_us / 1_000;
            session.stream_counts = (
                counts.get(&AdaptationType::Video).copied().unwrap_or(0),
                counts.get(&AdaptationType::Audio).copied().unwrap_or(0),
                counts.get(&AdaptationType::Text).copied().unwrap_or(0),
            );
        }

        let mut specs: Vec<(&'static str, FrameType, AdaptationType, &str, usize)> = vec![
            ("video", FrameType::Video, AdaptationType::Video, "video/*", VIDEO_BUFFER_BYTES),
            ("audio", FrameType::Audio, AdaptationType::Audio, "audio/*", AUDIO_BUFFER_BYTES),
        ];
        if has_text {
            specs.push((
                "cc",
                FrameType::Cc,
                AdaptationType::Text,
                "application/x-rawcc",
                TEXT_BUFFER_BYTES,
            ));
        }

        let position_us = self.initial_position_us + self.sample_offset_us;
        let mut pull_tracks = Vec::new();
        for (name, frame_type, adaptation_type, mime_glob, budget) in specs {
            let evaluator: Box<dyn FormatEvaluator> = match adaptation_type {
                AdaptationType::Video => {
                    Box::new(AdaptiveEvaluator::new(Arc::clone(&self.deps.bandwidth_meter)))
                }
                _ => Box::new(FixedEvaluator),
            };
            let metered = self.deps.all_tracks_metered || frame_type == FrameType::Video;
            let data_source_factory = if metered {
                Arc::clone(&self.deps.metered_factory)
            } else {
                Arc::clone(&self.deps.unmetered_factory)
            };
            let chunk_source = DashChunkSource::new(
                Some(Arc::clone(fetcher)),
                Arc::clone(manifest),
                adaptation_type,
                evaluator,
                Arc::clone(&self.deps.demuxer_factory),
                Some(Arc::clone(&self.deps.qoe)),
                Arc::clone(&self.deps.clock),
                self.deps.live_edge_latency_us,
                manifest.dynamic,
                self.playback_rate,
            );
            let index = self.tracks.len();
            let events_tx = self.cmd_tx.clone();
            let events: Arc<dyn Fn(SourceEvent) + Send + Sync> = Arc::new(move |event| {
                let _ = events_tx.send(DriverCmd::Track(index, event));
            });
            let mut source = ChunkSampleSource::new(
                chunk_source,
                data_source_factory,
                events,
                budget,
                self.deps.runtime.clone(),
            );
            let criteria = TrackCriteria::new(mime_glob);
            source.prepare(position_us);
            source.enable(&criteria, position_us, self.playback_rate);
            pull_tracks.push(PullTrack {
                name,
                frame_type,
                stream: source.stream(),
                format: None,
                sample_holder: SampleHolder::default(),
                has_sample: false,
                is_eos: false,
                check_pssh: true,
                times_selected: 0,
            });
            self.tracks.push(DriverTrack {
                name,
                frame_type,
                criteria,
                source,
                upstream_format: None,
            });
        }

        {
            let mut state = self.pull.state.lock();
            state.tracks = pull_tracks;
            state.reader_position_us = position_us;
            state.decoder_position_us = position_us;
            state.media_time_valid = false;
            state.rate = self.playback_rate;
            state.sample_offset_us = self.sample_offset_us;
            state.current_track = None;
            state.sample_consumed = 0;
        }
        self.pull.set_eos(false);
        self.set_state(PlayerState::Buffering);
    }

    fn handle_track_event(&mut self, index: usize, event: SourceEvent) {
        match event {
            SourceEvent::UpstreamFormat(format) => {
                let Some(track) = self.tracks.get_mut(index) else {
                    return;
                };
                debug!("{}: upstream format {}", track.name, format.mime_type);
                track.upstream_format = Some(format.clone());
                {
                    let mut session = self.session.inner.lock();
                    match track.frame_type {
                        FrameType::Video => session.video_format = Some(format),
                        FrameType::Audio => session.audio_format = Some(format),
                        FrameType::Cc => session.cc_format = Some(format),
                    }
                }
                self.maybe_complete_pending_load();
            }
            SourceEvent::LoadDone { generation, chunk, outcome } => {
                if let Some(track) = self.tracks.get_mut(index) {
                    track.source.on_load_done(generation, *chunk, outcome);
                }
            }
        }
    }

    fn maybe_complete_pending_load(&mut self) {
        let Some(pending) = self.pending_load.as_mut() else {
            return;
        };
        pending.has_video = self
            .tracks
            .iter()
            .any(|t| t.frame_type == FrameType::Video && t.upstream_format.is_some());
        pending.has_audio = self
            .tracks
            .iter()
            .any(|t| t.frame_type == FrameType::Audio && t.upstream_format.is_some());
        if pending.has_video && pending.has_audio {
            if let Some(pending) = self.pending_load.take() {
                let _ = pending.reply.send(Ok(()));
            }
        }
    }

    fn handle_seek(&mut self, media_time_ms: i64) -> Result<(), DashError> {
        if !matches!(self.state, PlayerState::Buffering | PlayerState::Ready) {
            return Err(DashError::Unavailable(String::from("seek before load")));
        }
        if self.playback_rate.is_trick() {
            return Err(DashError::InvalidArgument(String::from("seek during trick play")));
        }
        if media_time_ms < 0 {
            return Err(DashError::InvalidArgument(String::from("seek before start")));
        }
        let target_us = media_time_ms * 1_000 + self.sample_offset_us;
        let adjusted_us = self
            .tracks
            .iter()
            .find(|t| t.frame_type == FrameType::Video)
            .map(|t| t.source.chunk_source.get_adjusted_seek(target_us))
            .unwrap_or(target_us);
        let current_us = self.pull.state.lock().decoder_position_us;
        if media_time_ms != 0 && (adjusted_us - current_us).abs() < MIN_SEEK_DISTANCE_US {
            info!("Refusing short seek ({adjusted_us} vs {current_us})");
            return Err(DashError::InvalidArgument(String::from("seek distance too short")));
        }

        info!("Seeking to {adjusted_us}us (requested {media_time_ms}ms)");
        self.deps.host.decoder_flush();
        for track in &mut self.tracks {
            if track.source.is_enabled() {
                track.source.seek_to_us(adjusted_us);
            }
        }
        {
            let mut state = self.pull.state.lock();
            state.reader_position_us = adjusted_us;
            state.decoder_position_us = adjusted_us;
            state.media_time_valid = false;
            state.current_track = None;
            state.sample_consumed = 0;
            for track in &mut state.tracks {
                track.sample_holder.clear();
                track.has_sample = false;
                track.is_eos = false;
            }
        }
        self.pull.set_eos(false);
        self.deps.qoe.report_state(StreamState::Seeking);
        self.set_state(PlayerState::Buffering);
        Ok(())
    }

    fn handle_set_rate(&mut self, rate: f32) {
        if rate == self.playback_rate.rate() || rate == 0.0 {
            return;
        }
        if self.tracks.is_empty() {
            self.playback_rate = PlaybackRate::new(rate);
            self.pull.state.lock().rate = self.playback_rate;
            return;
        }
        info!("Playback rate change {} -> {rate}", self.playback_rate.rate());
        self.set_state(PlayerState::Ready);

        for track in &mut self.tracks {
            if track.source.is_enabled() {
                track.source.disable();
            }
        }
        self.deps.host.decoder_flush();
        self.playback_rate = PlaybackRate::new(rate);

        let position_us = self.pull.state.lock().decoder_position_us;
        for track in &mut self.tracks {
            if track.frame_type == FrameType::Video {
                track.criteria.prefer_trick = self.playback_rate.is_trick();
            }
            track.source.enable(&track.criteria, position_us, self.playback_rate);
        }
        {
            let mut state = self.pull.state.lock();
            state.rate = self.playback_rate;
            state.reader_position_us = position_us;
            state.media_time_valid = false;
            state.current_track = None;
            state.sample_consumed = 0;
            for track in &mut state.tracks {
                track.sample_holder.clear();
                track.has_sample = false;
                track.is_eos = false;
            }
        }
        self.pull.set_eos(false);
        self.set_state(PlayerState::Buffering);
    }

    fn teardown(&mut self) {
        for track in &mut self.tracks {
            if track.source.is_enabled() {
                track.source.disable();
            }
        }
        self.tracks.clear();
        self.manifest_fetcher = None;
        self.pending_load = None;
        {
            let mut state = self.pull.state.lock();
            *state = PullState::default();
        }
        self.pull.set_eos(false);
        {
            let mut session = self.session.inner.lock();
            *session = SessionInfoInner::default();
        }
        self.set_state(PlayerState::Idle);
    }

    fn set_state(&mut self, new_state: PlayerState) {
        if self.state != new_state {
            info!("Player state {:?} -> {new_state:?}", self.state);
            self.state = new_state;
            self.session.inner.lock().state = Some(new_state);
        }
    }

    fn maybe_log_summaries(&mut self) {
        if self.last_track_summary.elapsed() >= TRACK_SUMMARY_PERIOD {
            self.last_track_summary = Instant::now();
            for track in &self.tracks {
                if track.source.is_enabled() {
                    debug!(
                        "{}: buffered to {}us",
                        track.name,
                        track.source.buffered_position_us()
                    );
                }
            }
        }
        if self.last_bandwidth_log.elapsed() >= BANDWIDTH_LOG_PERIOD {
            self.last_bandwidth_log = Instant::now();
            let estimate = self.deps.bandwidth_meter.estimate_bps();
            if estimate != NO_ESTIMATE {
                debug!("Bandwidth estimate {estimate}bps");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::CdmHost;
    use crate::sample_queue::{
        RollingSampleQueue, SAMPLE_FLAG_DECODE_ONLY, SAMPLE_FLAG_SYNC,
    };
    use crate::sample_source::TrackStream;

    struct StubHost {
        media_time_ms: Mutex<i64>,
    }

    impl PlayerHost for StubHost {
        fn get_media_time_ms(&self) -> i64 {
            *self.media_time_ms.lock()
        }
        fn decoder_flush(&self) {}
        fn open_cdm_session(&self) -> Result<String, DashError> {
            Ok(String::from("session"))
        }
        fn fetch_license(&self, _session_id: &str, _pssh: &[u8]) -> Result<(), DashError> {
            Ok(())
        }
        fn close_cdm_session(&self, _session_id: &str) -> Result<(), DashError> {
            Ok(())
        }
    }

    struct StubCdm;

    impl CdmHost for StubCdm {
        fn open_cdm_session(&self) -> Result<String, DashError> {
            Ok(String::from("session"))
        }
        fn fetch_license(&self, _session_id: &str, _pssh: &[u8]) -> Result<(), DashError> {
            Ok(())
        }
        fn close_cdm_session(&self, _session_id: &str) -> Result<(), DashError> {
            Ok(())
        }
    }

    fn make_track(
        name: &'static str,
        frame_type: FrameType,
    ) -> (PullTrack, Arc<RollingSampleQueue>) {
        let queue = Arc::new(RollingSampleQueue::new());
        let stream = TrackStream::new(Arc::clone(&queue));
        let track = PullTrack {
            name,
            frame_type,
            stream,
            format: None,
            sample_holder: SampleHolder::default(),
            has_sample: false,
            is_eos: false,
            check_pssh: false,
            times_selected: 0,
        };
        (track, queue)
    }

    fn commit(queue: &RollingSampleQueue, time_us: i64, flags: u32, payload: &[u8]) {
        let offset = queue.write_sample_data(payload);
        queue.commit_sample(time_us, 1_000, flags, offset, payload.len() as i32, None);
    }

    #[test]
    fn drift_bound_rejects_runahead_track() {
        let pull = PullShared::default();
        let (video, vq) = make_track("video", FrameType::Video);
        let (audio, aq) = make_track("audio", FrameType::Audio);
        commit(&vq, 7_000_000, SAMPLE_FLAG_SYNC, b"v");
        commit(&aq, 0, SAMPLE_FLAG_SYNC, b"a");

        let mut guard = pull.state.lock();
        let state = &mut *guard;
        state.tracks = vec![video, audio];
        state.media_time_valid = true;
        state.decoder_position_us = 0;
        pull.fill_track_holders(state);

        // Audio at 0 is deliverable; video at 7s exceeds decoder + 5s.
        assert_eq!(pull.select_next_track(state), Some(1));
        state.tracks[1].has_sample = false;
        assert_eq!(pull.select_next_track(state), None);

        // Once the decoder advances, the video sample falls inside the bound.
        state.decoder_position_us = 3_000_000;
        assert_eq!(pull.select_next_track(state), Some(0));
    }

    #[test]
    fn text_not_delivered_before_media_time_known() {
        let pull = PullShared::default();
        let (video, vq) = make_track("video", FrameType::Video);
        let (cc, cq) = make_track("cc", FrameType::Cc);
        commit(&vq, 1_000_000, SAMPLE_FLAG_SYNC, b"v");
        commit(&cq, 0, SAMPLE_FLAG_SYNC, b"c");

        let mut guard = pull.state.lock();
        let state = &mut *guard;
        state.tracks = vec![video, cc];
        state.media_time_valid = false;
        pull.fill_track_holders(state);

        // Text would sort first by time but is gated until media time is known.
        assert_eq!(pull.select_next_track(state), Some(0));
        state.media_time_valid = true;
        state.decoder_position_us = 0;
        assert_eq!(pull.select_next_track(state), Some(1));
    }

    #[test]
    fn decode_only_audio_samples_are_discarded() {
        let pull = PullShared::default();
        let (audio, aq) = make_track("audio", FrameType::Audio);
        commit(&aq, 0, SAMPLE_FLAG_SYNC | SAMPLE_FLAG_DECODE_ONLY, b"d0");
        commit(&aq, 10, SAMPLE_FLAG_SYNC | SAMPLE_FLAG_DECODE_ONLY, b"d1");
        commit(&aq, 20, SAMPLE_FLAG_SYNC, b"p");

        let mut guard = pull.state.lock();
        let state = &mut *guard;
        state.tracks = vec![audio];
        pull.fill_track_holders(state);

        assert!(state.tracks[0].has_sample);
        assert_eq!(state.tracks[0].sample_holder.time_us, 20);
    }

    #[test]
    fn decode_only_video_passes_through() {
        let pull = PullShared::default();
        let (video, vq) = make_track("video", FrameType::Video);
        commit(&vq, 0, SAMPLE_FLAG_SYNC | SAMPLE_FLAG_DECODE_ONLY, b"v");

        let mut guard = pull.state.lock();
        let state = &mut *guard;
        state.tracks = vec![video];
        pull.fill_track_holders(state);
        assert!(state.tracks[0].has_sample);
        assert_eq!(state.tracks[0].sample_holder.time_us, 0);
    }

    #[test]
    fn copy_frame_fragments_large_samples() {
        let pull = PullShared::default();
        let (video, vq) = make_track("video", FrameType::Video);
        commit(&vq, 1_000_000, SAMPLE_FLAG_SYNC, b"0123456789");
        pull.state.lock().tracks = vec![video];

        let host = StubHost { media_time_ms: Mutex::new(-1) };
        let drm = DrmSessionManager::new(Arc::new(StubCdm));
        let qoe = QoeManager::new();
        let mut info = FrameInfo::default();
        let mut buf = [0u8; 4];

        let n = pull.copy_frame(&host, &drm, &qoe, &mut buf, &mut info);
        assert_eq!(n, 4);
        assert_ne!(info.flags & FRAME_FLAG_FIRST_FRAGMENT, 0);
        assert_ne!(info.flags & FRAME_FLAG_HAS_PTS, 0);
        assert_eq!(info.flags & FRAME_FLAG_LAST_FRAGMENT, 0);
        assert_eq!(info.pts, 90_000);
        assert_eq!(&buf, b"0123");

        let n = pull.copy_frame(&host, &drm, &qoe, &mut buf, &mut info);
        assert_eq!(n, 4);
        assert_eq!(info.flags & FRAME_FLAG_FIRST_FRAGMENT, 0);
        assert_eq!(&buf, b"4567");

        let n = pull.copy_frame(&host, &drm, &qoe, &mut buf, &mut info);
        assert_eq!(n, 2);
        assert_ne!(info.flags & FRAME_FLAG_LAST_FRAGMENT, 0);
        assert_eq!(&buf[..2], b"89");

        // Queue drained, stream not ended: no frame yet.
        let n = pull.copy_frame(&host, &drm, &qoe, &mut buf, &mut info);
        assert_eq!(n, -1);
        assert!(!pull.is_eos());
    }
}

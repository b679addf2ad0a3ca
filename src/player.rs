//! The public player surface: an opaque handle over the driver task, codec queries, the
//! pull-read entry point and host-reported playback state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::bandwidth::BandwidthMeter;
use crate::demux::{DemuxerFactory, MediaFormat};
use crate::driver::{Driver, DriverCmd, DriverDeps, PullShared, SessionInfo};
use crate::drm::{CdmHost, DrmSessionManager};
use crate::qoe::{QoeManager, StreamState, VideoErrorCode};
use crate::upstream::{AuthToken, HttpDataSourceFactory, TransferListener};
use crate::xml::XmlManifestParser;
use crate::{DashError, SystemClock};

pub use crate::driver::{
    FrameInfo, FrameType, DEFAULT_LIVE_EDGE_LATENCY_US, FRAME_FLAG_FIRST_FRAGMENT,
    FRAME_FLAG_HAS_PTS, FRAME_FLAG_LAST_FRAGMENT,
};

/// Callbacks the core invokes on the host. Media-time queries and decoder flushes come from the
/// driver task and the pull thread; CDM calls come from the DRM worker thread.
pub trait PlayerHost: Send + Sync {
    /// Current decoder position in milliseconds on the presentation timeline, or -1 before the
    /// first frame is decoded. Must be monotonic while playing forward; never rolls over.
    fn get_media_time_ms(&self) -> i64;

    /// Flush the decoder's byte stream. Called on seeks and rate changes.
    fn decoder_flush(&self);

    fn open_cdm_session(&self) -> Result<String, DashError>;
    fn fetch_license(&self, session_id: &str, pssh: &[u8]) -> Result<(), DashError>;
    fn close_cdm_session(&self, session_id: &str) -> Result<(), DashError>;
}

struct CdmBridge(Arc<dyn PlayerHost>);

impl CdmHost for CdmBridge {
    fn open_cdm_session(&self) -> Result<String, DashError> {
        self.0.open_cdm_session()
    }

    fn fetch_license(&self, session_id: &str, pssh: &[u8]) -> Result<(), DashError> {
        self.0.fetch_license(session_id, pssh)
    }

    fn close_cdm_session(&self, session_id: &str) -> Result<(), DashError> {
        self.0.close_cdm_session(session_id)
    }
}

/// Static player configuration, passed at creation.
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    /// When false, only the video track's transfers feed the bandwidth meter.
    pub all_tracks_metered: bool,
    /// Distance behind the live edge at which live playback starts.
    pub live_edge_latency_ms: i64,
    /// Timeout applied to HTTP requests.
    pub request_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        PlayerConfig {
            all_tracks_metered: true,
            live_edge_latency_ms: DEFAULT_LIVE_EDGE_LATENCY_US / 1_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    Unsupported,
    None,
    H264,
}

#[derive(Debug, Clone)]
pub struct VideoCodecSettings {
    pub codec: VideoCodec,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Unsupported,
    None,
    Aac,
    Ac3,
    Eac3,
    Mp3,
    Dts,
}

#[derive(Debug, Clone)]
pub struct AudioCodecSettings {
    pub codec: AudioCodec,
    pub num_channels: i32,
    pub channel_layout: u64,
    pub sample_format: i32,
    pub sample_rate: i32,
    pub bitrate: i32,
    pub bps: i32,
    pub blockalign: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcCodec {
    Unsupported,
    None,
    RawCc,
    WebVtt,
}

#[derive(Debug, Clone)]
pub struct CcCodecSettings {
    pub codec: CcCodec,
}

/// The published subset of playback error codes a host may report back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackErrorCode {
    MediaFetchError,
    MediaDrmError,
    MediaUnknownError,
}

fn video_codec_of(format: &MediaFormat) -> VideoCodec {
    if format.codecs.starts_with("avc") || format.codecs.starts_with("h264") {
        VideoCodec::H264
    } else {
        VideoCodec::Unsupported
    }
}

fn audio_codec_of(format: &MediaFormat) -> AudioCodec {
    let codecs = format.codecs.as_str();
    if codecs == "mp4a.40.34" || format.mime_type == "audio/mpeg" {
        AudioCodec::Mp3
    } else if codecs.starts_with("mp4a") {
        AudioCodec::Aac
    } else if codecs.starts_with("ac-3") {
        AudioCodec::Ac3
    } else if codecs.starts_with("ec-3") {
        AudioCodec::Eac3
    } else if codecs.starts_with("dts") {
        AudioCodec::Dts
    } else {
        AudioCodec::Unsupported
    }
}

fn cc_codec_of(format: &MediaFormat) -> CcCodec {
    match format.mime_type.as_str() {
        "application/x-rawcc" => CcCodec::RawCc,
        "text/vtt" | "application/x-mp4vtt" => CcCodec::WebVtt,
        _ => CcCodec::Unsupported,
    }
}

/// FFmpeg-style channel layout bitmask for common channel counts.
fn default_channel_layout(channels: i32) -> u64 {
    match channels {
        1 => 0x4,         // front center
        2 => 0x3,         // front left + right
        6 => 0x3F,        // 5.1
        8 => 0x63F,       // 7.1
        _ => 0,
    }
}

struct PlayerAttributes {
    auth: AuthToken,
    license_url: Mutex<Option<String>>,
}

/// A DASH player instance. Control methods block briefly while the driver task processes the
/// request; `copy_frame` runs on the caller's thread against shared pull state and is safe to
/// call from a dedicated decoder thread.
pub struct DashPlayer {
    cmd_tx: mpsc::UnboundedSender<DriverCmd>,
    pull: Arc<PullShared>,
    session: Arc<SessionInfo>,
    host: Arc<dyn PlayerHost>,
    drm: Arc<DrmSessionManager>,
    qoe: Arc<QoeManager>,
    attributes: PlayerAttributes,
    http: reqwest::blocking::Client,
    // Declared last so the command channel closes before the runtime shuts down, letting the
    // driver task drain and tear down cleanly.
    _runtime: tokio::runtime::Runtime,
}

impl DashPlayer {
    /// Creates a player. `demuxer_factory` supplies the external container demuxers; the core
    /// only routes bytes through them.
    pub fn new(
        host: Arc<dyn PlayerHost>,
        demuxer_factory: Arc<dyn DemuxerFactory>,
        config: PlayerConfig,
    ) -> Result<DashPlayer, DashError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|_| DashError::Network(String::from("building HTTP client")))?;
        let auth = AuthToken::default();
        let bandwidth_meter = Arc::new(BandwidthMeter::new());
        let metered_factory = Arc::new(HttpDataSourceFactory::new(
            http.clone(),
            auth.clone(),
            Some(Arc::clone(&bandwidth_meter) as Arc<dyn TransferListener>),
        ));
        let unmetered_factory =
            Arc::new(HttpDataSourceFactory::new(http.clone(), auth.clone(), None));
        Self::assemble(
            host,
            demuxer_factory,
            config,
            Arc::new(XmlManifestParser),
            metered_factory,
            unmetered_factory,
            bandwidth_meter,
            http,
            auth,
        )
    }

    /// Creates a player with externally supplied transport and parsing collaborators. Used to
    /// drive the full pipeline against scripted data sources.
    pub fn with_collaborators(
        host: Arc<dyn PlayerHost>,
        demuxer_factory: Arc<dyn DemuxerFactory>,
        config: PlayerConfig,
        parser: Arc<dyn crate::manifest_fetcher::ManifestParser>,
        metered_factory: Arc<dyn crate::upstream::DataSourceFactory>,
        unmetered_factory: Arc<dyn crate::upstream::DataSourceFactory>,
    ) -> Result<DashPlayer, DashError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|_| DashError::Network(String::from("building HTTP client")))?;
        let auth = AuthToken::default();
        let bandwidth_meter = Arc::new(BandwidthMeter::new());
        Self::assemble(
            host,
            demuxer_factory,
            config,
            parser,
            metered_factory,
            unmetered_factory,
            bandwidth_meter,
            http,
            auth,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        host: Arc<dyn PlayerHost>,
        demuxer_factory: Arc<dyn DemuxerFactory>,
        config: PlayerConfig,
        parser: Arc<dyn crate::manifest_fetcher::ManifestParser>,
        metered_factory: Arc<dyn crate::upstream::DataSourceFactory>,
        unmetered_factory: Arc<dyn crate::upstream::DataSourceFactory>,
        bandwidth_meter: Arc<BandwidthMeter>,
        http: reqwest::blocking::Client,
        auth: AuthToken,
    ) -> Result<DashPlayer, DashError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dash-driver")
            .enable_all()
            .build()
            .map_err(|e| DashError::Unavailable(format!("creating runtime: {e}")))?;

        let drm = Arc::new(DrmSessionManager::new(Arc::new(CdmBridge(Arc::clone(&host)))));
        let qoe = Arc::new(QoeManager::new());
        let pull = Arc::new(PullShared::default());
        let session = Arc::new(SessionInfo::default());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let deps = DriverDeps {
            host: Arc::clone(&host),
            drm: Arc::clone(&drm),
            qoe: Arc::clone(&qoe),
            clock: Arc::new(SystemClock),
            runtime: runtime.handle().clone(),
            parser,
            metered_factory,
            unmetered_factory,
            demuxer_factory,
            bandwidth_meter,
            all_tracks_metered: config.all_tracks_metered,
            live_edge_latency_us: config.live_edge_latency_ms * 1_000,
        };
        let driver =
            Driver::new(deps, cmd_tx.clone(), cmd_rx, Arc::clone(&pull), Arc::clone(&session));
        runtime.spawn(driver.run());

        Ok(DashPlayer {
            cmd_tx,
            pull,
            session,
            host,
            drm,
            qoe,
            attributes: PlayerAttributes { auth, license_url: Mutex::new(None) },
            http,
            _runtime: runtime,
        })
    }

    /// Loads the manifest at `url` and begins buffering from `initial_time_sec`. Blocks until
    /// both the audio and video codecs have been announced, or fails after the startup window.
    pub fn load(&self, url: &str, initial_time_sec: f32) -> Result<(), DashError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Load { url: String::from(url), initial_time_sec, reply })
            .map_err(|_| DashError::Unavailable(String::from("player is shut down")))?;
        rx.blocking_recv()
            .map_err(|_| DashError::Unavailable(String::from("player is shut down")))?
    }

    /// Tears the pipeline down, canceling outstanding loads. Blocks until all tracks have been
    /// disabled.
    pub fn unload(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(DriverCmd::Unload { reply }).is_ok() {
            let _ = rx.blocking_recv();
        }
    }

    pub fn video_codec_settings(&self) -> Result<VideoCodecSettings, DashError> {
        Ok(match self.session.video_format() {
            Some(format) => VideoCodecSettings {
                codec: video_codec_of(&format),
                width: format.width,
                height: format.height,
            },
            None => VideoCodecSettings { codec: VideoCodec::None, width: 0, height: 0 },
        })
    }

    pub fn audio_codec_settings(&self) -> Result<AudioCodecSettings, DashError> {
        Ok(match self.session.audio_format() {
            Some(format) => AudioCodecSettings {
                codec: audio_codec_of(&format),
                num_channels: format.channel_count,
                channel_layout: default_channel_layout(format.channel_count),
                sample_format: -1,
                sample_rate: format.sample_rate,
                bitrate: format.bitrate,
                bps: 16,
                blockalign: 0,
            },
            None => AudioCodecSettings {
                codec: AudioCodec::None,
                num_channels: 0,
                channel_layout: 0,
                sample_format: -1,
                sample_rate: 0,
                bitrate: 0,
                bps: 0,
                blockalign: 0,
            },
        })
    }

    pub fn cc_codec_settings(&self) -> Result<CcCodecSettings, DashError> {
        Ok(match self.session.cc_format() {
            Some(format) => CcCodecSettings { codec: cc_codec_of(&format) },
            None => CcCodecSettings { codec: CcCodec::None },
        })
    }

    /// The master-timeline offset the consumer should treat as time zero, in milliseconds.
    pub fn first_time_ms(&self) -> i64 {
        self.session.sample_offset_ms()
    }

    pub fn duration_ms(&self) -> i64 {
        self.session.duration_ms()
    }

    /// Selected stream counts per period: (video, audio, text).
    pub fn stream_counts(&self) -> (i32, i32, i32) {
        self.session.stream_counts()
    }

    pub fn is_eos(&self) -> bool {
        self.pull.is_eos()
    }

    pub fn seek(&self, media_time_ms: i64) -> Result<(), DashError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DriverCmd::Seek { media_time_ms, reply })
            .map_err(|_| DashError::Unavailable(String::from("player is shut down")))?;
        rx.blocking_recv()
            .map_err(|_| DashError::Unavailable(String::from("player is shut down")))?
    }

    pub fn set_playback_rate(&self, rate: f32) {
        let _ = self.cmd_tx.send(DriverCmd::SetRate { rate });
    }

    /// Copies (a fragment of) the next sample into `buf`. Returns the number of bytes copied,
    /// 0 once the stream has ended, or -1 when no frame is available yet.
    pub fn copy_frame(&self, buf: &mut [u8], info: &mut FrameInfo) -> i64 {
        self.pull.copy_frame(self.host.as_ref(), &self.drm, &self.qoe, buf, info)
    }

    /// Sets a named attribute. Recognized: `auth` (bearer token for HTTP requests) and
    /// `license_url` (license server consulted by [`DashPlayer::make_license_request`]).
    /// Unknown names are ignored with a warning.
    pub fn set_attribute(&self, name: &str, value: &str) {
        match name {
            "auth" => self.attributes.auth.set(value),
            "license_url" => {
                *self.attributes.license_url.lock() = Some(String::from(value));
            }
            _ => warn!("Ignoring unknown attribute {name}"),
        }
    }

    pub fn report_playback_state(&self, state: StreamState) {
        self.qoe.report_state(state);
    }

    pub fn report_playback_error(&self, code: PlaybackErrorCode, details: &str, is_fatal: bool) {
        let code = match code {
            PlaybackErrorCode::MediaFetchError => VideoErrorCode::MediaFetchError,
            PlaybackErrorCode::MediaDrmError => VideoErrorCode::MediaDrmError,
            PlaybackErrorCode::MediaUnknownError => VideoErrorCode::MediaUnknownError,
        };
        self.qoe.report_video_error(code, details, is_fatal);
    }

    /// Posts a CDM key message to the configured license server and returns the license body.
    /// Called on the DRM worker thread from within the host's `fetch_license` implementation.
    pub fn make_license_request(&self, key_message: &[u8]) -> Result<Vec<u8>, DashError> {
        let url = self
            .attributes
            .license_url
            .lock()
            .clone()
            .ok_or_else(|| DashError::InvalidArgument(String::from("license_url not set")))?;
        let mut request = self.http.post(&url).body(key_message.to_vec());
        if let Some(token) = self.attributes.auth.get() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|e| DashError::Network(format!("license request: {e}")))?
            .error_for_status()
            .map_err(|e| DashError::Drm(format!("license request rejected: {e}")))?;
        let body = response
            .bytes()
            .map_err(|e| DashError::Network(format!("reading license response: {e}")))?;
        Ok(body.to_vec())
    }
}

impl Drop for DashPlayer {
    fn drop(&mut self) {
        self.unload();
    }
}

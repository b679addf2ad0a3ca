//! Periodic manifest refresh for dynamic presentations.
//!
//! The fetcher owns at most one in-flight request; `request_refresh` while one is running is a
//! no-op. Each successful fetch publishes a new immutable [`MediaPresentation`] snapshot that
//! consumers pick up by pointer comparison, and honours `Location` redirects for the next
//! refresh.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::mpd::MediaPresentation;
use crate::upstream::{CancelFlag, DataSourceFactory, DataSpec, LENGTH_UNBOUNDED};
use crate::{ClockRef, DashError};

/// Why a refresh failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFetchError {
    Parsing,
    Network,
    Unknown,
}

/// Receives refresh lifecycle events. All callbacks run on the fetch task.
pub trait ManifestEventListener: Send + Sync {
    fn on_refresh_started(&self) {}
    fn on_refreshed(&self) {}
    fn on_error(&self, _error: ManifestFetchError) {}
}

/// Turns fetched manifest bytes into a snapshot. The production implementation is
/// [`crate::xml::XmlManifestParser`].
pub trait ManifestParser: Send + Sync {
    fn parse(&self, url: &str, data: &[u8]) -> Result<MediaPresentation, DashError>;
}

struct FetcherInner {
    manifest: Option<Arc<MediaPresentation>>,
    manifest_url: String,
    load_start_us: i64,
    in_flight: bool,
    enabled_count: i32,
    last_error: Option<ManifestFetchError>,
}

pub struct ManifestFetcher {
    parser: Arc<dyn ManifestParser>,
    data_source_factory: Arc<dyn DataSourceFactory>,
    clock: ClockRef,
    runtime: tokio::runtime::Handle,
    listener: Mutex<Option<Arc<dyn ManifestEventListener>>>,
    inner: Mutex<FetcherInner>,
}

impl ManifestFetcher {
    pub fn new(
        manifest_url: &str,
        parser: Arc<dyn ManifestParser>,
        data_source_factory: Arc<dyn DataSourceFactory>,
        clock: ClockRef,
        runtime: tokio::runtime::Handle,
    ) -> ManifestFetcher {
        ManifestFetcher {
            parser,
            data_source_factory,
            clock,
            runtime,
            listener: Mutex::new(None),
            inner: Mutex::new(FetcherInner {
                manifest: None,
                manifest_url: String::from(manifest_url),
                load_start_us: 0,
                in_flight: false,
                enabled_count: 0,
                last_error: None,
            }),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn ManifestEventListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn has_manifest(&self) -> bool {
        self.inner.lock().manifest.is_some()
    }

    pub fn current(&self) -> Option<Arc<MediaPresentation>> {
        self.inner.lock().manifest.clone()
    }

    /// When the most recent refresh attempt started, as epoch microseconds.
    pub fn load_start_timestamp_us(&self) -> i64 {
        self.inner.lock().load_start_us
    }

    /// Buffering may continue unless the last refresh failed to parse (a network blip will be
    /// retried; a manifest we cannot understand will not get better on its own).
    pub fn can_continue_buffering(&self) -> bool {
        self.inner.lock().last_error != Some(ManifestFetchError::Parsing)
    }

    /// Reference-counts users of the refresh loop.
    pub fn enable(&self) {
        self.inner.lock().enabled_count += 1;
    }

    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.enabled_count = (inner.enabled_count - 1).max(0);
    }

    /// Kicks off a refresh unless one is already in flight.
    pub fn request_refresh(self: &Arc<Self>) {
        let url = {
            let mut inner = self.inner.lock();
            if inner.in_flight {
                debug!("Manifest refresh already in flight");
                return;
            }
            inner.in_flight = true;
            inner.load_start_us = self.clock.now_us();
            inner.manifest_url.clone()
        };
        if let Some(listener) = self.listener.lock().clone() {
            listener.on_refresh_started();
        }
        let fetcher = Arc::clone(self);
        self.runtime.spawn_blocking(move || fetcher.run_refresh(&url));
    }

    fn run_refresh(&self, url: &str) {
        let result = self.fetch_and_parse(url);
        let listener = self.listener.lock().clone();
        match result {
            Ok(manifest) => {
                info!(
                    "Manifest refreshed: {} period(s), dynamic={}",
                    manifest.period_count(),
                    manifest.dynamic
                );
                let mut inner = self.inner.lock();
                if let Some(location) = &manifest.location {
                    inner.manifest_url = location.clone();
                }
                inner.manifest = Some(Arc::new(manifest));
                inner.last_error = None;
                inner.in_flight = false;
                drop(inner);
                if let Some(listener) = listener {
                    listener.on_refreshed();
                }
            }
            Err(e) => {
                let kind = match &e {
                    DashError::Parsing(_) => ManifestFetchError::Parsing,
                    DashError::Network(_)
                    | DashError::NetworkTimeout(_)
                    | DashError::NetworkConnect(_)
                    | DashError::Io(_, _) => ManifestFetchError::Network,
                    _ => ManifestFetchError::Unknown,
                };
                warn!("Manifest refresh failed ({kind:?}): {e}");
                let mut inner = self.inner.lock();
                inner.last_error = Some(kind);
                inner.in_flight = false;
                drop(inner);
                if let Some(listener) = listener {
                    listener.on_error(kind);
                }
            }
        }
    }

    fn fetch_and_parse(&self, url: &str) -> Result<MediaPresentation, DashError> {
        let mut source = self.data_source_factory.create();
        let spec = DataSpec::new(url, 0, LENGTH_UNBOUNDED, None);
        let cancel = CancelFlag::new();
        let result = (|| {
            source.open(&spec, &cancel)?;
            let mut data = Vec::new();
            let mut buf = [0u8; 16 * 1024];
            loop {
                match source.read(&mut buf)? {
                    0 => break,
                    n => data.extend_from_slice(&buf[..n]),
                }
            }
            Ok(data)
        })();
        source.close();
        self.parser.parse(url, &result?)
    }
}

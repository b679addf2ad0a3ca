//! The network seam: byte-range fetches with cancellation.
//!
//! The core never talks to the network directly; every fetch goes through the [`DataSource`]
//! trait so that tests can script transfers and so transfer accounting flows into the bandwidth
//! meter. [`HttpDataSource`] is the production implementation over a blocking `reqwest` client.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::header::{HeaderValue, AUTHORIZATION, RANGE};
use tracing::{debug, warn};

use crate::DashError;

/// Length value meaning "to the end of the resource".
pub const LENGTH_UNBOUNDED: i64 = -1;

/// Defines a byte-range request against a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSpec {
    pub uri: String,
    /// Absolute position of the first byte requested.
    pub position: i64,
    /// Number of bytes requested, or [`LENGTH_UNBOUNDED`].
    pub length: i64,
    /// Key under which a caching data source may address this resource.
    pub cache_key: Option<String>,
}

impl DataSpec {
    pub fn new(uri: &str, position: i64, length: i64, cache_key: Option<&str>) -> DataSpec {
        DataSpec {
            uri: String::from(uri),
            position,
            length,
            cache_key: cache_key.map(String::from),
        }
    }

    /// The spec covering what remains of this request after `bytes_loaded` bytes have already
    /// been consumed, used to resume a partially-completed load.
    pub fn remainder(&self, bytes_loaded: i64) -> DataSpec {
        if bytes_loaded == 0 {
            return self.clone();
        }
        DataSpec {
            uri: self.uri.clone(),
            position: self.position + bytes_loaded,
            length: if self.length == LENGTH_UNBOUNDED {
                LENGTH_UNBOUNDED
            } else {
                self.length - bytes_loaded
            },
            cache_key: self.cache_key.clone(),
        }
    }
}

/// Cooperative cancellation flag for an in-flight load. Polled between reads; setting it makes
/// the load wind down without surfacing an error.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives `(bytes, elapsed)` accounting for each completed transfer. Invoked on whichever
/// thread ran the transfer.
pub trait TransferListener: Send + Sync {
    fn on_transfer(&self, bytes: i64, elapsed: Duration);
}

/// Blocking byte-range source. `open` resolves the request and returns the resolved length in
/// bytes when known; `read` returns `Ok(0)` at end of input. Implementations must tolerate
/// `close` without a preceding successful `open`.
pub trait DataSource: Send {
    fn open(&mut self, spec: &DataSpec, cancel: &CancelFlag) -> Result<i64, DashError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DashError>;
    fn close(&mut self);
}

/// Factory for per-load data sources. One chunk load opens exactly one source.
pub trait DataSourceFactory: Send + Sync {
    fn create(&self) -> Box<dyn DataSource>;
}

/// Shared, late-settable bearer token used for all HTTP requests
/// (`set_attribute("auth", ...)`).
#[derive(Debug, Clone, Default)]
pub struct AuthToken(Arc<Mutex<Option<String>>>);

impl AuthToken {
    pub fn set(&self, token: &str) {
        *self.0.lock() = Some(String::from(token));
    }

    pub fn get(&self) -> Option<String> {
        self.0.lock().clone()
    }
}

struct HttpTransfer {
    response: reqwest::blocking::Response,
    started: Instant,
    bytes_read: i64,
}

/// [`DataSource`] over HTTP(S) byte-range requests.
pub struct HttpDataSource {
    client: reqwest::blocking::Client,
    auth: AuthToken,
    listener: Option<Arc<dyn TransferListener>>,
    transfer: Option<HttpTransfer>,
}

impl HttpDataSource {
    pub fn new(
        client: reqwest::blocking::Client,
        auth: AuthToken,
        listener: Option<Arc<dyn TransferListener>>,
    ) -> HttpDataSource {
        HttpDataSource { client, auth, listener, transfer: None }
    }
}

/// Classifies a transport failure for the error surface. Server-overload statuses count as
/// timeouts so the caller's retry policy treats them as transient rather than terminal.
fn http_error(context: &str, e: reqwest::Error) -> DashError {
    use reqwest::StatusCode;
    let overloaded = matches!(
        e.status(),
        Some(StatusCode::REQUEST_TIMEOUT)
            | Some(StatusCode::TOO_MANY_REQUESTS)
            | Some(StatusCode::SERVICE_UNAVAILABLE)
            | Some(StatusCode::GATEWAY_TIMEOUT)
    );
    let detail = format!("{context}: {e:?}");
    match e {
        e if e.is_timeout() || overloaded => DashError::NetworkTimeout(detail),
        e if e.is_connect() => DashError::NetworkConnect(detail),
        _ => DashError::Network(detail),
    }
}

impl DataSource for HttpDataSource {
    fn open(&mut self, spec: &DataSpec, cancel: &CancelFlag) -> Result<i64, DashError> {
        if cancel.is_set() {
            return Ok(0);
        }
        let mut req = self.client.get(&spec.uri);
        if spec.position != 0 || spec.length != LENGTH_UNBOUNDED {
            let range = if spec.length == LENGTH_UNBOUNDED {
                format!("bytes={}-", spec.position)
            } else {
                format!("bytes={}-{}", spec.position, spec.position + spec.length - 1)
            };
            req = req.header(RANGE, range);
        }
        if let Some(token) = self.auth.get() {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(hv) => req = req.header(AUTHORIZATION, hv),
                Err(_) => warn!("Ignoring auth token with non-header-safe characters"),
            }
        }
        let response = req
            .send()
            .map_err(|e| http_error("opening media segment", e))?
            .error_for_status()
            .map_err(|e| http_error("fetching media segment", e))?;
        let resolved = match response.content_length() {
            Some(len) => len as i64,
            None => spec.length,
        };
        debug!("Opened {} [{}+{}] -> {resolved}", spec.uri, spec.position, spec.length);
        self.transfer = Some(HttpTransfer { response, started: Instant::now(), bytes_read: 0 });
        Ok(resolved)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DashError> {
        let transfer = self
            .transfer
            .as_mut()
            .ok_or_else(|| DashError::Other(String::from("read on unopened data source")))?;
        let n = transfer
            .response
            .read(buf)
            .map_err(|e| DashError::Io(e, String::from("reading media segment")))?;
        transfer.bytes_read += n as i64;
        Ok(n)
    }

    fn close(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            if let Some(listener) = &self.listener {
                listener.on_transfer(transfer.bytes_read, transfer.started.elapsed());
            }
        }
    }
}

/// Factory handing out [`HttpDataSource`] instances sharing one client, auth token and
/// transfer listener.
pub struct HttpDataSourceFactory {
    client: reqwest::blocking::Client,
    auth: AuthToken,
    listener: Option<Arc<dyn TransferListener>>,
}

impl HttpDataSourceFactory {
    pub fn new(
        client: reqwest::blocking::Client,
        auth: AuthToken,
        listener: Option<Arc<dyn TransferListener>>,
    ) -> HttpDataSourceFactory {
        HttpDataSourceFactory { client, auth, listener }
    }
}

impl DataSourceFactory for HttpDataSourceFactory {
    fn create(&self) -> Box<dyn DataSource> {
        Box::new(HttpDataSource::new(
            self.client.clone(),
            self.auth.clone(),
            self.listener.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_advances_position_and_shrinks_length() {
        let spec = DataSpec::new("http://cdn/seg.m4s", 100, 500, Some("c.v1.0"));
        let rest = spec.remainder(200);
        assert_eq!(rest.position, 300);
        assert_eq!(rest.length, 300);
        assert_eq!(rest.uri, spec.uri);
        assert_eq!(rest.cache_key, spec.cache_key);
    }

    #[test]
    fn remainder_of_unbounded_stays_unbounded() {
        let spec = DataSpec::new("http://cdn/seg.m4s", 0, LENGTH_UNBOUNDED, None);
        let rest = spec.remainder(64);
        assert_eq!(rest.position, 64);
        assert_eq!(rest.length, LENGTH_UNBOUNDED);
    }

    #[test]
    fn cancel_flag_is_sticky() {
        let flag = CancelFlag::new();
        assert!(!flag.is_set());
        let clone = flag.clone();
        clone.set();
        assert!(flag.is_set());
    }
}

//! DRM initialization data and CDM session coordination.
//!
//! The core never implements a CDM. It asks the host (through [`CdmHost`]) to open sessions and
//! fetch licenses, and guarantees that at most one license request is in flight per PSSH blob,
//! with `join` semantics for consumers that must wait on the outcome.

use std::collections::HashMap;
use std::thread;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::DashError;

/// Widevine scheme UUID, the default scheme consulted when mapped init data is present.
pub const WIDEVINE_UUID: Uuid = Uuid::from_bytes([
    0xed, 0xef, 0x8b, 0xa9, 0x79, 0xd6, 0x4a, 0xce, 0xa3, 0xc8, 0x27, 0xdc, 0xd5, 0x1d, 0x21,
    0xed,
]);

/// One scheme's initialization data blob (typically a PSSH box payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemeInitData {
    pub mime_type: String,
    pub data: Bytes,
}

impl SchemeInitData {
    pub fn new(mime_type: &str, data: Bytes) -> SchemeInitData {
        SchemeInitData { mime_type: String::from(mime_type), data }
    }
}

/// Initialization data for a protected stream. Shared (reference-counted) between the period it
/// was declared on and every encrypted sample that originated from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrmInitData {
    /// Scheme-specific blobs keyed by scheme UUID.
    Mapped(HashMap<Uuid, SchemeInitData>),
    /// A single blob applying to whatever scheme the CDM selects.
    Universal(SchemeInitData),
}

impl DrmInitData {
    /// The init data to use for `uuid`, falling back to universal data when present.
    pub fn get(&self, uuid: &Uuid) -> Option<&SchemeInitData> {
        match self {
            DrmInitData::Mapped(map) => map.get(uuid),
            DrmInitData::Universal(data) => Some(data),
        }
    }

    /// The PSSH blob a license request should be made with: the Widevine entry when mapped,
    /// else any available entry.
    pub fn license_pssh(&self) -> Option<&SchemeInitData> {
        match self {
            DrmInitData::Mapped(map) => {
                map.get(&WIDEVINE_UUID).or_else(|| map.values().next())
            }
            DrmInitData::Universal(data) => Some(data),
        }
    }
}

/// Host-side CDM operations. All calls may block (they run on the DRM worker thread).
pub trait CdmHost: Send + Sync {
    /// Opens a CDM session, returning its id.
    fn open_cdm_session(&self) -> Result<String, DashError>;

    /// Requests a license for `pssh` within an open session.
    fn fetch_license(&self, session_id: &str, pssh: &[u8]) -> Result<(), DashError>;

    fn close_cdm_session(&self, session_id: &str) -> Result<(), DashError>;
}

#[derive(Default)]
struct SessionSlot {
    session_id: Option<String>,
    done: bool,
}

#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<Vec<u8>, SessionSlot>>,
    completed: Condvar,
}

/// Tracks one CDM session per PSSH blob. Concurrent `request` calls for the same PSSH collapse
/// into a single in-flight license request; `join` blocks until that request settles.
pub struct DrmSessionManager {
    cdm: std::sync::Arc<dyn CdmHost>,
    table: std::sync::Arc<SessionTable>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DrmSessionManager {
    pub fn new(cdm: std::sync::Arc<dyn CdmHost>) -> DrmSessionManager {
        DrmSessionManager {
            cdm,
            table: std::sync::Arc::new(SessionTable::default()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Ensures a license request for `pssh` exists or is in flight. Returns immediately in
    /// either case; completion is observed through [`DrmSessionManager::join`].
    pub fn request(&self, pssh: &[u8]) {
        let mut sessions = self.table.sessions.lock();
        if sessions.contains_key(pssh) {
            debug!("License for pssh already present or in flight");
            return;
        }
        sessions.insert(pssh.to_vec(), SessionSlot::default());
        drop(sessions);

        let cdm = std::sync::Arc::clone(&self.cdm);
        let table = std::sync::Arc::clone(&self.table);
        let owned_pssh = pssh.to_vec();
        let spawned = thread::Builder::new()
            .name(String::from("cdm-session"))
            .spawn(move || run_license_request(cdm, table, owned_pssh));
        match spawned {
            Ok(handle) => self.workers.lock().push(handle),
            Err(e) => {
                error!("Failed to spawn cdm session thread: {e}");
                let mut sessions = self.table.sessions.lock();
                if let Some(slot) = sessions.get_mut(pssh) {
                    slot.done = true;
                }
                self.table.completed.notify_all();
            }
        }
    }

    /// Waits for the license request covering `pssh` to settle. Returns true iff a session was
    /// established. Returns false immediately when no request was ever made.
    pub fn join(&self, pssh: &[u8]) -> bool {
        let mut sessions = self.table.sessions.lock();
        loop {
            match sessions.get(pssh) {
                None => return false,
                Some(slot) if slot.done => return slot.session_id.is_some(),
                Some(_) => {
                    debug!("Waiting for in-flight license request");
                    self.table.completed.wait(&mut sessions);
                }
            }
        }
    }

    /// True when a session exists for `pssh` right now, without blocking.
    pub fn has_session(&self, pssh: &[u8]) -> bool {
        self.table
            .sessions
            .lock()
            .get(pssh)
            .is_some_and(|slot| slot.session_id.is_some())
    }
}

fn run_license_request(
    cdm: std::sync::Arc<dyn CdmHost>,
    table: std::sync::Arc<SessionTable>,
    pssh: Vec<u8>,
) {
    debug!("Begin cdm license request");
    let session_id = match cdm.open_cdm_session() {
        Ok(session_id) => match cdm.fetch_license(&session_id, &pssh) {
            Ok(()) => Some(session_id),
            Err(e) => {
                error!("Failed to fetch license: {e}");
                if let Err(close_err) = cdm.close_cdm_session(&session_id) {
                    error!("Failed to close cdm session {session_id}: {close_err}");
                }
                None
            }
        },
        Err(e) => {
            error!("Failed to open cdm session: {e}");
            None
        }
    };
    debug!("End cdm license request, established: {}", session_id.is_some());

    let mut sessions = table.sessions.lock();
    if let Some(slot) = sessions.get_mut(&pssh) {
        slot.session_id = session_id;
        slot.done = true;
    }
    table.completed.notify_all();
}

impl Drop for DrmSessionManager {
    fn drop(&mut self) {
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        let sessions = self.table.sessions.lock();
        for slot in sessions.values() {
            if let Some(session_id) = &slot.session_id {
                match self.cdm.close_cdm_session(session_id) {
                    Ok(()) => info!("Closed cdm session {session_id}"),
                    Err(e) => error!("Failed to close cdm session {session_id}: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingCdm {
        fail_fetch: bool,
        fetch_delay: Option<Duration>,
        opens: AtomicU32,
        fetches: AtomicU32,
        closes: AtomicU32,
    }

    impl CdmHost for CountingCdm {
        fn open_cdm_session(&self) -> Result<String, DashError> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(format!("session-{n}"))
        }

        fn fetch_license(&self, _session_id: &str, _pssh: &[u8]) -> Result<(), DashError> {
            if let Some(delay) = self.fetch_delay {
                thread::sleep(delay);
            }
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetch {
                Err(DashError::Drm(String::from("license denied")))
            } else {
                Ok(())
            }
        }

        fn close_cdm_session(&self, _session_id: &str) -> Result<(), DashError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn concurrent_requests_collapse_to_one() {
        let cdm = Arc::new(CountingCdm {
            fetch_delay: Some(Duration::from_millis(50)),
            ..CountingCdm::default()
        });
        let mgr = DrmSessionManager::new(cdm.clone());
        mgr.request(b"pssh-1");
        mgr.request(b"pssh-1");
        mgr.request(b"pssh-1");
        assert!(mgr.join(b"pssh-1"));
        assert_eq!(cdm.opens.load(Ordering::SeqCst), 1);
        assert_eq!(cdm.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn join_after_failed_fetch_reports_failure() {
        let cdm = Arc::new(CountingCdm { fail_fetch: true, ..CountingCdm::default() });
        let mgr = DrmSessionManager::new(cdm.clone());
        mgr.request(b"pssh-2");
        assert!(!mgr.join(b"pssh-2"));
        // The failed session was closed during the request itself.
        assert_eq!(cdm.closes.load(Ordering::SeqCst), 1);
        drop(mgr);
        assert_eq!(cdm.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn join_without_request_is_false() {
        let cdm = Arc::new(CountingCdm::default());
        let mgr = DrmSessionManager::new(cdm);
        assert!(!mgr.join(b"never-requested"));
    }

    #[test]
    fn destruction_closes_each_open_session_once() {
        let cdm = Arc::new(CountingCdm::default());
        let mgr = DrmSessionManager::new(cdm.clone());
        mgr.request(b"a");
        mgr.request(b"b");
        assert!(mgr.join(b"a"));
        assert!(mgr.join(b"b"));
        drop(mgr);
        assert_eq!(cdm.closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn universal_init_data_answers_any_scheme() {
        let data = SchemeInitData::new("video/mp4", Bytes::from_static(b"pssh"));
        let init = DrmInitData::Universal(data.clone());
        assert_eq!(init.get(&WIDEVINE_UUID), Some(&data));
        assert_eq!(init.license_pssh(), Some(&data));
    }

    #[test]
    fn mapped_init_data_prefers_widevine() {
        let wv = SchemeInitData::new("video/mp4", Bytes::from_static(b"wv"));
        let other = SchemeInitData::new("video/mp4", Bytes::from_static(b"other"));
        let other_uuid = Uuid::from_u128(0x1234);
        let init = DrmInitData::Mapped(HashMap::from([
            (WIDEVINE_UUID, wv.clone()),
            (other_uuid, other.clone()),
        ]));
        assert_eq!(init.license_pssh(), Some(&wv));
        assert_eq!(init.get(&other_uuid), Some(&other));
        assert_eq!(init.get(&Uuid::from_u128(9)), None);
    }
}

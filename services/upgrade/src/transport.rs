use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use store::{SaveOutcome, SessionStore, StoreError};
use tracing::warn;

use crate::{
    api::{
        CleanupResponse, CreateSessionRequest, CreateSessionResponse, FinalizeSessionResponse,
        ListSessionsResponse, SaveResponse, UploadChunkRequest, UploadChunkResponse,
    },
    abort_session, cleanup_expired, complete_session, create_session, upload_chunk,
};

mod http;
mod request;
mod routes;
mod server_runtime;

pub(crate) use http::{HttpRequest, HttpResponse, render_response_text};
pub(crate) use routes::handle_request;
pub use server_runtime::{serve_http, serve_http_with_workers};

use request::parse_request_bytes;

pub(crate) const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;
const SOCKET_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HTTP_WORKERS: usize = 4;

/// Session store plus request counters. Shared by reference across workers;
/// the store does its own per-session locking, so no runtime-wide mutex.
pub struct UpgradeRuntime {
    store: Arc<SessionStore>,
    sessions_created_total: AtomicU64,
    session_create_failed_total: AtomicU64,
    chunks_accepted_total: AtomicU64,
    chunks_rejected_total: AtomicU64,
    sessions_completed_total: AtomicU64,
    sessions_aborted_total: AtomicU64,
    started_at: Instant,
}

pub type SharedRuntime = Arc<UpgradeRuntime>;

impl UpgradeRuntime {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            sessions_created_total: AtomicU64::new(0),
            session_create_failed_total: AtomicU64::new(0),
            chunks_accepted_total: AtomicU64::new(0),
            chunks_rejected_total: AtomicU64::new(0),
            sessions_completed_total: AtomicU64::new(0),
            sessions_aborted_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn shared(store: Arc<SessionStore>) -> SharedRuntime {
        Arc::new(Self::new(store))
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, StoreError> {
        let result = create_session(&self.store, request);
        observe(&result, &self.sessions_created_total, &self.session_create_failed_total);
        result
    }

    fn upload_chunk(&self, request: UploadChunkRequest) -> Result<UploadChunkResponse, StoreError> {
        let result = upload_chunk(&self.store, request);
        observe(&result, &self.chunks_accepted_total, &self.chunks_rejected_total);
        result
    }

    fn complete_session(&self, session_id: &str) -> Result<FinalizeSessionResponse, StoreError> {
        let response = complete_session(&self.store, session_id)?;
        self.sessions_completed_total.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }

    fn abort_session(&self, session_id: &str) -> Result<FinalizeSessionResponse, StoreError> {
        let response = abort_session(&self.store, session_id)?;
        self.sessions_aborted_total.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }

    fn list_sessions(&self) -> ListSessionsResponse {
        let sessions = self.store.list_sessions();
        ListSessionsResponse {
            count: sessions.len(),
            sessions,
        }
    }

    fn cleanup_expired(&self, max_age: Option<Duration>) -> Result<CleanupResponse, StoreError> {
        let removed = cleanup_expired(&self.store, max_age)?;
        Ok(CleanupResponse { removed })
    }

    fn cleanup_completed(&self) -> Result<CleanupResponse, StoreError> {
        let removed = self.store.cleanup_completed_sessions()?;
        Ok(CleanupResponse { removed })
    }

    fn clear_all(&self) -> Result<CleanupResponse, StoreError> {
        let removed = self.store.clear_all_sessions()?;
        Ok(CleanupResponse { removed })
    }

    fn force_save(&self) -> Result<SaveResponse, StoreError> {
        Ok(SaveResponse::from(self.store.force_save()?))
    }

    /// Final flush; called once the listener stops.
    pub fn shutdown(&self) -> Result<SaveOutcome, StoreError> {
        self.store.shutdown()
    }

    pub(crate) fn metrics_text(&self) -> String {
        format!(
            "# TYPE fwup_sessions_created_total counter\n\
fwup_sessions_created_total {}\n\
# TYPE fwup_session_create_failed_total counter\n\
fwup_session_create_failed_total {}\n\
# TYPE fwup_chunks_accepted_total counter\n\
fwup_chunks_accepted_total {}\n\
# TYPE fwup_chunks_rejected_total counter\n\
fwup_chunks_rejected_total {}\n\
# TYPE fwup_sessions_completed_total counter\n\
fwup_sessions_completed_total {}\n\
# TYPE fwup_sessions_aborted_total counter\n\
fwup_sessions_aborted_total {}\n\
# TYPE fwup_sessions_active gauge\n\
fwup_sessions_active {}\n\
# TYPE fwup_snapshot_dirty gauge\n\
fwup_snapshot_dirty {}\n\
# TYPE fwup_uptime_seconds gauge\n\
fwup_uptime_seconds {:.4}\n",
            self.sessions_created_total.load(Ordering::Relaxed),
            self.session_create_failed_total.load(Ordering::Relaxed),
            self.chunks_accepted_total.load(Ordering::Relaxed),
            self.chunks_rejected_total.load(Ordering::Relaxed),
            self.sessions_completed_total.load(Ordering::Relaxed),
            self.sessions_aborted_total.load(Ordering::Relaxed),
            self.store.session_count(),
            u8::from(self.store.is_dirty()),
            self.started_at.elapsed().as_secs_f64()
        )
    }
}

fn observe<T>(result: &Result<T, StoreError>, success: &AtomicU64, failure: &AtomicU64) {
    let counter = if result.is_ok() { success } else { failure };
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Parses one complete HTTP/1.1 request from `raw_request` and returns the
/// rendered response bytes. Used by tests and tools without a socket.
pub fn handle_http_request_bytes(
    runtime: &SharedRuntime,
    raw_request: &[u8],
) -> Result<Vec<u8>, String> {
    let request = parse_request_bytes(raw_request)?;
    let response = handle_request(runtime, &request);
    Ok(render_response_text(&response).into_bytes())
}

/// HTTP status and message for an engine error. Session-not-found gets its
/// own status because it usually means the server restarted.
pub(crate) fn map_store_error(error: &StoreError) -> (u16, String) {
    match error {
        StoreError::SessionNotFound(_) => (404, error.to_string()),
        StoreError::Conflict(_) => (409, error.to_string()),
        StoreError::Io(_) | StoreError::Serialize(_) | StoreError::SnapshotTooLarge { .. } => {
            warn!(error = %error, "internal persistence error");
            (500, format!("internal persistence error: {error}"))
        }
        _ => (400, error.to_string()),
    }
}

pub(crate) fn json_response<T: Serialize>(value: &T) -> HttpResponse {
    match serde_json::to_string(value) {
        Ok(body) => HttpResponse::ok_json(body),
        Err(err) => HttpResponse::internal_server_error(&format!("failed to encode response: {err}")),
    }
}

pub(crate) fn store_result_response<T: Serialize>(result: Result<T, StoreError>) -> HttpResponse {
    match result {
        Ok(value) => json_response(&value),
        Err(err) => {
            let (status, message) = map_store_error(&err);
            HttpResponse::error_with_code(status, &message, err.code())
        }
    }
}

#[cfg(test)]
mod tests;

pub mod api;
pub mod transport;
#[cfg(feature = "async-transport")]
pub mod transport_axum;

use std::time::Duration;

use schema::{SessionStatus, ValidationError, base64_payload};
use store::{SessionStore, StoreError};

use crate::api::{
    CreateSessionRequest, CreateSessionResponse, FinalizeSessionResponse, UploadChunkRequest,
    UploadChunkResponse,
};

pub fn create_session(
    store: &SessionStore,
    request: CreateSessionRequest,
) -> Result<CreateSessionResponse, StoreError> {
    let session = store.create_session(&request.session_id, request.manifest)?;
    Ok(CreateSessionResponse {
        components: session
            .manifest
            .components
            .iter()
            .map(|component| component.name.clone())
            .collect(),
        session_id: session.session_id,
        status: session.status,
        created_at: session.created_at,
    })
}

/// Decodes the payload and hands the chunk to the store.
pub fn upload_chunk(
    store: &SessionStore,
    request: UploadChunkRequest,
) -> Result<UploadChunkResponse, StoreError> {
    let payload = decode_payload(request.data.as_deref())?;
    let receipt = store.upload_chunk(request.metadata, &payload)?;
    Ok(UploadChunkResponse {
        session_id: receipt.session_id,
        component_name: receipt.component_name,
        chunk_index: receipt.chunk_index,
        total_chunks: receipt.total_chunks,
        component_progress: receipt.component_progress.round() as u32,
        received_size: receipt.received_size,
        total_size: receipt.total_size,
        is_component_complete: receipt.is_component_complete,
        overwritten: receipt.overwritten,
    })
}

pub fn complete_session(
    store: &SessionStore,
    session_id: &str,
) -> Result<FinalizeSessionResponse, StoreError> {
    finalize(store.complete_session(session_id)?, session_id, SessionStatus::Completed)
}

pub fn abort_session(
    store: &SessionStore,
    session_id: &str,
) -> Result<FinalizeSessionResponse, StoreError> {
    finalize(store.abort_session(session_id)?, session_id, SessionStatus::Aborted)
}

pub fn cleanup_expired(store: &SessionStore, max_age: Option<Duration>) -> Result<usize, StoreError> {
    store.cleanup_expired_sessions(max_age.unwrap_or(store::DEFAULT_SESSION_MAX_AGE))
}

fn finalize(
    found: bool,
    session_id: &str,
    status: SessionStatus,
) -> Result<FinalizeSessionResponse, StoreError> {
    if !found {
        return Err(StoreError::SessionNotFound(session_id.to_string()));
    }
    Ok(FinalizeSessionResponse {
        session_id: session_id.to_string(),
        status,
    })
}

fn decode_payload(data: Option<&str>) -> Result<Vec<u8>, StoreError> {
    let data = data.ok_or(ValidationError::MissingField("data"))?;
    base64_payload::decode(data.trim())
        .map_err(|_| StoreError::Validation(ValidationError::InvalidEncoding("data")))
}

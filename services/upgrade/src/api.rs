use schema::{ChunkMetadata, FirmwareManifest, SessionStatus};
use serde::{Deserialize, Serialize};
use store::{SaveOutcome, SessionSummary};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub session_id: String,
    pub manifest: FirmwareManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: u64,
    pub components: Vec<String>,
}

/// Chunk metadata plus the base64-encoded payload in `data`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadChunkRequest {
    #[serde(flatten)]
    pub metadata: ChunkMetadata,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub session_id: String,
    pub component_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Rounded to the nearest whole percent.
    pub component_progress: u32,
    pub received_size: u64,
    pub total_size: u64,
    pub is_component_complete: bool,
    pub overwritten: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeSessionResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListSessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub written: bool,
    pub sessions: usize,
    pub bytes: usize,
    pub evicted: usize,
}

impl From<SaveOutcome> for SaveResponse {
    fn from(outcome: SaveOutcome) -> Self {
        match outcome {
            SaveOutcome::Skipped => Self {
                written: false,
                sessions: 0,
                bytes: 0,
                evicted: 0,
            },
            SaveOutcome::Written {
                sessions,
                bytes,
                evicted,
            } => Self {
                written: true,
                sessions,
                bytes,
                evicted,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

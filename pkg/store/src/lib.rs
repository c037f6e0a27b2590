mod autosave;
mod ingest;
mod session_store;
mod snapshot;
mod view;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use schema::{SessionStatus, ValidationError};
use thiserror::Error;

pub use ingest::{ChunkReceipt, CompletenessIssue, verify_completeness};
pub use session_store::{SaveOutcome, SessionStore};
pub use snapshot::{SnapshotFile, SnapshotLoad};
pub use view::{ComponentStatusView, SessionStatusView, SessionSummary};

pub const DEFAULT_STORAGE_DIR: &str = ".firmware-sessions";
pub const DEFAULT_SNAPSHOT_FILE: &str = "sessions.json";
pub const DEFAULT_AUTO_SAVE_INTERVAL: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_EVICTION_AGE: Duration = Duration::from_secs(30 * 60);
/// Age used by expiry sweeps when the caller does not pick one.
pub const DEFAULT_SESSION_MAX_AGE: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request; the caller must fix it.
    Validation,
    /// Payload corrupted in transit; the caller must resend.
    Integrity,
    /// Workflow error; the caller must adjust, e.g. create a new session.
    State,
    /// Persistence failure on the server side.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("chunk size mismatch: expected {expected}, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {session_id} is not active (status: {status})")]
    SessionNotActive {
        session_id: String,
        status: SessionStatus,
    },
    #[error("component {component_name} not found in session {session_id}")]
    ComponentNotFound {
        session_id: String,
        component_name: String,
    },
    #[error("checksum mismatch: expected {declared}, calculated {computed}")]
    ChecksumMismatch { declared: String, computed: String },
    #[error("invalid target address format: {0}")]
    InvalidAddress(String),
    #[error("total chunks mismatch for {component_name}: expected {expected}, received {actual}")]
    TotalChunksMismatch {
        component_name: String,
        expected: u32,
        actual: u32,
    },
    #[error("session already exists: {0}")]
    Conflict(String),
    #[error("component {component_name} failed completeness check ({} issue(s))", .issues.len())]
    IncompleteComponent {
        component_name: String,
        issues: Vec<CompletenessIssue>,
    },
    #[error("snapshot of {bytes} bytes exceeds limit of {limit} bytes and nothing is old enough to evict")]
    SnapshotTooLarge { bytes: usize, limit: usize },
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::SizeMismatch { .. }
            | Self::InvalidAddress(_)
            | Self::TotalChunksMismatch { .. } => ErrorKind::Validation,
            Self::ChecksumMismatch { .. } | Self::IncompleteComponent { .. } => {
                ErrorKind::Integrity
            }
            Self::SessionNotFound(_)
            | Self::SessionNotActive { .. }
            | Self::ComponentNotFound { .. }
            | Self::Conflict(_) => ErrorKind::State,
            Self::SnapshotTooLarge { .. } | Self::Io(_) | Self::Serialize(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "BAD_REQUEST",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionNotActive { .. } => "SESSION_NOT_ACTIVE",
            Self::ComponentNotFound { .. } => "COMPONENT_NOT_FOUND",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::TotalChunksMismatch { .. } => "TOTAL_CHUNKS_MISMATCH",
            Self::Conflict(_) => "CONFLICT",
            Self::IncompleteComponent { .. } => "INCOMPLETE_COMPONENT",
            Self::SnapshotTooLarge { .. } => "SNAPSHOT_TOO_LARGE",
            Self::Io(_) => "IO_ERROR",
            Self::Serialize(_) => "SERIALIZE_ERROR",
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialize(value.to_string())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Whether a failed snapshot write fails the operation that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Log the failure and report success for the in-memory mutation.
    #[default]
    BestEffort,
    Strict,
}

/// What to do when a completed component has offset gaps or a size mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletenessPolicy {
    /// Log and report completion anyway.
    #[default]
    Lenient,
    /// Keep the chunk but fail the upload with `IncompleteComponent`.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub storage_dir: PathBuf,
    pub snapshot_file: String,
    /// `None` disables the background flush.
    pub auto_save_interval: Option<Duration>,
    pub max_snapshot_bytes: usize,
    /// Sessions older than this are evicted when a snapshot is oversized.
    pub eviction_age: Duration,
    pub durability: Durability,
    pub completeness: CompletenessPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(DEFAULT_STORAGE_DIR),
            snapshot_file: DEFAULT_SNAPSHOT_FILE.to_string(),
            auto_save_interval: Some(DEFAULT_AUTO_SAVE_INTERVAL),
            max_snapshot_bytes: DEFAULT_MAX_SNAPSHOT_BYTES,
            eviction_age: DEFAULT_EVICTION_AGE,
            durability: Durability::default(),
            completeness: CompletenessPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn in_dir(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.storage_dir.join(&self.snapshot_file)
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        unix_timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(duration_millis(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_follow_taxonomy() {
        assert_eq!(
            StoreError::SessionNotFound("s".into()).kind(),
            ErrorKind::State
        );
        assert_eq!(
            StoreError::ChecksumMismatch {
                declared: "a".into(),
                computed: "b".into()
            }
            .kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            StoreError::InvalidAddress("12".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(StoreError::Io("disk".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn session_not_found_has_its_own_code() {
        let not_found = StoreError::SessionNotFound("s".into());
        let not_active = StoreError::SessionNotActive {
            session_id: "s".into(),
            status: SessionStatus::Completed,
        };
        assert_eq!(not_found.code(), "SESSION_NOT_FOUND");
        assert_ne!(not_found.code(), not_active.code());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = StoreConfig::default();
        assert_eq!(config.auto_save_interval, Some(Duration::from_millis(5_000)));
        assert_eq!(config.max_snapshot_bytes, 50 * 1024 * 1024);
        assert_eq!(config.eviction_age, Duration::from_secs(1_800));
        assert_eq!(
            config.snapshot_path(),
            PathBuf::from(".firmware-sessions").join("sessions.json")
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }
}

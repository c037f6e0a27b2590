use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use schema::Session;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::StoreError;

/// The single JSON document holding every live session, keyed by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    path: PathBuf,
}

#[derive(Debug, Default)]
pub struct SnapshotLoad {
    pub sessions: BTreeMap<String, Session>,
    /// Set when an unreadable snapshot was copied aside before starting empty.
    pub backup_path: Option<PathBuf>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self, now_millis: u64) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".backup.{now_millis}"));
        PathBuf::from(name)
    }

    /// Reads the snapshot. A missing file yields an empty table; an
    /// unparseable one is copied to a timestamped backup and also yields an
    /// empty table. Never fails.
    pub fn load(&self, now_millis: u64) -> SnapshotLoad {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no session snapshot found, starting empty");
                return SnapshotLoad::default();
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "failed to read session snapshot");
                return SnapshotLoad {
                    sessions: BTreeMap::new(),
                    backup_path: self.copy_aside(now_millis),
                };
            }
        };

        match decode_snapshot(&bytes) {
            Ok(sessions) => {
                info!(
                    path = %self.path.display(),
                    sessions = sessions.len(),
                    "loaded sessions from snapshot"
                );
                SnapshotLoad {
                    sessions,
                    backup_path: None,
                }
            }
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "session snapshot is corrupted");
                SnapshotLoad {
                    sessions: BTreeMap::new(),
                    backup_path: self.copy_aside(now_millis),
                }
            }
        }
    }

    fn copy_aside(&self, now_millis: u64) -> Option<PathBuf> {
        let backup = self.backup_path(now_millis);
        match fs::copy(&self.path, &backup) {
            Ok(_) => {
                warn!(backup = %backup.display(), "backed up unreadable session snapshot");
                Some(backup)
            }
            Err(err) => {
                error!(backup = %backup.display(), error = %err, "failed to back up session snapshot");
                None
            }
        }
    }

    /// Writes to a sibling temp file, syncs it, then renames it over the
    /// snapshot so readers see either the old or the new document.
    pub fn write_atomic(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| {
            StoreError::Io(format!(
                "failed to persist snapshot to {}: {}",
                self.path.display(),
                err.error
            ))
        })?;
        Ok(())
    }
}

pub(crate) fn encode_snapshot<T: Serialize + ?Sized>(sessions: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec_pretty(sessions)?)
}

pub(crate) fn decode_snapshot(bytes: &[u8]) -> Result<BTreeMap<String, Session>, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

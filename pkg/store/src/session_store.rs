use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use schema::{FirmwareManifest, Session, SessionStatus, validate_manifest, validate_session_id};
use serde::{Serialize, Serializer, ser::SerializeMap};
use tracing::{debug, error, info, warn};

use crate::{
    Clock, Durability, SessionStatusView, SessionSummary, StoreConfig, StoreError, SystemClock,
    autosave::AutoSaveWorker,
    duration_millis,
    snapshot::{SnapshotFile, encode_snapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing changed since the last successful write.
    Skipped,
    Written {
        sessions: usize,
        bytes: usize,
        /// Sessions dropped to bring the snapshot under the size limit.
        evicted: usize,
    },
}

pub(crate) struct SessionEntry {
    created_at: u64,
    session: Mutex<Session>,
    /// Set under the session lock once the entry leaves the table, so a
    /// writer that fetched it earlier cannot mutate an orphan.
    retired: AtomicBool,
}

impl SessionEntry {
    fn new(session: Session) -> Self {
        Self {
            created_at: session.created_at,
            session: Mutex::new(session),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        let _session = self.lock();
        self.retired.store(true, Ordering::Release);
    }
}

type SessionTable = HashMap<String, Arc<SessionEntry>>;

/// Serializes the live table in id order, locking one session at a time.
struct TableView<'a>(&'a SessionTable);

impl Serialize for TableView<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut ids: Vec<&String> = self.0.keys().collect();
        ids.sort();
        let mut map = serializer.serialize_map(Some(ids.len()))?;
        for id in ids {
            let session = self.0[id].lock();
            map.serialize_entry(id, &*session)?;
        }
        map.end()
    }
}

/// Owns every firmware-upgrade session in the process.
///
/// Lock order is table, then session, then nothing: no code path takes the
/// table lock while holding a session lock. Snapshot writes are serialized by
/// `persist_lock`, which is only taken with no other lock held.
pub struct SessionStore {
    config: StoreConfig,
    snapshot: SnapshotFile,
    clock: Arc<dyn Clock>,
    sessions: RwLock<SessionTable>,
    dirty: AtomicBool,
    persist_lock: Mutex<()>,
    initialized: OnceLock<()>,
    auto_save: Mutex<Option<AutoSaveWorker>>,
    this: Weak<SessionStore>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("snapshot", &self.snapshot.path())
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Creates a store without touching the filesystem. The snapshot is
    /// loaded by the first call that needs the table.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let snapshot = SnapshotFile::new(config.snapshot_path());
        Arc::new_cyclic(|this| Self {
            config,
            snapshot,
            clock,
            sessions: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
            initialized: OnceLock::new(),
            auto_save: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn snapshot_path(&self) -> &Path {
        self.snapshot.path()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    pub(crate) fn ensure_initialized(&self) {
        self.initialized.get_or_init(|| self.initialize());
    }

    fn initialize(&self) {
        if let Err(err) = fs::create_dir_all(&self.config.storage_dir) {
            error!(
                dir = %self.config.storage_dir.display(),
                error = %err,
                "failed to create session storage directory"
            );
        }

        let loaded = self.snapshot.load(self.clock.now_millis());
        let restored = loaded.sessions.len();
        {
            let mut table = self.write_table();
            for (session_id, session) in loaded.sessions {
                table.insert(session_id, Arc::new(SessionEntry::new(session)));
            }
        }

        if let Some(interval) = self.config.auto_save_interval.filter(|value| !value.is_zero()) {
            match AutoSaveWorker::spawn(self.this.clone(), interval) {
                Ok(worker) => *self.auto_save_slot() = Some(worker),
                Err(err) => error!(error = %err, "failed to start auto-save thread"),
            }
        }

        info!(
            restored,
            snapshot = %self.snapshot.path().display(),
            "session store initialized"
        );
    }

    // -----------------------------------------------------------------------
    // Lock helpers
    // -----------------------------------------------------------------------

    fn read_table(&self) -> RwLockReadGuard<'_, SessionTable> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, SessionTable> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn auto_save_slot(&self) -> MutexGuard<'_, Option<AutoSaveWorker>> {
        self.auto_save.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.read_table().get(session_id).cloned()
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn create_session(
        &self,
        session_id: &str,
        manifest: FirmwareManifest,
    ) -> Result<Session, StoreError> {
        self.ensure_initialized();
        validate_session_id(session_id)?;
        validate_manifest(&manifest)?;

        let session = Session::new(session_id, manifest, self.clock.now_millis());
        {
            let mut table = self.write_table();
            if table.contains_key(session_id) {
                return Err(StoreError::Conflict(session_id.to_string()));
            }
            table.insert(
                session_id.to_string(),
                Arc::new(SessionEntry::new(session.clone())),
            );
        }
        self.mark_dirty();
        info!(
            session_id,
            version = %session.manifest.version,
            components = session.components.len(),
            "created firmware upgrade session"
        );

        self.persist_after_mutation("create_session")?;
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.ensure_initialized();
        let entry = self
            .entry(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let session = entry.lock().clone();
        Ok(session)
    }

    pub fn get_status(&self, session_id: &str) -> Result<SessionStatusView, StoreError> {
        self.ensure_initialized();
        let entry = self
            .entry(session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let view = SessionStatusView::from(&*entry.lock());
        Ok(view)
    }

    /// Summaries of every live session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.ensure_initialized();
        let entries: Vec<Arc<SessionEntry>> = self.read_table().values().cloned().collect();
        let mut summaries: Vec<SessionSummary> = entries
            .iter()
            .map(|entry| SessionSummary::from(&*entry.lock()))
            .collect();
        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries
    }

    pub fn session_count(&self) -> usize {
        self.ensure_initialized();
        self.read_table().len()
    }

    /// Returns `false` when the session does not exist. A terminal status
    /// takes the session out of the table before the status is visible, so
    /// no snapshot ever holds a finalized session.
    pub fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<bool, StoreError> {
        self.ensure_initialized();
        let Some(entry) = self.entry(session_id) else {
            return Ok(false);
        };

        if status.is_terminal() {
            let removed = {
                let mut table = self.write_table();
                let still_live = table
                    .get(session_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &entry));
                still_live && table.remove(session_id).is_some()
            };
            if !removed {
                return Ok(false);
            }
            {
                let mut session = entry.lock();
                session.status = status;
                entry.retired.store(true, Ordering::Release);
            }
            self.mark_dirty();
            info!(session_id, %status, "session finalized, removed with its chunk data");
        } else {
            {
                let mut session = entry.lock();
                if entry.is_retired() {
                    return Ok(false);
                }
                session.status = status;
            }
            self.mark_dirty();
        }

        self.persist_after_mutation("update_status")?;
        Ok(true)
    }

    pub fn complete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        self.update_status(session_id, SessionStatus::Completed)
    }

    pub fn abort_session(&self, session_id: &str) -> Result<bool, StoreError> {
        self.update_status(session_id, SessionStatus::Aborted)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        self.ensure_initialized();
        let removed = self.write_table().remove(session_id);
        let Some(entry) = removed else {
            return Ok(false);
        };
        entry.retire();
        self.mark_dirty();
        self.persist_after_mutation("delete_session")?;
        Ok(true)
    }

    /// Operator-triggered removal of a single session.
    pub fn cleanup_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let removed = self.delete_session(session_id)?;
        if removed {
            info!(session_id, "cleaned up session");
        }
        Ok(removed)
    }

    pub fn cleanup_expired_sessions(&self, max_age: Duration) -> Result<usize, StoreError> {
        self.ensure_initialized();
        let removed = self.evict_older_than(max_age);
        if removed > 0 {
            self.mark_dirty();
            info!(removed, max_age_ms = duration_millis(max_age), "cleaned up expired sessions");
            self.persist_after_mutation("cleanup_expired_sessions")?;
        }
        Ok(removed)
    }

    pub fn cleanup_completed_sessions(&self) -> Result<usize, StoreError> {
        self.ensure_initialized();
        let removed: Vec<Arc<SessionEntry>> = {
            let mut table = self.write_table();
            let terminal: Vec<String> = table
                .iter()
                .filter(|(_, entry)| entry.lock().status.is_terminal())
                .map(|(session_id, _)| session_id.clone())
                .collect();
            terminal
                .iter()
                .filter_map(|session_id| table.remove(session_id))
                .collect()
        };
        for entry in &removed {
            entry.retire();
        }
        if !removed.is_empty() {
            self.mark_dirty();
            info!(removed = removed.len(), "cleaned up terminal sessions");
            self.persist_after_mutation("cleanup_completed_sessions")?;
        }
        Ok(removed.len())
    }

    pub fn clear_all_sessions(&self) -> Result<usize, StoreError> {
        self.ensure_initialized();
        let drained: Vec<Arc<SessionEntry>> = {
            let mut table = self.write_table();
            table.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.retire();
        }
        self.mark_dirty();
        info!(removed = drained.len(), "cleared all sessions");
        self.persist_after_mutation("clear_all_sessions")?;
        Ok(drained.len())
    }

    /// Removes sessions with `now - created_at > max_age`. Returns how many.
    fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_age_ms = duration_millis(max_age);
        let evicted: Vec<Arc<SessionEntry>> = {
            let mut table = self.write_table();
            let expired: Vec<String> = table
                .iter()
                .filter(|(_, entry)| now.saturating_sub(entry.created_at) > max_age_ms)
                .map(|(session_id, _)| session_id.clone())
                .collect();
            expired
                .iter()
                .filter_map(|session_id| table.remove(session_id))
                .collect()
        };
        for entry in &evicted {
            entry.retire();
        }
        evicted.len()
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Writes the snapshot if anything changed since the last write.
    pub fn save(&self) -> Result<SaveOutcome, StoreError> {
        self.ensure_initialized();
        self.flush()
    }

    /// Writes the snapshot even when nothing is marked dirty.
    pub fn force_save(&self) -> Result<SaveOutcome, StoreError> {
        self.ensure_initialized();
        self.mark_dirty();
        self.flush()
    }

    /// Stops the auto-save thread and performs one final save.
    pub fn shutdown(&self) -> Result<SaveOutcome, StoreError> {
        let worker = self.auto_save_slot().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        let outcome = self.flush();
        match &outcome {
            Ok(outcome) => info!(?outcome, "session store shut down"),
            Err(err) => error!(error = %err, "final session snapshot failed during shutdown"),
        }
        outcome
    }

    /// The dirty flag is cleared before serializing so a mutation that lands
    /// mid-write re-arms it; on failure it is restored.
    pub(crate) fn flush(&self) -> Result<SaveOutcome, StoreError> {
        let _persist = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(SaveOutcome::Skipped);
        }
        let result = self.write_snapshot();
        if result.is_err() {
            self.mark_dirty();
        }
        result
    }

    fn write_snapshot(&self) -> Result<SaveOutcome, StoreError> {
        let limit = self.config.max_snapshot_bytes;
        let mut evicted = 0;
        loop {
            let (bytes, sessions) = {
                let table = self.read_table();
                (encode_snapshot(&TableView(&table))?, table.len())
            };

            if bytes.len() <= limit {
                self.snapshot.write_atomic(&bytes)?;
                debug!(sessions, bytes = bytes.len(), "saved session snapshot");
                return Ok(SaveOutcome::Written {
                    sessions,
                    bytes: bytes.len(),
                    evicted,
                });
            }

            warn!(
                bytes = bytes.len(),
                limit,
                eviction_age_ms = duration_millis(self.config.eviction_age),
                "session snapshot too large, evicting old sessions"
            );
            let removed = self.evict_older_than(self.config.eviction_age);
            if removed == 0 {
                return Err(StoreError::SnapshotTooLarge {
                    bytes: bytes.len(),
                    limit,
                });
            }
            info!(removed, "evicted old sessions to shrink snapshot");
            evicted += removed;
        }
    }

    /// Synchronous flush after a mutation. Under best-effort durability a
    /// failed write is logged and the mutation still reports success.
    pub(crate) fn persist_after_mutation(&self, operation: &'static str) -> Result<(), StoreError> {
        match self.flush() {
            Ok(_) => Ok(()),
            Err(err) => {
                error!(operation, error = %err, "failed to persist session snapshot");
                match self.config.durability {
                    Durability::BestEffort => Ok(()),
                    Durability::Strict => Err(err),
                }
            }
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        let worker = self
            .auto_save
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, StoreConfig};
    use schema::manifest_builder;
    use std::{thread, time::Instant};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            auto_save_interval: None,
            ..StoreConfig::in_dir(dir.path())
        }
    }

    fn read_snapshot(store: &SessionStore) -> serde_json::Value {
        serde_json::from_slice(&fs::read(store.snapshot_path()).unwrap()).unwrap()
    }

    #[test]
    fn construction_does_not_touch_disk() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("sessions");
        let store = SessionStore::new(StoreConfig {
            auto_save_interval: None,
            ..StoreConfig::in_dir(&storage)
        });
        assert!(!storage.exists());

        assert_eq!(store.session_count(), 0);
        assert!(storage.is_dir());
    }

    #[test]
    fn create_session_persists_synchronously() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));

        let session = store
            .create_session("S1", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert!(!store.is_dirty());
        let snapshot = read_snapshot(&store);
        assert_eq!(snapshot["S1"]["status"], "active");
        assert_eq!(snapshot["S1"]["components"]["main"]["totalSize"], 100);
    }

    #[test]
    fn duplicate_create_is_conflict() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        let manifest = manifest_builder("1.0.0", &[("main", 100)]);

        store.create_session("S", manifest.clone()).unwrap();
        for _ in 0..2 {
            assert_eq!(
                store.create_session("S", manifest.clone()),
                Err(StoreError::Conflict("S".into()))
            );
        }
    }

    #[test]
    fn create_rejects_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        let err = store
            .create_session("S", manifest_builder("1.0.0", &[("main", 1), ("main", 2)]))
            .unwrap_err();
        assert_eq!(err.code(), "BAD_REQUEST");
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn terminal_status_removes_session_before_save() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        let manifest = manifest_builder("1.0.0", &[("main", 100)]);
        store.create_session("done", manifest.clone()).unwrap();
        store.create_session("gone", manifest).unwrap();

        assert_eq!(store.complete_session("done"), Ok(true));
        assert_eq!(store.abort_session("gone"), Ok(true));

        assert!(matches!(
            store.get_status("done"),
            Err(StoreError::SessionNotFound(_))
        ));
        assert!(matches!(
            store.get_session("gone"),
            Err(StoreError::SessionNotFound(_))
        ));
        assert_eq!(read_snapshot(&store), serde_json::json!({}));
    }

    #[test]
    fn finalized_status_is_never_visible_in_the_table() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        store
            .create_session("S", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap();

        thread::scope(|scope| {
            let table = store.read_table();
            let completer = scope.spawn(|| store.complete_session("S"));
            thread::sleep(Duration::from_millis(50));

            let bytes = encode_snapshot(&TableView(&table)).unwrap();
            let snapshot: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(snapshot["S"]["status"], "active");
            drop(table);

            assert_eq!(completer.join().unwrap(), Ok(true));
        });

        assert!(matches!(
            store.get_status("S"),
            Err(StoreError::SessionNotFound(_))
        ));
        assert_eq!(read_snapshot(&store), serde_json::json!({}));
    }

    #[test]
    fn update_status_on_missing_session_returns_false() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        assert_eq!(store.complete_session("nope"), Ok(false));
        assert_eq!(store.update_status("nope", SessionStatus::Active), Ok(false));
    }

    #[test]
    fn update_status_to_active_keeps_session() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        store
            .create_session("S", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap();
        assert_eq!(store.update_status("S", SessionStatus::Active), Ok(true));
        assert_eq!(store.get_session("S").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn cleanup_session_and_clear_all() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        let manifest = manifest_builder("1.0.0", &[("main", 100)]);
        for id in ["a", "b", "c"] {
            store.create_session(id, manifest.clone()).unwrap();
        }

        assert_eq!(store.cleanup_session("a"), Ok(true));
        assert_eq!(store.cleanup_session("a"), Ok(false));
        assert_eq!(store.session_count(), 2);

        assert_eq!(store.clear_all_sessions(), Ok(2));
        assert_eq!(store.session_count(), 0);
        assert_eq!(read_snapshot(&store), serde_json::json!({}));
    }

    #[test]
    fn cleanup_expired_uses_strict_age_comparison() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = SessionStore::with_clock(test_config(&dir), clock.clone());
        let manifest = manifest_builder("1.0.0", &[("main", 100)]);

        store.create_session("old", manifest.clone()).unwrap();
        clock.advance(Duration::from_secs(10));
        store.create_session("young", manifest).unwrap();
        clock.advance(Duration::from_secs(50));

        // "old" is exactly 60 s old: not strictly older than the limit.
        assert_eq!(store.cleanup_expired_sessions(Duration::from_secs(60)), Ok(0));
        clock.advance(Duration::from_millis(1));
        assert_eq!(store.cleanup_expired_sessions(Duration::from_secs(60)), Ok(1));

        let remaining: Vec<_> = store
            .list_sessions()
            .into_iter()
            .map(|summary| summary.session_id)
            .collect();
        assert_eq!(remaining, vec!["young".to_string()]);
    }

    #[test]
    fn cleanup_completed_sweeps_leftover_terminal_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        store
            .create_session("S", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap();
        store.entry("S").unwrap().lock().status = SessionStatus::Completed;

        assert_eq!(store.cleanup_completed_sessions(), Ok(1));
        assert_eq!(store.cleanup_completed_sessions(), Ok(0));
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn list_sessions_is_sorted_by_creation_time() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(10));
        let store = SessionStore::with_clock(test_config(&dir), clock.clone());
        let manifest = manifest_builder("1.0.0", &[("main", 100)]);
        for id in ["zeta", "alpha", "mid"] {
            store.create_session(id, manifest.clone()).unwrap();
            clock.advance(Duration::from_millis(5));
        }

        let ids: Vec<_> = store
            .list_sessions()
            .into_iter()
            .map(|summary| summary.session_id)
            .collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn save_is_a_no_op_unless_dirty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(test_config(&dir));
        store
            .create_session("S", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap();

        assert_eq!(store.save(), Ok(SaveOutcome::Skipped));
        assert!(matches!(
            store.force_save(),
            Ok(SaveOutcome::Written { sessions: 1, evicted: 0, .. })
        ));
    }

    #[test]
    fn oversized_snapshot_without_old_sessions_fails_and_stays_dirty() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(StoreConfig {
            max_snapshot_bytes: 64,
            durability: Durability::Strict,
            ..test_config(&dir)
        });

        let err = store
            .create_session("S", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap_err();

        assert!(matches!(err, StoreError::SnapshotTooLarge { limit: 64, .. }));
        assert!(store.is_dirty());
        assert!(!store.snapshot_path().exists());
    }

    #[test]
    fn best_effort_durability_reports_success_on_write_failure() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(StoreConfig {
            max_snapshot_bytes: 64,
            ..test_config(&dir)
        });

        let session = store
            .create_session("S", manifest_builder("1.0.0", &[("main", 100)]))
            .unwrap();

        assert_eq!(session.session_id, "S");
        assert!(store.is_dirty());
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn auto_save_flushes_dirty_table() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(StoreConfig {
            auto_save_interval: Some(Duration::from_millis(10)),
            ..StoreConfig::in_dir(dir.path())
        });
        store.ensure_initialized();
        store.mark_dirty();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.is_dirty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!store.is_dirty());
        assert!(store.snapshot_path().exists());
        store.shutdown().unwrap();
    }

    #[test]
    fn shutdown_performs_final_save() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(StoreConfig {
            auto_save_interval: Some(Duration::from_secs(3_600)),
            ..StoreConfig::in_dir(dir.path())
        });
        store.ensure_initialized();
        store.mark_dirty();

        assert!(matches!(store.shutdown(), Ok(SaveOutcome::Written { .. })));
        assert!(!store.is_dirty());
        assert_eq!(read_snapshot(&store), serde_json::json!({}));
    }
}

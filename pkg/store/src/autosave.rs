use std::{
    sync::{Weak, mpsc},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{SaveOutcome, SessionStore};

/// Background thread flushing a dirty store on a fixed interval. Holds only a
/// weak reference so it never keeps the store alive.
pub(crate) struct AutoSaveWorker {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl AutoSaveWorker {
    pub(crate) fn spawn(store: Weak<SessionStore>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("session-autosave".to_string())
            .spawn(move || {
                loop {
                    match shutdown_rx.recv_timeout(interval) {
                        Ok(_) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                    }
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    match store.flush() {
                        Ok(SaveOutcome::Skipped) => {}
                        Ok(outcome) => debug!(?outcome, "auto-save flushed session snapshot"),
                        Err(err) => warn!(error = %err, "auto-save failed"),
                    }
                }
            })?;
        Ok(Self {
            shutdown_tx,
            handle,
        })
    }

    /// Signals the thread and waits for it, unless called from the thread
    /// itself (the last store reference can be dropped there).
    pub(crate) fn stop(self) {
        let _ = self.shutdown_tx.send(());
        if self.handle.thread().id() != thread::current().id() {
            let _ = self.handle.join();
        }
    }
}

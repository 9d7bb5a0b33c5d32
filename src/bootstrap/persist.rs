//! Debounced persistence of bootstrap state.
//!
//! Workers push a fresh state after every batch. The writer keeps one
//! pending slot and one cancellable timer; bursts of pushes inside the delay
//! window coalesce into a single write of the newest state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bootstrap::state::{BootstrapState, BootstrapStateStore};
use crate::error::StorageError;

#[derive(Debug, Default)]
struct Slot {
    pending: Option<BootstrapState>,
    timer: Option<JoinHandle<()>>,
}

/// Coalescing writer for [`BootstrapState`].
///
/// Every write, timed or explicit, happens while the slot lock is held, so
/// an older state can never land on disk after a newer one. Timed writes run
/// on the blocking pool.
#[derive(Debug)]
pub struct DebouncedStateWriter {
    store: BootstrapStateStore,
    delay: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl DebouncedStateWriter {
    #[must_use]
    pub fn new(store: BootstrapStateStore, delay: Duration) -> Self {
        Self {
            store,
            delay,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the pending state and arms the timer if it is idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&self, state: BootstrapState) {
        let mut slot = Self::lock(&self.slot);
        slot.pending = Some(state);
        if slot.timer.is_some() {
            return;
        }

        let shared = Arc::clone(&self.slot);
        let store = self.store.clone();
        let delay = self.delay;
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let write = tokio::task::spawn_blocking(move || {
                let mut slot = Self::lock(&shared);
                slot.timer = None;
                if let Some(state) = slot.pending.take() {
                    if let Err(err) = store.save(&state) {
                        tracing::warn!(error = %err, "debounced bootstrap state write failed");
                    }
                }
            });
            if let Err(err) = write.await {
                tracing::warn!(error = %err, "debounced bootstrap state task failed");
            }
        }));
    }

    /// Cancels the timer and writes the pending state synchronously.
    ///
    /// # Errors
    /// Returns the storage error if the write fails; the state stays pending
    /// so a later flush can retry it.
    pub fn flush_now(&self) -> Result<(), StorageError> {
        let mut slot = Self::lock(&self.slot);
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        let Some(state) = slot.pending.take() else {
            return Ok(());
        };
        if let Err(err) = self.store.save(&state) {
            slot.pending = Some(state);
            return Err(err);
        }
        Ok(())
    }

    /// Returns true if a state is waiting to be written.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        Self::lock(&self.slot).pending.is_some()
    }
}

impl Drop for DebouncedStateWriter {
    fn drop(&mut self) {
        if let Some(timer) = Self::lock(&self.slot).timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::state::BatchResult;
    use crate::storage::GraphPaths;
    use tempfile::tempdir;

    fn writer(paths: &GraphPaths) -> DebouncedStateWriter {
        DebouncedStateWriter::new(
            BootstrapStateStore::new(paths.clone()),
            Duration::from_millis(500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushes_coalesce_into_latest_state() {
        let dir = tempdir().unwrap();
        let paths = GraphPaths::new(dir.path());
        let writer = writer(&paths);
        let store = BootstrapStateStore::new(paths.clone());

        let first = BootstrapState::initial(3);
        let second = first.advance_batch(0, &BatchResult::success(1));
        let third = second.advance_batch(1, &BatchResult::success(1));
        writer.push(first);
        writer.push(second);
        writer.push(third.clone());
        assert!(!paths.bootstrap_state().exists());

        tokio::time::sleep(Duration::from_millis(600)).await;
        for _ in 0..200 {
            if !writer.has_pending() && store.load().is_some() {
                break;
            }
            // The write lands on a blocking-pool thread that the paused
            // clock does not drive.
            std::thread::sleep(Duration::from_millis(5));
            tokio::task::yield_now().await;
        }
        assert_eq!(store.load(), Some(third));
        assert!(!writer.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_writes_without_waiting() {
        let dir = tempdir().unwrap();
        let paths = GraphPaths::new(dir.path());
        let writer = writer(&paths);

        let state = BootstrapState::initial(2).pause();
        writer.push(state.clone());
        writer.flush_now().unwrap();

        let store = BootstrapStateStore::new(paths);
        assert_eq!(store.load(), Some(state));
        assert!(!writer.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_cancels_timer() {
        let dir = tempdir().unwrap();
        let paths = GraphPaths::new(dir.path());
        let writer = writer(&paths);
        let store = BootstrapStateStore::new(paths.clone());

        let flushed = BootstrapState::initial(2);
        writer.push(flushed.clone());
        writer.flush_now().unwrap();

        // Overwrite externally; a stray timer would clobber this.
        let external = flushed.fail("external");
        store.save(&external).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.load(), Some(external));
    }

    #[tokio::test]
    async fn test_flush_without_pending_is_noop() {
        let dir = tempdir().unwrap();
        let paths = GraphPaths::new(dir.path());
        writer(&paths).flush_now().unwrap();
        assert!(!paths.bootstrap_state().exists());
    }
}

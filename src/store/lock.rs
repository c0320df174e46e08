use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

/// Per-project write lock for the task store.
///
/// Backed by `tokio::sync::Mutex`, which grants the lock to waiters in the
/// order they called `acquire`, so every mutation of a project is totally
/// ordered. Acquisition never fails; it only waits.
#[derive(Clone, Default)]
pub struct WriteLock {
    inner: Arc<tokio::sync::Mutex<()>>,
}

/// Held for the duration of one mutation.
pub type WriteGuard = OwnedMutexGuard<()>;

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> WriteGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Resolve once every holder queued before this call has released.
    pub async fn idle(&self) {
        drop(self.acquire().await);
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

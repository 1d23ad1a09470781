//! Per-job cancellation handles and the linked job/shutdown signal.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use queue_core::JobId;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns one cancellation handle per in-flight job.
///
/// Tokens are cheap clones of shared state, so cancelling a token that a
/// worker is concurrently unregistering is always safe.
#[derive(Default)]
pub struct CancellationRegistry {
    handles: Mutex<HashMap<JobId, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handle for `job_id`.
    ///
    /// Returns `None` when the job already has a handle; the existing one is
    /// left in place.
    pub fn register(&self, job_id: JobId) -> Option<CancellationToken> {
        match self.handles().entry(job_id) {
            Entry::Occupied(_) => {
                tracing::warn!(%job_id, "Cancellation handle already registered; running without one");
                None
            }
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Some(token)
            }
        }
    }

    /// Register a handle that is released when the returned guard drops.
    pub fn register_scoped(&self, job_id: JobId) -> ScopedRegistration<'_> {
        let token = self.register(job_id);
        ScopedRegistration {
            registry: self,
            job_id,
            token,
        }
    }

    /// Signal the handle for `job_id`. True if one was registered.
    pub fn request_cancel(&self, job_id: JobId) -> bool {
        let token = self.handles().get(&job_id).cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Release the handle for `job_id`. Unknown ids are ignored.
    pub fn unregister(&self, job_id: JobId) {
        self.handles().remove(&job_id);
    }

    /// Signal every registered handle.
    pub fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = self.handles().values().cloned().collect();
        tracing::debug!(count = tokens.len(), "Cancelling all registered jobs");
        for token in tokens {
            token.cancel();
        }
    }

    pub fn is_registered(&self, job_id: JobId) -> bool {
        self.handles().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }
}

/// Guard returned by [`CancellationRegistry::register_scoped`].
///
/// Unregisters on drop, but only if this guard created the handle.
pub struct ScopedRegistration<'a> {
    registry: &'a CancellationRegistry,
    job_id: JobId,
    token: Option<CancellationToken>,
}

impl ScopedRegistration<'_> {
    /// The job-specific token, absent after a duplicate registration.
    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }
}

impl Drop for ScopedRegistration<'_> {
    fn drop(&mut self) {
        if self.token.is_some() {
            self.registry.unregister(self.job_id);
        }
    }
}

/// Which source fired a [`LinkedCancellation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// The job's own handle was signalled (stop or restart).
    Job,
    /// The process is shutting down.
    Shutdown,
}

/// A token that fires when either the job handle or the shutdown token fires.
///
/// The shutdown side is a parent/child link; the job side is forwarded by a
/// small task that is aborted when this value drops.
pub struct LinkedCancellation {
    token: CancellationToken,
    job: Option<CancellationToken>,
    shutdown: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
}

impl LinkedCancellation {
    /// Must be called from within a tokio runtime when `job` is present.
    pub fn new(job: Option<&CancellationToken>, shutdown: &CancellationToken) -> Self {
        let token = shutdown.child_token();

        let forwarder = job.map(|job| {
            let job = job.clone();
            let linked = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = job.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            })
        });

        Self {
            token,
            job: job.cloned(),
            shutdown: shutdown.clone(),
            forwarder,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// The source that fired, if any.
    ///
    /// Shutdown takes precedence: cancelling all jobs at shutdown also fires
    /// every job handle.
    pub fn cause(&self) -> Option<CancelCause> {
        if self.shutdown.is_cancelled() {
            Some(CancelCause::Shutdown)
        } else if self.job.as_ref().is_some_and(CancellationToken::is_cancelled) {
            Some(CancelCause::Job)
        } else {
            None
        }
    }
}

impl Drop for LinkedCancellation {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();

        let first = registry.register(id).unwrap();
        assert!(registry.register(id).is_none());

        // The original handle is still the live one
        assert!(registry.request_cancel(id));
        assert!(first.is_cancelled());
    }

    #[test]
    fn request_cancel_is_idempotent() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();
        assert!(!registry.request_cancel(id));

        registry.register(id);
        assert!(registry.request_cancel(id));
        assert!(registry.request_cancel(id));

        registry.unregister(id);
        registry.unregister(id);
        assert!(!registry.request_cancel(id));
    }

    #[test]
    fn cancel_all_signals_every_handle() {
        let registry = CancellationRegistry::new();
        let tokens: Vec<_> = (0..3)
            .map(|_| registry.register(JobId::new()).unwrap())
            .collect();
        registry.cancel_all();
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn scoped_registration_only_releases_its_own_handle() {
        let registry = CancellationRegistry::new();
        let id = JobId::new();

        let outer = registry.register_scoped(id);
        assert!(outer.token().is_some());
        {
            let duplicate = registry.register_scoped(id);
            assert!(duplicate.token().is_none());
        }
        assert!(registry.is_registered(id));

        drop(outer);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn linked_token_reports_job_cause() {
        let job = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let linked = LinkedCancellation::new(Some(&job), &shutdown);
        assert_eq!(linked.cause(), None);

        job.cancel();
        tokio::time::timeout(Duration::from_secs(1), linked.token().cancelled())
            .await
            .unwrap();
        assert_eq!(linked.cause(), Some(CancelCause::Job));
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_wins_over_job_cause() {
        let job = CancellationToken::new();
        let shutdown = CancellationToken::new();
        let linked = LinkedCancellation::new(Some(&job), &shutdown);

        shutdown.cancel();
        job.cancel();
        assert!(linked.token().is_cancelled());
        assert_eq!(linked.cause(), Some(CancelCause::Shutdown));
    }

    #[tokio::test]
    async fn linked_without_job_handle_follows_shutdown() {
        let shutdown = CancellationToken::new();
        let linked = LinkedCancellation::new(None, &shutdown);
        assert!(!linked.is_cancelled());
        shutdown.cancel();
        assert!(linked.token().is_cancelled());
        assert_eq!(linked.cause(), Some(CancelCause::Shutdown));
    }
}

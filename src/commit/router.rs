use crate::driver::ConnectionRole;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Picks the connection each statement runs on. Writes always go to the
/// primary; reads go to the replica unless replica reads are disabled or a
/// force-write scope is open.
#[derive(Debug, Default)]
pub struct ConnectionRouter {
    replica_reads: bool,
    forced: AtomicUsize,
}

impl ConnectionRouter {
    pub fn new(replica_reads: bool) -> Self {
        Self {
            replica_reads,
            forced: AtomicUsize::new(0),
        }
    }

    pub fn route(&self, is_write: bool) -> ConnectionRole {
        if is_write || !self.replica_reads || self.is_forced() {
            ConnectionRole::Primary
        } else {
            ConnectionRole::Replica
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire) > 0
    }

    /// Pins every statement to the primary until the guard drops. Scopes nest.
    pub fn force_write(&self) -> ForceWriteGuard<'_> {
        let depth = self.forced.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(depth, "force-write scope opened");
        ForceWriteGuard { router: self }
    }

    /// Runs `scope` with the primary pinned.
    ///
    /// The pin belongs to the router, not to the calling task: while the
    /// scope is open, reads issued by any other task sharing this router
    /// also go to the primary.
    pub async fn with_write_connection<F, Fut, T>(&self, scope: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.force_write();
        scope().await
    }
}

#[must_use = "the primary is only pinned while the guard is alive"]
pub struct ForceWriteGuard<'a> {
    router: &'a ConnectionRouter,
}

impl Drop for ForceWriteGuard<'_> {
    fn drop(&mut self) {
        let depth = self.router.forced.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(depth, "force-write scope closed");
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct Registry {
    /// Sitting in the work queue, not yet picked up
    pending: HashSet<Uuid>,
    /// Being driven by a worker in this process
    running: HashMap<Uuid, CancellationToken>,
}

/// Jobs this process currently owns, with the token that cancels each one.
///
/// The recovery sweep consults this before touching a job so that a job
/// driven here is never also re-driven as stale.
#[derive(Default)]
pub struct ActiveJobs {
    inner: Mutex<Registry>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `id` is queued. Returns false if it is already queued or running.
    pub fn mark_pending(&self, id: Uuid) -> bool {
        let mut reg = self.lock();
        if reg.running.contains_key(&id) {
            return false;
        }
        reg.pending.insert(id)
    }

    pub fn unmark_pending(&self, id: Uuid) {
        self.lock().pending.remove(&id);
    }

    /// Take ownership of `id` for a worker. The returned token is a child of
    /// `parent`, so halting the orchestrator cancels it too. `None` if some
    /// other worker already owns the job.
    pub fn register(&self, id: Uuid, parent: &CancellationToken) -> Option<CancellationToken> {
        let mut reg = self.lock();
        reg.pending.remove(&id);
        if reg.running.contains_key(&id) {
            return None;
        }
        let token = parent.child_token();
        reg.running.insert(id, token.clone());
        Some(token)
    }

    /// Signal the in-flight run of `id`. Returns false if it is not running here.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock().running.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.lock().running.remove(&id);
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.lock().running.contains_key(&id)
    }

    /// Queued or running in this process.
    pub fn is_tracked(&self, id: Uuid) -> bool {
        let reg = self.lock();
        reg.pending.contains(&id) || reg.running.contains_key(&id)
    }

    pub fn running(&self) -> usize {
        self.lock().running.len()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

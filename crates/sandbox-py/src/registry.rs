use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sandbox::{ActiveExecution, SandboxError};

use crate::context::ExecutionContext;

/// In-flight executions keyed by session id.
///
/// Owned by one manager; every method holds the lock only for the map
/// operation itself, so it is safe to call from `Drop` and signal paths.
#[derive(Default)]
pub struct ExecutionRegistry {
    entries: Mutex<HashMap<String, Arc<ExecutionContext>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ExecutionContext>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register `ctx`. Fails if its session id is already live.
    pub fn insert(&self, ctx: Arc<ExecutionContext>) -> sandbox::Result<()> {
        let mut entries = self.lock();
        let id = ctx.session_id().to_owned();
        if entries.contains_key(&id) {
            return Err(SandboxError::SessionExists(id));
        }
        entries.insert(id, ctx);
        Ok(())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ExecutionContext>> {
        self.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<ExecutionContext>> {
        self.lock().remove(session_id)
    }

    /// Remove the entry only if it is still `ctx`, so a finished execution
    /// never evicts a newer one that reused its id.
    pub fn remove_if_same(&self, ctx: &Arc<ExecutionContext>) -> bool {
        let mut entries = self.lock();
        match entries.get(ctx.session_id()) {
            Some(current) if Arc::ptr_eq(current, ctx) => {
                entries.remove(ctx.session_id());
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<ActiveExecution> {
        let mut out: Vec<_> = self.lock().values().map(|ctx| ctx.snapshot()).collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        out
    }

    /// Remove and return every context older than twice its own timeout.
    pub fn drain_stale(&self) -> Vec<Arc<ExecutionContext>> {
        let mut entries = self.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, ctx)| ctx.is_stale())
            .map(|(id, _)| id.clone())
            .collect();
        stale.iter().filter_map(|id| entries.remove(id)).collect()
    }

    pub fn drain_all(&self) -> Vec<Arc<ExecutionContext>> {
        self.lock().drain().map(|(_, ctx)| ctx).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

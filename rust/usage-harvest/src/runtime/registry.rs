//! Liveness of this process's endpoint workers.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::scheduler::LivenessProbe;

/// Registry of worker tokens alive in this process.
///
/// Tokens have the form `<instance>:<uuid>`. A token with a foreign instance
/// prefix is never judged terminated here; such slots are only recovered
/// through the job time limit.
#[derive(Debug)]
pub struct WorkerRegistry {
    instance: String,
    live: Mutex<HashSet<String>>,
}

impl WorkerRegistry {
    /// Registry with a random instance id.
    pub fn new() -> Arc<Self> {
        Self::with_instance(Uuid::new_v4().simple().to_string())
    }

    /// Registry whose tokens carry the `instance` prefix.
    pub fn with_instance(instance: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.into(),
            live: Mutex::new(HashSet::new()),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Issue a fresh token, live until the guard is dropped.
    pub fn register(self: &Arc<Self>) -> WorkerGuard {
        let token = format!("{}:{}", self.instance, Uuid::new_v4());
        self.live.lock().insert(token.clone());
        WorkerGuard {
            registry: Arc::clone(self),
            token,
        }
    }

    /// Whether `worker_token` was issued here and its guard is still alive.
    pub fn is_live(&self, worker_token: &str) -> bool {
        self.live.lock().contains(worker_token)
    }

    /// Number of tokens whose guard is still alive.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn owns(&self, worker_token: &str) -> bool {
        worker_token
            .strip_prefix(self.instance.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl LivenessProbe for WorkerRegistry {
    fn is_terminated(&self, worker_token: &str) -> bool {
        self.owns(worker_token) && !self.is_live(worker_token)
    }
}

/// Keeps a worker token live. Dropping it, also while unwinding, retires the token.
#[derive(Debug)]
pub struct WorkerGuard {
    registry: Arc<WorkerRegistry>,
    token: String,
}

impl WorkerGuard {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.live.lock().remove(&self.token);
    }
}

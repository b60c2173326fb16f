use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Handle to one live client session, for idle reaping and shutdown.
pub struct SessionHandle {
    pub cancel: CancellationToken,
    pub last_active: Arc<AtomicU64>,
}

/// Tracks live client sessions so the proxy can cap kept-alive connections
/// and cancel the ones that sit idle too long.
pub struct ConnSet {
    sessions: DashMap<u64, SessionHandle>,
    count: AtomicI64,
    next_id: AtomicU64,
}

impl ConnSet {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            count: AtomicI64::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, cancel: CancellationToken) -> (u64, Arc<AtomicU64>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let last_active = Arc::new(AtomicU64::new(epoch_seconds()));
        self.sessions.insert(
            id,
            SessionHandle {
                cancel,
                last_active: Arc::clone(&last_active),
            },
        );
        self.count.fetch_add(1, Ordering::Relaxed);
        (id, last_active)
    }

    pub fn remove(&self, id: u64) {
        if self.sessions.remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Cancels every session whose last activity is older than
    /// `idle_timeout_secs`. The session task removes itself on exit.
    pub fn cancel_idle(&self, idle_timeout_secs: u64) {
        let now = epoch_seconds();
        for entry in self.sessions.iter() {
            let last = entry.value().last_active.load(Ordering::Relaxed);
            if now.saturating_sub(last) > idle_timeout_secs {
                entry.value().cancel.cancel();
            }
        }
    }
}

impl Default for ConnSet {
    fn default() -> Self {
        Self::new()
    }
}

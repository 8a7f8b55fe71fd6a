//! Live query registrations.
//!
//! The server notifies the hub after every committed write. Watchers are
//! invoked on the writing thread, after the registry lock has been released,
//! so a watcher may re-run its query or drop its own handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use log::{debug, warn};

/// Invoked when the result of a watched query may have changed.
pub type InvalidateFn = Arc<dyn Fn() + Send + Sync>;

struct Watcher {
    query: String,
    on_invalidate: InvalidateFn,
}

/// Registry of live query watchers.
pub struct QueryHub {
    watchers: RwLock<HashMap<u64, Watcher>>,
    next_id: AtomicU64,
}

impl QueryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            watchers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers `on_invalidate` for `query`. The watcher stays registered
    /// until the returned handle is unsubscribed or dropped.
    pub fn watch(self: &Arc<Self>, query: &str, on_invalidate: InvalidateFn) -> WatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.watchers.write() {
            Ok(mut watchers) => {
                watchers.insert(
                    id,
                    Watcher {
                        query: query.to_string(),
                        on_invalidate,
                    },
                );
            }
            Err(_) => warn!("Query hub lock poisoned; watcher for {query} not registered"),
        }
        debug!("Watching {query} as watcher {id}");

        WatchHandle {
            id,
            hub: Arc::downgrade(self),
        }
    }

    /// Invokes every watcher. There is a single table, so every query is affected.
    pub fn notify_table_changed(&self) {
        let callbacks: Vec<(u64, InvalidateFn)> = match self.watchers.read() {
            Ok(watchers) => watchers
                .iter()
                .map(|(id, w)| (*id, Arc::clone(&w.on_invalidate)))
                .collect(),
            Err(_) => {
                warn!("Query hub lock poisoned; skipping notification");
                return;
            }
        };

        for (id, callback) in callbacks {
            debug!("Invalidating watcher {id}");
            callback();
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.read().map(|w| w.len()).unwrap_or(0)
    }

    /// Number of watchers registered for `query`.
    pub fn watchers_of(&self, query: &str) -> usize {
        self.watchers
            .read()
            .map(|w| w.values().filter(|watcher| watcher.query == query).count())
            .unwrap_or(0)
    }

    fn remove(&self, id: u64) {
        if let Ok(mut watchers) = self.watchers.write() {
            if let Some(watcher) = watchers.remove(&id) {
                debug!("Stopped watching {} (watcher {id})", watcher.query);
            }
        }
    }
}

/// Keeps a watcher registered. Dropping it unsubscribes.
pub struct WatchHandle {
    id: u64,
    hub: Weak<QueryHub>,
}

impl WatchHandle {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle").field("id", &self.id).finish()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

//! In-memory registry of live subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc::UnboundedSender;

use crate::filter::Filter;

/// Identifier of an accepted connection.
pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a fresh connection id. Monotonic across the process, so two live
/// connections can never collide.
pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Registry key: one subscription per `(connection, request id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubKey {
    pub conn: ConnId,
    pub req: String,
}

/// A live subscription: the original filter set plus the owning connection's
/// outbound sink.
///
/// Fan-out frames arriving while the historical phase is still streaming are
/// buffered and flushed after EOSE, so a live EVENT can never precede it.
pub struct Subscription {
    pub key: SubKey,
    pub filters: Vec<Filter>,
    sink: UnboundedSender<String>,
    closed: AtomicBool,
    /// `Some(buffer)` while historical, `None` once live.
    pending: Mutex<Option<Vec<String>>>,
}

impl Subscription {
    fn new(key: SubKey, filters: Vec<Filter>, sink: UnboundedSender<String>) -> Self {
        Self {
            key,
            filters,
            sink,
            closed: AtomicBool::new(false),
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    /// Queue or send one outbound frame, depending on phase.
    pub fn deliver(&self, frame: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.as_mut() {
            Some(buffer) => buffer.push(frame),
            None => {
                let _ = self.sink.send(frame);
            }
        }
    }

    /// End the historical phase: flush buffered frames and go live.
    pub fn go_live(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(buffer) = pending.take() {
            for frame in buffer {
                if self.closed.load(Ordering::Acquire) {
                    break;
                }
                let _ = self.sink.send(frame);
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Process-wide subscription table guarded by a reader-writer lock.
///
/// Mutations never suspend while holding the lock; iteration works on a
/// snapshot so concurrent add/remove cannot deadlock.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<SubKey, Arc<Subscription>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscription, replacing (and closing) any previous one under
    /// the same key.
    pub fn add(
        &self,
        key: SubKey,
        filters: Vec<Filter>,
        sink: UnboundedSender<String>,
    ) -> Arc<Subscription> {
        let sub = Arc::new(Subscription::new(key.clone(), filters, sink));
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = map.insert(key, sub.clone()) {
            old.close();
        }
        sub
    }

    /// Remove one subscription. After this returns, no further frame is
    /// delivered for the key.
    pub fn remove(&self, key: &SubKey) -> Option<Arc<Subscription>> {
        let removed = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            map.remove(key)
        };
        if let Some(sub) = &removed {
            sub.close();
        }
        removed
    }

    /// Drop every subscription owned by a closing connection.
    pub fn remove_all_for_connection(&self, conn: ConnId) {
        let removed: Vec<Arc<Subscription>> = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<SubKey> = map.keys().filter(|k| k.conn == conn).cloned().collect();
            keys.into_iter().filter_map(|k| map.remove(&k)).collect()
        };
        for sub in removed {
            sub.close();
        }
    }

    /// Stable copy of the current entries for iteration.
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

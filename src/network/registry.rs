//! Pending request bookkeeping for the client role

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;

/// A request waiting for its response
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u32,
    /// Route the request went to; responses are decoded with it
    pub route: String,
    pub created_at: Instant,
    responder: oneshot::Sender<Value>,
}

impl PendingRequest {
    /// Hand the response to the waiting caller
    ///
    /// Returns false if the caller already gave up.
    pub fn deliver(self, value: Value) -> bool {
        self.responder.send(value).is_ok()
    }
}

/// Outcome of resolving a response id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    UnknownId,
}

#[derive(Debug)]
struct Inner {
    next_id: u32,
    pending: HashMap<u32, PendingRequest>,
}

/// Maps request ids to waiting callers
///
/// Each entry leaves the registry exactly once: by response, by
/// cancellation, or when the connection closes.
#[derive(Debug, Clone)]
pub struct RequestRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 1,
                pending: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate the next request id
    ///
    /// Ids increase from 1. On wrap-around 0 and ids still pending are
    /// skipped.
    pub fn next_id(&self) -> u32 {
        let mut inner = self.lock();
        loop {
            let id = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if id != 0 && !inner.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a caller for `id` and get the receiving end
    pub fn register(&self, id: u32, route: impl Into<String>) -> oneshot::Receiver<Value> {
        let (responder, rx) = oneshot::channel();
        let pending = PendingRequest {
            id,
            route: route.into(),
            created_at: Instant::now(),
            responder,
        };
        if self.lock().pending.insert(id, pending).is_some() {
            tracing::warn!("Request id {} registered twice, dropping the older caller", id);
        }
        rx
    }

    /// Remove the entry for `id` without delivering anything
    pub fn take(&self, id: u32) -> Option<PendingRequest> {
        self.lock().pending.remove(&id)
    }

    /// Deliver a response to the caller waiting on `id`
    ///
    /// `decode` builds the value from the pending entry and runs outside
    /// the registry lock. It is not called for an unknown id.
    pub fn resolve<F>(&self, id: u32, decode: F) -> Resolution
    where
        F: FnOnce(&PendingRequest) -> Value,
    {
        match self.take(id) {
            Some(pending) => {
                let value = decode(&pending);
                if !pending.deliver(value) {
                    tracing::debug!("Caller for request {} is gone", id);
                }
                Resolution::Delivered
            }
            None => Resolution::UnknownId,
        }
    }

    /// Drop the entry for `id`; the caller is not invoked
    pub fn cancel(&self, id: u32) -> bool {
        self.take(id).is_some()
    }

    /// Drop every entry; waiting callers see their channel close
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        drained.len()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

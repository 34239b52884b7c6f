//! Connection state shared by both peer roles

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::PackageType;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, handshake not finished
    Inited,
    /// Server replied to the handshake, waiting for the client's ack
    WaitAck,
    /// Handshake complete, ready for traffic
    Working,
    /// Closed; absorbing
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Inited => "inited",
            ConnectionState::WaitAck => "wait-ack",
            ConnectionState::Working => "working",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of the link this connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Whether a package of this type is expected in this state
///
/// Everything else is dropped without error.
pub fn accepts(role: Role, state: ConnectionState, package_type: PackageType) -> bool {
    use ConnectionState::*;
    use PackageType::*;

    match (role, state, package_type) {
        (_, Closed, _) => false,
        (_, Inited, Handshake) => true,
        (Role::Server, WaitAck, HandshakeAck) => true,
        (_, Working, Heartbeat | Data | Kick) => true,
        _ => false,
    }
}

/// Per-connection state behind a short-lived lock
///
/// Only the connection's own event loop moves the state forward; other
/// tasks read it. The lock is never held across an await.
#[derive(Debug, Clone)]
pub struct StateCell {
    inner: Arc<Mutex<ConnectionState>>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionState::Inited)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        // A plain enum cannot be left half-written by a panicking holder
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> ConnectionState {
        *self.lock()
    }

    /// Move `from` -> `to`; fails if the state is not `from` or is `Closed`
    pub fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.lock();
        if *state != from || *state == ConnectionState::Closed {
            return false;
        }
        *state = to;
        true
    }

    /// Enter `Closed`; true only for the call that actually closed it
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }

    pub fn is_working(&self) -> bool {
        self.get() == ConnectionState::Working
    }

    pub fn is_closed(&self) -> bool {
        self.get() == ConnectionState::Closed
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

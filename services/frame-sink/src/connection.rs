//! Owned backend transport with lifecycle tracking.
//!
//! A [`ConnectionHandle`] moves through
//! `Disconnected -> Connecting -> Connected -> (Failed | Closed)`.
//! `Failed` and `Closed` are terminal: a handle never reconnects on its own.

use crate::endpoint::Endpoint;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle state of a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether the state can never lead back to `Connected`
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusively owned transport for one backend
pub struct ConnectionHandle<T> {
    backend: &'static str,
    endpoint: Endpoint,
    state: ConnectionState,
    transport: Option<T>,
}

impl<T> ConnectionHandle<T> {
    /// Create a handle that has not attempted a connection yet
    pub fn new(backend: &'static str, endpoint: Endpoint) -> Self {
        Self {
            backend,
            endpoint,
            state: ConnectionState::Disconnected,
            transport: None,
        }
    }

    /// Run `connect` for this endpoint. On error the handle is left `Failed`.
    pub fn establish<E, F>(&mut self, connect: F) -> Result<(), E>
    where
        F: FnOnce(&Endpoint) -> Result<T, E>,
        E: fmt::Display,
    {
        self.state = ConnectionState::Connecting;
        debug!(backend = self.backend, endpoint = %self.endpoint, "Connecting");

        match connect(&self.endpoint) {
            Ok(transport) => {
                self.transport = Some(transport);
                self.state = ConnectionState::Connected;
                info!(backend = self.backend, endpoint = %self.endpoint, "Connected");
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                warn!(
                    backend = self.backend,
                    endpoint = %self.endpoint,
                    error = %e,
                    "Connection failed"
                );
                Err(e)
            }
        }
    }

    /// The transport, only while `Connected`
    pub fn transport_mut(&mut self) -> Option<&mut T> {
        match self.state {
            ConnectionState::Connected => self.transport.as_mut(),
            _ => None,
        }
    }

    /// Mark the transport as broken and release it
    pub fn mark_failed(&mut self) {
        if self.state == ConnectionState::Connected {
            warn!(backend = self.backend, endpoint = %self.endpoint, "Connection marked failed");
        }
        self.transport = None;
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Failed;
        }
    }

    /// Release the transport. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.transport.take().is_some() {
            info!(backend = self.backend, endpoint = %self.endpoint, "Connection closed");
        }
        self.state = ConnectionState::Closed;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }
}

impl<T> Drop for ConnectionHandle<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> fmt::Debug for ConnectionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish()
    }
}

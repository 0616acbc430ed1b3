//! Relay Coordinator.
//!
//! Drives the per-connection lifecycle independently of the transport:
//!
//! ```text
//! Connecting ──open()──> Open ──close()──> Closed
//!                         │
//!                  handle_frame() -> MessageRouter::route
//! ```
//!
//! The coordinator owns the connection → identity side table. A connection
//! is Open exactly while it has a row there, and removing the row is what
//! decides which of several concurrent close signals performs cleanup.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame};
use crate::router::{MessageRouter, RouteOutcome};
use crate::types::{ConnectionId, ConnectionState, Identity, InboundMessage};

/// Default capacity of each connection's outbound buffer.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// A connection that has just transitioned to Open.
///
/// The transport driver writes every frame received on `outbound` to the
/// client.
#[derive(Debug)]
pub struct OpenConnection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub outbound: mpsc::Receiver<OutboundFrame>,
}

/// Result of processing one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The connection is not open; the payload was ignored
    Unknown,
    /// The payload did not parse as a message and was dropped
    Malformed,
    /// The payload was handed to the router
    Routed(RouteOutcome),
}

/// Glues the registry and router together per connection.
pub struct RelayCoordinator {
    registry: Arc<ConnectionRegistry>,
    router: MessageRouter,
    sessions: DashMap<ConnectionId, Identity>,
    outbound_buffer: usize,
}

impl RelayCoordinator {
    pub fn new(router: MessageRouter, outbound_buffer: usize) -> Self {
        Self {
            registry: Arc::clone(router.registry()),
            router,
            sessions: DashMap::new(),
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    /// Connecting → Open for a pre-verified identity.
    #[instrument(skip(self, identity), fields(identity = %identity))]
    pub fn open(&self, identity: Identity) -> OpenConnection {
        let id = ConnectionId::new();
        debug!(connection = %id, state = %ConnectionState::Connecting, "Accepting connection");

        let (sender, outbound) = mpsc::channel(self.outbound_buffer);
        self.sessions.insert(id, identity.clone());
        self.registry
            .register(identity.clone(), ConnectionHandle::new(id, sender));

        info!(connection = %id, state = %ConnectionState::Open, "Connection open");
        OpenConnection {
            id,
            identity,
            outbound,
        }
    }

    /// Process one inbound text payload from an open connection.
    pub fn handle_frame(&self, connection_id: ConnectionId, payload: &str) -> FrameOutcome {
        let Some(identity) = self
            .sessions
            .get(&connection_id)
            .map(|entry| entry.value().clone())
        else {
            debug!(connection = %connection_id, "Frame for connection that is not open");
            return FrameOutcome::Unknown;
        };

        match InboundMessage::parse(payload) {
            Ok(inbound) => FrameOutcome::Routed(self.router.route(&identity, inbound)),
            Err(err) => {
                debug!(
                    connection = %connection_id,
                    identity = %identity,
                    error = %err,
                    "Dropping malformed frame"
                );
                FrameOutcome::Malformed
            }
        }
    }

    /// Open → Closed. Returns `true` only for the call that performed cleanup.
    pub fn close(&self, connection_id: ConnectionId) -> bool {
        match self.sessions.remove(&connection_id) {
            Some((_, identity)) => {
                self.registry.unregister(&identity, connection_id);
                info!(
                    connection = %connection_id,
                    identity = %identity,
                    state = %ConnectionState::Closed,
                    "Connection closed"
                );
                true
            }
            None => false,
        }
    }

    /// Drop guard that closes `connection_id` when the driver ends.
    pub fn guard(self: &Arc<Self>, connection_id: ConnectionId) -> ConnectionGuard {
        ConnectionGuard {
            coordinator: Arc::clone(self),
            connection_id,
        }
    }

    /// Current state of a connection. Never `Connecting`: `open` completes
    /// the transition before handing out the id. Unknown ids are `Closed`.
    pub fn state(&self, connection_id: ConnectionId) -> ConnectionState {
        if self.sessions.contains_key(&connection_id) {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    /// Identity a live connection authenticated as.
    pub fn identity_of(&self, connection_id: ConnectionId) -> Option<Identity> {
        self.sessions
            .get(&connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Ask every live connection of `identity` to close.
    ///
    /// Cleanup still happens through each driver's normal close path.
    pub fn disconnect(&self, identity: &Identity) -> usize {
        let mut signalled = 0;
        for handle in self.registry.connections_for(identity) {
            match handle.deliver(OutboundFrame::Close) {
                Ok(()) => signalled += 1,
                Err(err) => warn!(
                    connection = %handle.id(),
                    error = %err,
                    "Failed to signal close"
                ),
            }
        }
        signalled
    }

    /// Ask every live connection to close (used on shutdown).
    pub fn disconnect_all(&self) -> usize {
        self.registry
            .online_identities()
            .iter()
            .map(|identity| self.disconnect(identity))
            .sum()
    }

    /// Presence snapshot.
    pub fn online_identities(&self) -> BTreeSet<Identity> {
        self.registry.online_identities()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for RelayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCoordinator")
            .field("open_connections", &self.sessions.len())
            .field("outbound_buffer", &self.outbound_buffer)
            .finish()
    }
}

/// Closes its connection on drop, so a driver that panics or is aborted
/// still unregisters.
#[derive(Debug)]
pub struct ConnectionGuard {
    coordinator: Arc<RelayCoordinator>,
    connection_id: ConnectionId,
}

impl ConnectionGuard {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.coordinator.close(self.connection_id);
    }
}

//! Connection Registry implementation.
//!
//! Tracks live connections per identity for fan-out and presence.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::types::{ConnectionId, Identity};

/// A frame to be written to a connection by its transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Serialized message text, shared between all recipients of a fan-out
    Text(Arc<str>),
    /// Ask the driver to close the channel
    Close,
}

/// Failure to hand a frame to a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection's outbound buffer is full (slow or hung client)
    #[error("outbound channel full")]
    ChannelFull,
    /// The connection's driver has gone away
    #[error("outbound channel closed")]
    ChannelClosed,
}

/// Handle to a live connection as held by the registry.
///
/// Only the sending half of the connection's outbound channel is kept, so
/// the registry never keeps a dead socket reachable.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<OutboundFrame>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<OutboundFrame>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn deliver(&self, frame: OutboundFrame) -> Result<(), DeliveryError> {
        self.sender.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::ChannelClosed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Registry of live connections keyed by identity.
///
/// Each identity bucket is guarded by its DashMap shard lock, so mutations
/// of one bucket are mutually exclusive with reads of the same bucket while
/// unrelated identities proceed in parallel. No lock is held across I/O:
/// readers get a cloned snapshot.
///
/// ## Usage
///
/// ```ignore
/// let registry = ConnectionRegistry::new();
///
/// let (tx, rx) = mpsc::channel(64);
/// registry.register(identity.clone(), ConnectionHandle::new(id, tx));
///
/// for handle in registry.connections_for(&identity) {
///     let _ = handle.deliver(frame.clone());
/// }
///
/// registry.unregister(&identity, id);
/// ```
pub struct ConnectionRegistry {
    buckets: DashMap<Identity, HashMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Add a connection to the identity's set, creating the set if absent.
    #[instrument(skip(self, identity, handle), fields(identity = %identity, connection = %handle.id()))]
    pub fn register(&self, identity: Identity, handle: ConnectionHandle) {
        let mut bucket = self.buckets.entry(identity).or_default();
        bucket.insert(handle.id(), handle);
        debug!(live = bucket.len(), "Registered connection");
    }

    /// Remove a connection from the identity's set.
    ///
    /// Idempotent. Empty sets are pruned. Returns whether the connection
    /// was present.
    #[instrument(skip(self, identity, connection_id), fields(identity = %identity, connection = %connection_id))]
    pub fn unregister(&self, identity: &Identity, connection_id: ConnectionId) -> bool {
        let removed = match self.buckets.get_mut(identity) {
            Some(mut bucket) => bucket.remove(&connection_id).is_some(),
            None => false,
        };

        // The shard guard above is released; prune under a fresh lock so a
        // concurrent register into this bucket is never lost.
        self.buckets.remove_if(identity, |_, bucket| bucket.is_empty());

        if removed {
            debug!("Unregistered connection");
        } else {
            debug!("Connection was not registered");
        }
        removed
    }

    /// Snapshot of the live connections for an identity (possibly empty).
    pub fn connections_for(&self, identity: &Identity) -> Vec<ConnectionHandle> {
        self.buckets
            .get(identity)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every identity with at least one live connection.
    pub fn online_identities(&self) -> BTreeSet<Identity> {
        self.buckets
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_online(&self, identity: &Identity) -> bool {
        self.buckets
            .get(identity)
            .map(|bucket| !bucket.is_empty())
            .unwrap_or(false)
    }

    /// Total number of live connections across all identities.
    pub fn connection_count(&self) -> usize {
        self.buckets.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of identities with at least one live connection.
    pub fn identity_count(&self) -> usize {
        self.buckets
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .count()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("identity_count", &self.buckets.len())
            .finish()
    }
}

//! Message routing.
//!
//! The router has two independent delivery paths:
//!
//! 1. **Real-time fan-out** to every live connection of the recipient,
//!    best-effort and non-blocking.
//! 2. **Durable hand-off** of one copy to the [`MessageSink`], always,
//!    so an offline recipient still gets the message later.
//!
//! Neither path surfaces errors to the sender.

use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::registry::{ConnectionRegistry, OutboundFrame};
use crate::sink::MessageSink;
use crate::types::{Identity, InboundMessage, RelayMessage};

/// Counts from a single routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteReport {
    /// Connections the message was queued to
    pub delivered: usize,
    /// Connections whose outbound channel refused the message
    pub failed: usize,
    /// Whether the sink accepted its copy
    pub forwarded: bool,
}

/// Result of [`MessageRouter::route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No recipient; nothing was sent anywhere
    Dropped,
    /// Fan-out and sink forward were attempted
    Routed(RouteReport),
}

impl RouteOutcome {
    pub fn report(&self) -> Option<&RouteReport> {
        match self {
            RouteOutcome::Dropped => None,
            RouteOutcome::Routed(report) => Some(report),
        }
    }
}

/// Routes addressed messages to live connections and the durable sink.
#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn MessageSink>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, sink: Arc<dyn MessageSink>) -> Self {
        Self { registry, sink }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Route an inbound message on behalf of `sender`.
    ///
    /// The message's `from` is always replaced with `sender`.
    #[instrument(skip(self, inbound), fields(from = %sender, to = %inbound.to))]
    pub fn route(&self, sender: &Identity, inbound: InboundMessage) -> RouteOutcome {
        let Some(message) = RelayMessage::stamp(sender, inbound) else {
            debug!("Dropping message without recipient");
            return RouteOutcome::Dropped;
        };

        let mut report = RouteReport::default();

        match message.to_json() {
            Ok(json) => {
                let frame = OutboundFrame::Text(Arc::from(json));
                // Snapshot under the bucket lock; sends happen with no lock held.
                for handle in self.registry.connections_for(&message.to) {
                    match handle.deliver(frame.clone()) {
                        Ok(()) => report.delivered += 1,
                        Err(err) => {
                            report.failed += 1;
                            warn!(
                                connection = %handle.id(),
                                error = %err,
                                "Delivery to connection failed"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to serialize message for fan-out");
            }
        }

        match self.sink.forward(&message) {
            Ok(()) => report.forwarded = true,
            Err(err) => error!(error = %err, "Failed to forward message to sink"),
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            forwarded = report.forwarded,
            "Message routed"
        );
        RouteOutcome::Routed(report)
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

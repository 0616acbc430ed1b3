//! # courier-core
//!
//! Connection registry and message routing core for the Courier relay.
//!
//! Clients hold one or more live channels, each tagged with a verified
//! [`Identity`]. The core tracks those channels, derives presence from them
//! and relays addressed messages to every live channel of the recipient,
//! while handing a copy of each routed message to a durable sink.
//!
//! ## Architecture
//!
//! ```text
//!   transport driver ──open/handle_frame/close──> RelayCoordinator
//!                                                    │        │
//!                                         register/unregister  route
//!                                                    v        v
//!                                        ConnectionRegistry <── MessageRouter ──> MessageSink
//!                                         DashMap<Identity,                      (QueueSink ->
//!                                          {ConnectionId -> mpsc::Sender}>        QueueConsumer)
//! ```
//!
//! The transport (WebSocket in `courier-server`) only moves frames; every
//! routing and presence decision lives here so it can be exercised without
//! sockets.

pub mod coordinator;
pub mod registry;
pub mod router;
pub mod sink;

mod types;

pub use coordinator::{ConnectionGuard, FrameOutcome, OpenConnection, RelayCoordinator};
pub use registry::{ConnectionHandle, ConnectionRegistry, DeliveryError, OutboundFrame};
pub use router::{MessageRouter, RouteOutcome, RouteReport};
pub use sink::{MessageSink, QueueConsumer, QueueSink, SinkError};
pub use types::*;

//! Connection Registry for real-time message routing.
//!
//! Tracks every live connection under the identity it authenticated as.
//! A single identity may hold several connections at once (one per device
//! or tab), and presence is derived from which identities currently hold
//! at least one.
//!
//! ## Architecture
//!
//! ```text
//! driver (alice, conn 1) ─┐                                   ┌─> mpsc::Sender (alice, conn 1)
//! driver (alice, conn 2) ─┼─> DashMap<Identity, {ConnectionId ─┼─> mpsc::Sender (alice, conn 2)
//! driver (bob,   conn 3) ─┘       -> ConnectionHandle}>        └─> mpsc::Sender (bob,   conn 3)
//! ```

mod connection_registry;

pub use connection_registry::{ConnectionHandle, ConnectionRegistry, DeliveryError, OutboundFrame};

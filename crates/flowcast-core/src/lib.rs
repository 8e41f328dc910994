//! # flowcast-core
//!
//! Foundation types shared by the flowcast server and client:
//!
//! - [`FlowEvent`]: a position-changing trade observed for a tracked trader
//! - [`Subscription`] / [`Channel`]: a connection's interest filter
//! - [`protocol`]: JSON wire messages exchanged over the WebSocket
//! - [`backoff`]: reconnect delay schedule
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod backoff;
pub mod errors;
pub mod events;
pub mod logging;
pub mod protocol;
pub mod subscription;
pub mod test_utils;

pub use backoff::BackoffPolicy;
pub use errors::ProtocolError;
pub use events::{FlowAction, FlowEvent, PositionSide};
pub use protocol::{ClientMessage, ServerMessage};
pub use subscription::{Channel, Subscription};

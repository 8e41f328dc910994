//! # flowcast-client
//!
//! Subscriber side of the flow stream.
//!
//! - [`state::SubscriberMachine`]: pure connection state machine with
//!   bounded exponential-backoff reconnects
//! - [`buffer::EventBuffer`]: newest-first, id-deduplicated, capacity-bounded
//! - [`driver::spawn_subscriber`]: tokio task that runs the machine against a
//!   real `WebSocket` and publishes status and buffer snapshots over `watch`
//!   channels

#![deny(unsafe_code)]

pub mod buffer;
pub mod driver;
pub mod errors;
pub mod state;

pub use buffer::EventBuffer;
pub use driver::{SubscriberConfig, SubscriberHandle, SubscriberStatus, spawn_subscriber};
pub use errors::ClientError;
pub use state::{Command, ConnectionState, SubscriberMachine};

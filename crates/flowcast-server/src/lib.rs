//! # flowcast-server
//!
//! Axum HTTP + `WebSocket` server that fans trade-flow events out to
//! subscribers.
//!
//! - `WebSocket` gateway: connection registry, per-connection subscriptions,
//!   message dispatch
//! - Liveness monitor: periodic ping sweep, eviction of silent peers
//! - Broadcaster: one delivery per matching connection per event
//! - Publish bridge: producer-facing [`publisher::FlowPublisher`] channel
//! - HTTP endpoints: `/health`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod publisher;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::ServerError;
pub use publisher::{FlowPublisher, PublishError};
pub use server::{FlowServer, ServerHandle};

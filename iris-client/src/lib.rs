//! # iris-client
//!
//! Client library for the iris relay.
//!
//! This crate provides:
//! - A relay connection that multiplexes concurrent requests
//! - Reply correlation with independent per-request timeouts
//! - Serving of inbound requests through a user [`Handler`]

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod ids;
pub mod pending;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::ClientError;
pub use handler::{Handler, HandlerError};
pub use pending::{Outcome, PendingTable};

use std::net::SocketAddr;

/// Connects to the relay at `addr`, joining `cluster` and serving its
/// requests with `handler`.
pub async fn connect<H: Handler>(
    addr: SocketAddr,
    cluster: impl Into<String>,
    handler: H,
) -> Result<Connection, ClientError> {
    Connection::connect(ConnectionConfig::new(addr), cluster, handler).await
}

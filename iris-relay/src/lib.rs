//! # iris-relay
//!
//! Message relay for iris clients.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Session handshake and cluster membership
//! - Round-robin request routing with reply correlation
//! - Expiry of routes whose requester has given up

pub mod config;
pub mod error;
pub mod router;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, NetworkConfig, RoutingConfig};
pub use error::RelayError;
pub use router::{MemberId, Router, RouterStats};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};

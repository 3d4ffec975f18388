//! quicway: a multi-worker QUIC server core for WebTransport traffic.
//!
//! The library covers the packet ingress pipeline and connection-identity
//! layer: a pool of SO_REUSEPORT UDP sockets feeding reader threads, a pool
//! of dispatcher workers that perform QUIC's stateless pre-handshake
//! rituals (version negotiation, retry with address-validation tokens), and
//! the registry/supervisor pair that maps connection IDs to per-connection
//! actors. Frame parsing, TLS, and packet serialization are delegated to
//! the underlying QUIC library.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod netio;
pub mod peer;
pub mod routing;
pub mod runtime;
pub mod server;
pub mod telemetry;

pub use config::ServerConfig;
pub use error::{CreateError, DropReason, TokenError};
pub use peer::PeerAddr;
pub use server::{start, RunningServer};

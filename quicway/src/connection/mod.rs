//! Connection lifecycle: registry, per-connection actors, supervision.

pub mod actor;
pub mod registry;
pub mod supervisor;


pub use registry::{ConnectionEntry, ConnectionRegistry};
pub use supervisor::ConnectionSupervisor;

use crate::peer::PeerAddr;

/// A validated datagram on its way to the connection actor that owns it.
#[derive(Debug)]
pub struct InboundDatagram {
    pub peer: PeerAddr,
    pub payload: Vec<u8>,
}

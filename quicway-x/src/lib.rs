//! quicway-x: Application Bridge Interface for the quicway server
//!
//! # Architecture: Asymmetric Channel Design
//!
//! This crate is the vocabulary shared between connection actors and
//! application handler tasks:
//!
//! ## Ingress (Actor → Handler): Bounded tokio::mpsc
//! - Per-connection bounded channel
//! - Provides automatic backpressure to the actor when the handler is slow
//! - The actor detects a full channel via try_send() and leans on QUIC flow
//!   control
//!
//! ## Egress (Handler → Actor): Bounded tokio::mpsc
//! - Commands are delivered into the owning actor's mailbox
//! - The actor applies them to its QUIC connection between packet events
//!
//! ## Zero-Copy Design
//! - All payloads are transferred as `bytes::Bytes` (reference-counted)
//!
//! ## Scalability Model
//! - Exactly one handler task per connection
//! - Event-driven patterns exclusively within that task

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Length of every connection ID this server issues.
pub const CONNECTION_ID_LEN: usize = 20;

/// Unique identifier for a QUIC connection.
///
/// This is the server-issued 20-byte connection ID; the same value keys the
/// server's connection registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub [u8; CONNECTION_ID_LEN]);

impl ConnectionId {
    /// Build a connection ID from a byte slice; fails unless it is exactly
    /// 20 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; CONNECTION_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Unique identifier for a stream within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x2) == 0
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x1) == 0
    }
}

/// Events sent from a connection actor to its handler task (ingress).
#[derive(Debug, Clone)]
pub enum Event {
    /// The QUIC handshake completed; the connection is usable.
    Established,
    /// The peer opened a new stream.
    StreamOpened {
        stream_id: StreamId,
        is_bidirectional: bool,
    },
    /// Data arrived on a stream.
    StreamData {
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    },
    /// A stream opened in response to `OpenBiStream`/`OpenUniStream`.
    StreamOpenedConfirm { stream_id: StreamId },
    /// An unreliable datagram arrived.
    DatagramReceived { data: Bytes },
    /// The connection entered the closing state.
    ConnectionClosing { error_code: u64, reason: String },
    /// The connection is gone; no further events follow.
    ConnectionClosed,
}

/// Commands sent from a handler task to its connection actor (egress).
#[derive(Debug, Clone)]
pub enum Command {
    OpenBiStream,
    OpenUniStream,
    StreamSend {
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    },
    DgramSend {
        data: Bytes,
    },
    Close {
        error_code: u64,
        reason: String,
    },
}

/// Error returned by [`ConnectionHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    /// The connection actor is gone; the command was not delivered.
    #[error("connection closed")]
    Closed,
}

/// Handle given to an application handler for one connection.
///
/// Holds the ingress event receiver directly — there is no poller thread in
/// between (events are polled via async methods) — plus a command sender
/// pointing back at the owning actor.
pub struct ConnectionHandle {
    id: ConnectionId,
    events: mpsc::Receiver<Event>,
    commands: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        events: mpsc::Receiver<Event>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            id,
            events,
            commands,
        }
    }

    /// The server-issued connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the actor has gone away
    /// and all buffered events are consumed.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Write data to a stream, optionally finishing it.
    pub async fn stream_send(
        &self,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<(), HandleError> {
        self.send(Command::StreamSend {
            stream_id,
            data,
            fin,
        })
        .await
    }

    /// Ask the actor to open a locally-initiated stream. The allocated id
    /// arrives as [`Event::StreamOpenedConfirm`].
    pub async fn stream_open(&self, bidirectional: bool) -> Result<(), HandleError> {
        let cmd = if bidirectional {
            Command::OpenBiStream
        } else {
            Command::OpenUniStream
        };
        self.send(cmd).await
    }

    /// Send an unreliable datagram.
    pub async fn dgram_send(&self, data: Bytes) -> Result<(), HandleError> {
        self.send(Command::DgramSend { data }).await
    }

    /// Close the connection with an application error code.
    pub async fn close(&self, error_code: u64, reason: &str) -> Result<(), HandleError> {
        self.send(Command::Close {
            error_code,
            reason: reason.to_string(),
        })
        .await
    }

    async fn send(&self, cmd: Command) -> Result<(), HandleError> {
        self.commands.send(cmd).await.map_err(|_| HandleError::Closed)
    }
}

/// The trait an application implements to handle QUIC connections.
///
/// One handler instance is created per connection and driven by exactly one
/// task; implementations must not spawn additional tasks per connection.
#[async_trait]
pub trait ConnectionHandler: Send + 'static {
    /// Entry point: consume events from the handle until it yields `None`.
    async fn on_connection(self: Box<Self>, handle: ConnectionHandle);
}

/// Factory producing a fresh handler for each accepted connection.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync>;

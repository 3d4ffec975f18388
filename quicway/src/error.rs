//! Error types for the packet ingress pipeline.

use thiserror::Error;

/// Why an inbound datagram was discarded without a response.
///
/// Per-packet errors are absorbed by the dispatcher as drops; peers observe
/// only the absence of a response and retransmit on their own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header parse failed.
    MalformedPacket,
    /// DCID length not in {0, 20}.
    BadDcidLength,
    /// Token failed MAC, address binding, or freshness.
    InvalidToken,
    /// CID not registered and the packet is not an Initial.
    UnknownConnection,
    /// Initial carried in a datagram below the 1200-byte minimum.
    UndersizedInitial,
    /// An inbox or send queue was full.
    QueueFull,
    /// Registry/supervisor/OS failure while establishing a connection.
    SystemError,
}

impl DropReason {
    /// Stable label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::MalformedPacket => "malformed_packet",
            DropReason::BadDcidLength => "bad_dcid_length",
            DropReason::InvalidToken => "invalid_token",
            DropReason::UnknownConnection => "unknown_connection",
            DropReason::UndersizedInitial => "undersized_initial",
            DropReason::QueueFull => "queue_full",
            DropReason::SystemError => "system_error",
        }
    }
}

/// Retry-token validation failure. All variants surface as `invalid_token`
/// at the dispatch layer; the split exists for logging and tests.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    /// Token shorter than the fixed framing + MAC, or framing inconsistent.
    #[error("invalid token")]
    Malformed,
    /// Token issued outside the freshness window.
    #[error("invalid token: expired")]
    Expired,
    /// MAC did not verify for this peer address and connection ID.
    #[error("invalid token: bad authenticator")]
    BadMac,
}

/// Failure to establish a connection actor.
#[derive(Debug, Error)]
pub enum CreateError {
    /// Another actor already owns this connection ID. The caller adopts the
    /// existing actor; this is not a failure of the pipeline.
    #[error("already registered")]
    AlreadyRegistered,
    /// The QUIC library refused the connection.
    #[error("system error: {0}")]
    System(#[from] quiche::Error),
    /// The server is tearing down; no new connections.
    #[error("shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_reason_labels_are_stable() {
        assert_eq!(DropReason::InvalidToken.label(), "invalid_token");
        assert_eq!(DropReason::UnknownConnection.label(), "unknown_connection");
        assert_eq!(DropReason::BadDcidLength.label(), "bad_dcid_length");
    }
}

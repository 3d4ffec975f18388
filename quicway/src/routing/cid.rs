//! Connection ID derivation.
//!
//! The server issues 20-byte connection IDs derived deterministically from
//! the peer's DCID under a process-wide secret. The same peer DCID always
//! yields the same local CID, so a Retry and the Initial that answers it
//! bind to the same connection identity without any per-request state.

use quicway_x::{ConnectionId, CONNECTION_ID_LEN};
use ring::hmac;

/// Length of every locally issued connection ID.
pub const LOCAL_CID_LEN: usize = CONNECTION_ID_LEN;

/// Derive the local connection ID for a peer-chosen DCID.
///
/// HMAC-SHA256 keyed by `conn_id_secret`, truncated to 20 bytes.
pub fn derive(conn_id_secret: &[u8], dcid: &[u8]) -> ConnectionId {
    let key = hmac::Key::new(hmac::HMAC_SHA256, conn_id_secret);
    let tag = hmac::sign(&key, dcid);

    let mut out = [0u8; LOCAL_CID_LEN];
    out.copy_from_slice(&tag.as_ref()[..LOCAL_CID_LEN]);
    ConnectionId(out)
}

//! Connection identity and dispatcher sharding.
//!
//! Everything that decides *which* dispatcher owns a datagram lives here:
//! the keyed CID derivation, the retry-token mint/validate pair, and the
//! SipHash shard function. The shard key is the packet's local CID — the
//! DCID itself once it is a server-issued 20-byte value, otherwise the CID
//! that would be derived for it — so all packets of one connection reach
//! the same dispatcher and registry lookups stay contention-free in the
//! steady state.

pub mod cid;
pub mod token;

#[cfg(test)]
mod tests;

pub use cid::{derive, LOCAL_CID_LEN};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use siphasher::sip::SipHasher13;
use std::collections::HashSet;
use std::hash::Hasher;

// Fixed keys: shard placement must be stable for the lifetime of the
// process (a rehash would strand established connections on the wrong
// worker), and has no adversarial-collision concern because the input is
// already a keyed PRF output.
const SHARD_HASH_KEY: (u64, u64) = (0x7157_6c77_6179_2d73, 0x6861_7264_2d6b_6579);

/// Shard a datagram onto a dispatcher by its local CID.
///
/// Returns `None` for a zero-length DCID; the caller falls back to
/// round-robin.
pub fn shard_for_dcid(conn_id_secret: &[u8], dcid: &[u8], dispatchers: usize) -> Option<usize> {
    if dcid.is_empty() {
        return None;
    }

    let mut hasher = SipHasher13::new_with_keys(SHARD_HASH_KEY.0, SHARD_HASH_KEY.1);
    if dcid.len() == LOCAL_CID_LEN {
        hasher.write(dcid);
    } else {
        hasher.write(derive(conn_id_secret, dcid).as_bytes());
    }
    Some((hasher.finish() % dispatchers as u64) as usize)
}

/// Process-wide dispatcher registry.
///
/// Dispatchers register under an (endpoint, index) key before entering
/// their loop. A duplicate registration means a supervisor restarted a
/// worker that is still registered; the spawn becomes a no-op success so
/// supervision stays idempotent.
static DISPATCHERS: Lazy<Mutex<HashSet<(String, usize)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Returns `false` if the key is already taken.
pub fn register_dispatcher(endpoint: &str, index: usize) -> bool {
    DISPATCHERS.lock().insert((endpoint.to_string(), index))
}

pub fn unregister_dispatcher(endpoint: &str, index: usize) {
    DISPATCHERS.lock().remove(&(endpoint.to_string(), index));
}

//! Retry-token mint and validation.
//!
//! Tokens are opaque to clients but bind, under an HMAC keyed by the
//! process-wide `token_secret`:
//!
//! - the peer address, so a spoofed-source client cannot replay one;
//! - the ODCID, so the original-DCID transport parameter can be restored
//!   during the TLS handshake;
//! - the newly issued CID, so a token only validates for the connection it
//!   was minted for;
//! - the issuance time, enforced against [`TOKEN_LIFETIME`].
//!
//! Wire form: `issued_unix_secs (8, BE) || odcid_len (1) || odcid || tag (32)`.

use crate::error::TokenError;
use crate::peer::PeerAddr;
use quicway_x::ConnectionId;
use ring::hmac;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a minted token stays valid.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(10);

/// HMAC-SHA256 tag length.
const TAG_LEN: usize = 32;

/// Shortest well-formed token: timestamp + length byte + empty ODCID + tag.
const MIN_TOKEN_LEN: usize = 8 + 1 + TAG_LEN;

/// Largest ODCID a QUIC v1 client can have chosen.
const MAX_ODCID_LEN: usize = 20;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn mac_input(issued: u64, odcid: &[u8], peer: &PeerAddr, new_cid: &ConnectionId) -> Vec<u8> {
    let mut msg = Vec::with_capacity(8 + 1 + odcid.len() + 18 + new_cid.as_bytes().len());
    msg.extend_from_slice(&issued.to_be_bytes());
    msg.push(odcid.len() as u8);
    msg.extend_from_slice(odcid);
    msg.extend_from_slice(&peer.mac_bytes());
    msg.extend_from_slice(new_cid.as_bytes());
    msg
}

/// Mint a token for `peer`, binding the original DCID and the CID the
/// server is about to hand out in its Retry.
pub fn mint(peer: &PeerAddr, odcid: &[u8], new_cid: &ConnectionId, token_secret: &[u8]) -> Vec<u8> {
    mint_at(peer, odcid, new_cid, token_secret, unix_now())
}

pub(crate) fn mint_at(
    peer: &PeerAddr,
    odcid: &[u8],
    new_cid: &ConnectionId,
    token_secret: &[u8],
    issued: u64,
) -> Vec<u8> {
    debug_assert!(odcid.len() <= MAX_ODCID_LEN);

    let key = hmac::Key::new(hmac::HMAC_SHA256, token_secret);
    let tag = hmac::sign(&key, &mac_input(issued, odcid, peer, new_cid));

    let mut token = Vec::with_capacity(MIN_TOKEN_LEN + odcid.len());
    token.extend_from_slice(&issued.to_be_bytes());
    token.push(odcid.len() as u8);
    token.extend_from_slice(odcid);
    token.extend_from_slice(tag.as_ref());
    token
}

/// Validate a token presented by `peer` on an Initial whose DCID is
/// `new_cid`. Returns the ODCID it was minted for.
pub fn validate(
    peer: &PeerAddr,
    new_cid: &ConnectionId,
    token_secret: &[u8],
    token: &[u8],
) -> Result<Vec<u8>, TokenError> {
    validate_at(peer, new_cid, token_secret, token, unix_now())
}

pub(crate) fn validate_at(
    peer: &PeerAddr,
    new_cid: &ConnectionId,
    token_secret: &[u8],
    token: &[u8],
    now: u64,
) -> Result<Vec<u8>, TokenError> {
    if token.len() < MIN_TOKEN_LEN {
        return Err(TokenError::Malformed);
    }

    let issued = u64::from_be_bytes(token[..8].try_into().expect("8-byte slice"));
    let odcid_len = token[8] as usize;
    if odcid_len > MAX_ODCID_LEN || token.len() != MIN_TOKEN_LEN + odcid_len {
        return Err(TokenError::Malformed);
    }

    let odcid = &token[9..9 + odcid_len];
    let tag = &token[9 + odcid_len..];

    // MAC before freshness: a forged timestamp must not change the error
    // an attacker can observe.
    let key = hmac::Key::new(hmac::HMAC_SHA256, token_secret);
    hmac::verify(&key, &mac_input(issued, odcid, peer, new_cid), tag)
        .map_err(|_| TokenError::BadMac)?;

    if issued > now || now - issued > TOKEN_LIFETIME.as_secs() {
        return Err(TokenError::Expired);
    }

    Ok(odcid.to_vec())
}

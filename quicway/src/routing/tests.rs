use super::*;
use crate::error::TokenError;
use crate::peer::PeerAddr;
use crate::routing::token::{mint, mint_at, validate, validate_at, TOKEN_LIFETIME};
use std::net::SocketAddr;

const CID_SECRET: &[u8] = b"connection-id-secret-0123456789abcdef";
const TOKEN_SECRET: &[u8] = b"token-secret-0123456789abcdef0123456";

fn peer(s: &str) -> PeerAddr {
    s.parse::<SocketAddr>().unwrap().into()
}

#[test]
fn derive_is_deterministic_and_20_bytes() {
    let dcids: [&[u8]; 4] = [b"", b"\x02", b"0123456789abcdef0123", b"short-dcid"];
    for dcid in dcids {
        let a = derive(CID_SECRET, dcid);
        let b = derive(CID_SECRET, dcid);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes().len(), LOCAL_CID_LEN);
    }
}

#[test]
fn derive_depends_on_secret_and_input() {
    let a = derive(CID_SECRET, b"dcid-a");
    let b = derive(CID_SECRET, b"dcid-b");
    let c = derive(TOKEN_SECRET, b"dcid-a");
    assert_ne!(a, b);
    assert_ne!(a, c);
}

#[test]
fn token_roundtrip_returns_odcid() {
    let p = peer("192.0.2.1:4433");
    let odcid = b"original-dcid-bytes";
    let new_cid = derive(CID_SECRET, odcid);

    let token = mint(&p, odcid, &new_cid, TOKEN_SECRET);
    let restored = validate(&p, &new_cid, TOKEN_SECRET, &token).unwrap();
    assert_eq!(restored, odcid);
}

#[test]
fn token_roundtrip_with_empty_odcid() {
    let p = peer("192.0.2.1:4433");
    let new_cid = derive(CID_SECRET, b"");
    let token = mint(&p, b"", &new_cid, TOKEN_SECRET);
    assert_eq!(validate(&p, &new_cid, TOKEN_SECRET, &token).unwrap(), b"");
}

#[test]
fn token_does_not_cross_peers() {
    let p1 = peer("192.0.2.1:4433");
    let p2 = peer("192.0.2.2:4433");
    let same_ip_other_port = peer("192.0.2.1:4434");
    let odcid = b"original-dcid";
    let new_cid = derive(CID_SECRET, odcid);

    let token = mint(&p1, odcid, &new_cid, TOKEN_SECRET);
    assert_eq!(
        validate(&p2, &new_cid, TOKEN_SECRET, &token),
        Err(TokenError::BadMac)
    );
    assert_eq!(
        validate(&same_ip_other_port, &new_cid, TOKEN_SECRET, &token),
        Err(TokenError::BadMac)
    );
}

#[test]
fn token_bound_to_issued_cid() {
    let p = peer("192.0.2.1:4433");
    let new_cid = derive(CID_SECRET, b"odcid");
    let other_cid = derive(CID_SECRET, b"other");

    let token = mint(&p, b"odcid", &new_cid, TOKEN_SECRET);
    assert_eq!(
        validate(&p, &other_cid, TOKEN_SECRET, &token),
        Err(TokenError::BadMac)
    );
}

#[test]
fn token_expires() {
    let p = peer("192.0.2.1:4433");
    let new_cid = derive(CID_SECRET, b"odcid");
    let issued = 1_700_000_000;

    let token = mint_at(&p, b"odcid", &new_cid, TOKEN_SECRET, issued);

    // Within the window.
    let at_edge = issued + TOKEN_LIFETIME.as_secs();
    assert!(validate_at(&p, &new_cid, TOKEN_SECRET, &token, at_edge).is_ok());

    // One second past it.
    assert_eq!(
        validate_at(&p, &new_cid, TOKEN_SECRET, &token, at_edge + 1),
        Err(TokenError::Expired)
    );

    // Issued in the future is rejected too.
    assert_eq!(
        validate_at(&p, &new_cid, TOKEN_SECRET, &token, issued - 1),
        Err(TokenError::Expired)
    );
}

#[test]
fn token_shorter_than_mac_is_malformed() {
    let p = peer("192.0.2.1:4433");
    let new_cid = derive(CID_SECRET, b"odcid");
    for len in [0usize, 8, 20, 40] {
        let junk = vec![0u8; len];
        assert_eq!(
            validate(&p, &new_cid, TOKEN_SECRET, &junk),
            Err(TokenError::Malformed)
        );
    }
}

#[test]
fn tampered_token_fails_mac() {
    let p = peer("192.0.2.1:4433");
    let new_cid = derive(CID_SECRET, b"odcid");
    let mut token = mint(&p, b"odcid", &new_cid, TOKEN_SECRET);

    // Flip a bit in the embedded ODCID.
    token[10] ^= 0x01;
    assert_eq!(
        validate(&p, &new_cid, TOKEN_SECRET, &token),
        Err(TokenError::BadMac)
    );
}

#[test]
fn sharding_is_stable_and_in_range() {
    let dispatchers = 7;
    for dcid in [&b"0123456789abcdef0123"[..], b"cli", b"\x01\x02\x03"] {
        let first = shard_for_dcid(CID_SECRET, dcid, dispatchers).unwrap();
        for _ in 0..16 {
            assert_eq!(shard_for_dcid(CID_SECRET, dcid, dispatchers), Some(first));
        }
        assert!(first < dispatchers);
    }
}

#[test]
fn empty_dcid_has_no_shard() {
    assert_eq!(shard_for_dcid(CID_SECRET, b"", 4), None);
}

#[test]
fn pre_retry_initial_shares_shard_with_its_connection() {
    // The first Initial carries a client-chosen DCID shorter than 20 bytes;
    // after Retry the client echoes back derive(dcid). Both must land on the
    // same dispatcher.
    let client_dcid = b"client-chosen";
    let issued = derive(CID_SECRET, client_dcid);

    let before = shard_for_dcid(CID_SECRET, client_dcid, 5).unwrap();
    let after = shard_for_dcid(CID_SECRET, issued.as_bytes(), 5).unwrap();
    assert_eq!(before, after);
}

#[test]
fn dispatcher_registration_is_unique_per_key() {
    assert!(register_dispatcher("test-endpoint-a", 0));
    assert!(!register_dispatcher("test-endpoint-a", 0));
    assert!(register_dispatcher("test-endpoint-a", 1));
    unregister_dispatcher("test-endpoint-a", 0);
    assert!(register_dispatcher("test-endpoint-a", 0));
    unregister_dispatcher("test-endpoint-a", 0);
    unregister_dispatcher("test-endpoint-a", 1);
}

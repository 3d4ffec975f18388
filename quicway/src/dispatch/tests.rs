use super::classify::{classify, ClassifiedDatagram, PacketKind};
use super::*;
use crate::connection::registry::{ConnectionEntry, ConnectionRegistry};
use crate::connection::InboundDatagram;
use crate::error::DropReason;
use crate::peer::PeerAddr;
use crate::routing::{self, token};
use quicway_x::ConnectionId;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

const CID_SECRET: &[u8] = b"connection-id-secret-0123456789abcdef";
const TOKEN_SECRET: &[u8] = b"token-secret-0123456789abcdef0123456";

fn peer(s: &str) -> PeerAddr {
    s.parse::<SocketAddr>().unwrap().into()
}

fn datagram(
    peer: PeerAddr,
    kind: PacketKind,
    dcid: &[u8],
    token: Option<Vec<u8>>,
    version_supported: bool,
    len: usize,
) -> ClassifiedDatagram {
    ClassifiedDatagram {
        peer,
        payload: vec![0u8; len],
        scid: vec![0x01; 14],
        dcid: dcid.to_vec(),
        token,
        version: if version_supported {
            quiche::PROTOCOL_VERSION
        } else {
            0xdead_beef
        },
        kind,
        version_supported,
    }
}

fn register(registry: &ConnectionRegistry, cid: ConnectionId) -> mpsc::Receiver<InboundDatagram> {
    let (tx, rx) = mpsc::channel(8);
    registry
        .insert_unique(ConnectionEntry {
            cid,
            actor_id: 1,
            packets: tx,
            created_at: Instant::now(),
        })
        .expect("cid unused");
    rx
}

fn route_plain(pkt: &ClassifiedDatagram, registry: &ConnectionRegistry) -> Action {
    route(pkt, registry, TOKEN_SECRET, CID_SECRET, false)
}

// S1: an Initial with an unsupported version draws exactly a Version
// Negotiation decision; no connection state is touched.
#[test]
fn unsupported_version_initial_negotiates() {
    let registry = ConnectionRegistry::new(false);
    let pkt = datagram(
        peer("192.0.2.1:4433"),
        PacketKind::Initial,
        &[0x02; 20],
        None,
        false,
        1300,
    );

    assert!(matches!(
        route_plain(&pkt, &registry),
        Action::VersionNegotiate
    ));
    assert_eq!(registry.len(), 0);
}

// Undersized datagrams never draw a stateless response, supported version
// or not.
#[test]
fn undersized_initial_is_dropped() {
    let registry = ConnectionRegistry::new(false);
    for supported in [true, false] {
        let pkt = datagram(
            peer("192.0.2.1:4433"),
            PacketKind::Initial,
            &[0x02; 20],
            None,
            supported,
            600,
        );
        assert!(matches!(
            route_plain(&pkt, &registry),
            Action::Drop(DropReason::UndersizedInitial)
        ));
    }
}

// S2: a token-less Initial with a supported version draws a Retry carrying
// the derived CID and a token that validates for this peer.
#[test]
fn tokenless_initial_draws_retry() {
    let registry = ConnectionRegistry::new(false);
    let p = peer("192.0.2.1:4433");
    let d0 = [0x0du8; 20];
    let pkt = datagram(p, PacketKind::Initial, &d0, Some(Vec::new()), true, 1300);

    match route_plain(&pkt, &registry) {
        Action::Retry { new_cid, token: t } => {
            assert_eq!(new_cid, routing::derive(CID_SECRET, &d0));
            let odcid = token::validate(&p, &new_cid, TOKEN_SECRET, &t).unwrap();
            assert_eq!(odcid, d0);
        }
        other => panic!("expected retry, got {:?}", other),
    }
    assert_eq!(registry.len(), 0);
}

// S3: replaying the retried client completes validation and asks for a
// connection bound to the original DCID.
#[test]
fn valid_token_creates_connection() {
    let registry = ConnectionRegistry::new(false);
    let p = peer("192.0.2.1:4433");
    let d0 = b"original-dcid-chosen";
    let c1 = routing::derive(CID_SECRET, d0);
    let t = token::mint(&p, d0, &c1, TOKEN_SECRET);

    let pkt = datagram(p, PacketKind::Initial, c1.as_bytes(), Some(t), true, 1300);

    match route_plain(&pkt, &registry) {
        Action::Create { cid, odcid } => {
            assert_eq!(cid, c1);
            assert_eq!(odcid, d0);
        }
        other => panic!("expected create, got {:?}", other),
    }
}

// S4: the same token from a different source address is silently dropped.
#[test]
fn token_from_wrong_peer_is_dropped() {
    let registry = ConnectionRegistry::new(false);
    let minted_for = peer("192.0.2.1:4433");
    let spoofer = peer("192.0.2.2:4433");
    let d0 = b"original-dcid-chosen";
    let c1 = routing::derive(CID_SECRET, d0);
    let t = token::mint(&minted_for, d0, &c1, TOKEN_SECRET);

    let pkt = datagram(
        spoofer,
        PacketKind::Initial,
        c1.as_bytes(),
        Some(t),
        true,
        1300,
    );

    assert!(matches!(
        route_plain(&pkt, &registry),
        Action::Drop(DropReason::InvalidToken)
    ));
    assert_eq!(registry.len(), 0);
}

// A token-bearing Initial whose DCID is not one of ours is rejected on
// length before any MAC work.
#[test]
fn token_with_bad_dcid_length_is_dropped() {
    let registry = ConnectionRegistry::new(false);
    let p = peer("192.0.2.1:4433");
    for len in [1usize, 19, 21] {
        let pkt = datagram(
            p,
            PacketKind::Initial,
            &vec![0x05; len],
            Some(vec![0xaa; 48]),
            true,
            1300,
        );
        assert!(matches!(
            route_plain(&pkt, &registry),
            Action::Drop(DropReason::BadDcidLength)
        ));
    }
}

// An Initial for an already-registered CID forwards without re-validation.
#[test]
fn initial_for_known_connection_forwards() {
    let registry = ConnectionRegistry::new(false);
    let cid = routing::derive(CID_SECRET, b"known");
    let mut rx = register(&registry, cid);

    let pkt = datagram(
        peer("192.0.2.1:4433"),
        PacketKind::Initial,
        cid.as_bytes(),
        None,
        true,
        1300,
    );

    match route_plain(&pkt, &registry) {
        Action::Forward(target) => {
            assert_eq!(target.cid, cid);
            target
                .packets
                .try_send(InboundDatagram {
                    peer: pkt.peer,
                    payload: pkt.payload,
                })
                .unwrap();
            assert!(rx.try_recv().is_ok());
        }
        other => panic!("expected forward, got {:?}", other),
    }
}

// S5: a short-header packet for an unknown CID is dropped with no
// stateless response.
#[test]
fn unknown_short_packet_is_dropped() {
    let registry = ConnectionRegistry::new(false);
    let pkt = datagram(
        peer("192.0.2.7:9000"),
        PacketKind::Short,
        &[0x44; 20],
        None,
        true,
        80,
    );

    assert!(matches!(
        route_plain(&pkt, &registry),
        Action::Drop(DropReason::UnknownConnection)
    ));
}

// Short packets for a registered CID forward; long-header packets with an
// off-length DCID drop.
#[test]
fn regular_routing_by_dcid_length() {
    let registry = ConnectionRegistry::new(false);
    let cid = routing::derive(CID_SECRET, b"established");
    let _rx = register(&registry, cid);

    let ok = datagram(
        peer("192.0.2.1:4433"),
        PacketKind::Short,
        cid.as_bytes(),
        None,
        true,
        120,
    );
    assert!(matches!(route_plain(&ok, &registry), Action::Forward(_)));

    let bad = datagram(
        peer("192.0.2.1:4433"),
        PacketKind::Handshake,
        &[0x09; 7],
        None,
        true,
        1300,
    );
    assert!(matches!(
        route_plain(&bad, &registry),
        Action::Drop(DropReason::BadDcidLength)
    ));
}

// Zero-length DCIDs resolve through the address table when enabled.
#[test]
fn zero_length_dcid_uses_address_routing() {
    let p = peer("192.0.2.1:4433");

    let without = ConnectionRegistry::new(false);
    let pkt = datagram(p, PacketKind::Short, &[], None, true, 120);
    assert!(matches!(
        route(&pkt, &without, TOKEN_SECRET, CID_SECRET, false),
        Action::Drop(DropReason::UnknownConnection)
    ));

    let with = ConnectionRegistry::new(true);
    let cid = routing::derive(CID_SECRET, b"migratory");
    let _rx = register(&with, cid);
    with.bind_address(p, cid);

    let pkt = datagram(p, PacketKind::Short, &[], None, true, 120);
    match route(&pkt, &with, TOKEN_SECRET, CID_SECRET, true) {
        Action::Forward(target) => assert_eq!(target.cid, cid),
        other => panic!("expected forward, got {:?}", other),
    }
}

// Overflowing the pre-handshake inbox sheds the oldest queued Initial,
// never established-connection traffic.
#[test]
fn inbox_overflow_sheds_oldest_initial() {
    let (inbox, regular_rx, initial_rx) = DispatcherInbox::with_capacities(4, 2);
    let p = peer("192.0.2.1:4433");

    for tag in 0u8..3 {
        let mut pkt = datagram(p, PacketKind::Initial, &[tag; 20], None, true, 1300);
        pkt.payload[0] = tag;
        inbox.deliver(pkt).unwrap();
    }

    // Oldest (tag 0) was shed to admit tag 2.
    let first = initial_rx.try_recv().unwrap();
    let second = initial_rx.try_recv().unwrap();
    assert_eq!(first.payload[0], 1);
    assert_eq!(second.payload[0], 2);
    assert!(initial_rx.try_recv().is_err());

    let short = datagram(p, PacketKind::Short, &[9; 20], None, true, 80);
    inbox.deliver(short).unwrap();
    assert_eq!(regular_rx.try_recv().unwrap().kind, PacketKind::Short);
}

// The stateless Version Negotiation reply echoes the peer's CIDs swapped,
// per RFC 9000 §6.
#[test]
fn version_negotiation_packet_shape() {
    let mut builder = PacketBuilder::new(1350);
    let scid = [0x01u8; 14];
    let dcid = [0x02u8; 14];

    let mut out = builder.negotiate_version(&scid, &dcid).unwrap().to_vec();
    let hdr = quiche::Header::from_slice(&mut out, 20).unwrap();

    assert_eq!(hdr.ty, quiche::Type::VersionNegotiation);
    assert_eq!(&hdr.scid[..], &dcid[..]);
    assert_eq!(&hdr.dcid[..], &scid[..]);
}

// The stateless Retry reply carries the issued CID as its SCID and echoes
// the minted token.
#[test]
fn retry_packet_shape() {
    let mut builder = PacketBuilder::new(1350);
    let p = peer("192.0.2.1:4433");
    let client_scid = [0x0au8; 8];
    let d0 = [0x0bu8; 20];
    let new_cid = routing::derive(CID_SECRET, &d0);
    let t = token::mint(&p, &d0, &new_cid, TOKEN_SECRET);

    let mut out = builder
        .retry(
            &client_scid,
            &d0,
            &new_cid,
            &t,
            quiche::PROTOCOL_VERSION,
        )
        .unwrap()
        .to_vec();

    let hdr = quiche::Header::from_slice(&mut out, 20).unwrap();
    assert_eq!(hdr.ty, quiche::Type::Retry);
    assert_eq!(&hdr.scid[..], new_cid.as_bytes());
    assert_eq!(&hdr.dcid[..], &client_scid[..]);
    assert_eq!(hdr.token, Some(t));
}

// Classifier: short headers yield the fixed-length DCID and no token.
#[test]
fn classify_short_header() {
    let p = peer("192.0.2.1:4433");
    let mut payload = vec![0x40u8];
    payload.extend_from_slice(&[0x33; 20]);
    payload.extend_from_slice(&[0xff; 32]);

    let pkt = classify(p, payload).unwrap();
    assert_eq!(pkt.kind, PacketKind::Short);
    assert_eq!(pkt.dcid, vec![0x33; 20]);
    assert!(pkt.token.is_none());
    assert!(pkt.version_supported);
}

// Classifier: garbage is malformed, not a panic.
#[test]
fn classify_garbage_fails() {
    let p = peer("192.0.2.1:4433");
    assert!(classify(p, vec![]).is_err());
    assert!(classify(p, vec![0x80]).is_err());
}

use super::sender::new_sender;
use super::socket::create_udp_socket;
use crate::dispatch::classify::PacketKind;
use crate::dispatch::DispatcherInbox;
use crate::netio::reader::SocketReader;
use crate::telemetry::Metrics;
use bytes::Bytes;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CID_SECRET: &[u8] = b"connection-id-secret-0123456789abcdef";

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn socket_pool_shares_a_port() {
    let first = create_udp_socket(loopback(), None, None).unwrap();
    let addr = first.local_addr().unwrap();

    // SO_REUSEPORT lets a second pool member bind the same port.
    let second = create_udp_socket(addr, None, None).unwrap();
    assert_eq!(second.local_addr().unwrap().port(), addr.port());
}

#[test]
fn socket_honors_buffer_sizes() {
    let socket = create_udp_socket(loopback(), Some(256 * 1024), Some(256 * 1024)).unwrap();
    assert!(socket.local_addr().is_ok());
}

#[test]
fn sender_writes_in_submission_order() {
    let metrics = Arc::new(Metrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let receiver = UdpSocket::bind(loopback()).unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let dest = receiver.local_addr().unwrap().into();

    let socket = UdpSocket::bind(loopback()).unwrap();
    let (handle, worker) = new_sender(0, socket, 64, Arc::clone(&metrics), shutdown.clone()).unwrap();
    let join = worker.spawn().unwrap();

    assert!(handle.try_send(dest, Bytes::from_static(b"one")));
    assert!(handle.try_batch_send(vec![
        (dest, Bytes::from_static(b"two")),
        (dest, Bytes::from_static(b"three")),
    ]));

    let mut buf = [0u8; 64];
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        seen.push(buf[..len].to_vec());
    }
    assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    assert_eq!(metrics.packets_sent.get(), 3);

    shutdown.store(true, Ordering::Relaxed);
    drop(handle);
    join.join().unwrap();
}

#[test]
fn full_sender_queue_sheds_packets() {
    let metrics = Arc::new(Metrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let socket = UdpSocket::bind(loopback()).unwrap();
    let dest = socket.local_addr().unwrap().into();

    // Queue exists but no worker drains it.
    let (handle, _worker) = new_sender(0, socket, 2, metrics, shutdown).unwrap();

    assert!(handle.try_send(dest, Bytes::from_static(b"a")));
    assert!(handle.try_send(dest, Bytes::from_static(b"b")));
    assert!(!handle.try_send(dest, Bytes::from_static(b"c")));
}

// End-to-end through the reader: a short-header datagram lands classified
// in a dispatcher inbox.
#[test]
fn reader_classifies_and_delivers() {
    let metrics = Arc::new(Metrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    let socket = create_udp_socket(loopback(), None, None).unwrap();
    let addr = socket.local_addr().unwrap();

    let (inbox, regular_rx, _initial_rx) = DispatcherInbox::with_capacities(16, 16);

    let reader = SocketReader::new(
        0,
        socket,
        vec![inbox],
        CID_SECRET.to_vec(),
        32,
        Duration::from_millis(20),
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    )
    .unwrap();
    let join = reader.spawn(false).unwrap();

    // Minimal short header: flags byte, 20-byte DCID, payload.
    let mut datagram = vec![0x40u8];
    datagram.extend_from_slice(&[0x5a; 20]);
    datagram.extend_from_slice(b"opaque-short-payload");

    let client = UdpSocket::bind(loopback()).unwrap();
    client.send_to(&datagram, addr).unwrap();

    let pkt = regular_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("datagram routed to dispatcher");
    assert_eq!(pkt.kind, PacketKind::Short);
    assert_eq!(pkt.dcid, vec![0x5a; 20]);
    assert_eq!(pkt.payload.len(), datagram.len());
    assert_eq!(metrics.packets_received.get(), 1);

    shutdown.store(true, Ordering::Relaxed);
    join.join().unwrap();
}

// The same DCID always reaches the same dispatcher inbox.
#[test]
fn reader_sharding_is_stable() {
    let shards = 4;
    let dcid = [0x61u8; 20];
    let first = crate::routing::shard_for_dcid(CID_SECRET, &dcid, shards).unwrap();
    for _ in 0..32 {
        assert_eq!(
            crate::routing::shard_for_dcid(CID_SECRET, &dcid, shards),
            Some(first)
        );
    }
}

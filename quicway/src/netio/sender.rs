//! Send-side endpoints.
//!
//! One sender per UDP socket, each serviced by a dedicated thread draining
//! a bounded queue. All writes through one sender hit the kernel in
//! submission order; ordering across senders is not guaranteed and QUIC
//! does not need it. Producers never block: a full queue sheds the packet
//! and the peer's loss recovery takes over.

use crate::peer::PeerAddr;
use crate::telemetry::Metrics;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use socket2::SockRef;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

enum SendOp {
    One(PeerAddr, Bytes),
    Batch(Vec<(PeerAddr, Bytes)>),
}

/// Producer-side handle to one sender. Cheap to clone; every clone feeds
/// the same serialized write path.
#[derive(Clone)]
pub struct SenderHandle {
    index: usize,
    tx: Sender<SendOp>,
    local_addr: SocketAddr,
}

impl SenderHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Local address of the socket this sender writes through.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Enqueue a single packet. Returns false if the queue is full or the
    /// sender is gone; the packet is dropped either way.
    pub fn try_send(&self, peer: PeerAddr, packet: Bytes) -> bool {
        self.tx.try_send(SendOp::One(peer, packet)).is_ok()
    }

    /// Enqueue a batch as one unit; packets within it stay ordered.
    pub fn try_batch_send(&self, packets: Vec<(PeerAddr, Bytes)>) -> bool {
        self.tx.try_send(SendOp::Batch(packets)).is_ok()
    }
}

/// The worker end of a sender, not yet running.
pub struct SenderWorker {
    index: usize,
    socket: UdpSocket,
    rx: Receiver<SendOp>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
}

/// Build a sender for `socket`. The queue exists (and accepts packets)
/// immediately; writes start flowing once [`SenderWorker::spawn`] runs.
pub fn new_sender(
    index: usize,
    socket: UdpSocket,
    queue_capacity: usize,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<(SenderHandle, SenderWorker)> {
    let local_addr = socket.local_addr()?;
    let (tx, rx) = bounded(queue_capacity);

    let handle = SenderHandle {
        index,
        tx,
        local_addr,
    };
    let worker = SenderWorker {
        index,
        socket,
        rx,
        metrics,
        shutdown,
    };
    Ok((handle, worker))
}

impl SenderWorker {
    pub fn spawn(self) -> anyhow::Result<JoinHandle<()>> {
        let index = self.index;
        let handle = std::thread::Builder::new()
            .name(format!("sender-{}", index))
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn run(self) {
        debug!(sender = self.index, "sender started");

        loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(SendOp::One(peer, packet)) => self.write(&peer, &packet),
                Ok(SendOp::Batch(packets)) => {
                    for (peer, packet) in packets {
                        self.write(&peer, &packet);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        debug!(sender = self.index, "sender stopped");
    }

    fn write(&self, peer: &PeerAddr, packet: &[u8]) {
        match SockRef::from(&self.socket).send_to(packet, &peer.to_raw()) {
            Ok(written) => {
                trace!(sender = self.index, peer = %peer, bytes = written, "packet sent");
                self.metrics.packets_sent.incr();
                self.metrics.bytes_sent.add(written as u64);
            }
            Err(e) => {
                warn!(sender = self.index, peer = %peer, error = %e, "UDP send failed");
                self.metrics.send_errors.incr();
            }
        }
    }
}

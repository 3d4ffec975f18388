//! Socket readers.
//!
//! One reader thread per UDP socket. Each wake drains up to
//! `socket_event_capacity` datagrams, classifies them, and hands each to
//! its dispatcher shard; the polling window bounds how long a quiet socket
//! keeps the thread parked before the shutdown flag is rechecked.

use crate::dispatch::classify;
use crate::dispatch::DispatcherInbox;
use crate::routing;
use crate::telemetry::Metrics;
use std::io;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace};

const MAX_DATAGRAM: usize = 65535;

pub struct SocketReader {
    index: usize,
    socket: UdpSocket,
    dispatchers: Vec<DispatcherInbox>,
    conn_id_secret: Vec<u8>,
    event_capacity: usize,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
    /// Round-robin cursor for datagrams without a DCID.
    next_rr: usize,
}

impl SocketReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        socket: UdpSocket,
        dispatchers: Vec<DispatcherInbox>,
        conn_id_secret: Vec<u8>,
        event_capacity: usize,
        polling_timeout: Duration,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        socket.set_read_timeout(Some(polling_timeout))?;
        Ok(Self {
            index,
            socket,
            dispatchers,
            conn_id_secret,
            event_capacity,
            metrics,
            shutdown,
            next_rr: index,
        })
    }

    pub fn spawn(self, pin_to_cpu: bool) -> anyhow::Result<JoinHandle<()>> {
        let index = self.index;
        let handle = std::thread::Builder::new()
            .name(format!("reader-{}", index))
            .spawn(move || {
                if pin_to_cpu {
                    if let Some(core) =
                        core_affinity::get_core_ids().and_then(|ids| ids.get(index).copied())
                    {
                        core_affinity::set_for_current(core);
                    }
                }

                let mut reader = self;
                loop {
                    match reader.run() {
                        Ok(()) => break,
                        Err(e) => {
                            if reader.shutdown.load(Ordering::Relaxed) {
                                break;
                            }
                            // Surfaced receive failure: restart the loop on
                            // the same socket after a short backoff.
                            error!(reader = index, error = %e, "reader failed, restarting");
                            std::thread::sleep(Duration::from_millis(200));
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    fn run(&mut self) -> anyhow::Result<()> {
        debug!(reader = self.index, "socket reader started");
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            // Bounded batch per wake so one hot socket cannot starve the
            // shutdown check.
            for _ in 0..self.event_capacity {
                match self.socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        self.metrics.packets_received.incr();
                        self.metrics.bytes_received.add(len as u64);
                        self.on_datagram(from.into(), buf[..len].to_vec());
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        break;
                    }
                    Err(e) => {
                        // Unrecoverable socket error: surface it and exit
                        // the receive loop; the spawn wrapper restarts it.
                        error!(reader = self.index, error = %e, "socket receive failed");
                        self.metrics.recv_errors.incr();
                        return Err(e.into());
                    }
                }
            }
        }

        debug!(reader = self.index, "socket reader stopped");
        Ok(())
    }

    fn on_datagram(&mut self, peer: crate::peer::PeerAddr, payload: Vec<u8>) {
        let pkt = match classify::classify(peer, payload) {
            Ok(pkt) => pkt,
            Err(reason) => {
                trace!(reader = self.index, peer = %peer, "unparseable datagram");
                self.metrics.record_drop(reason);
                return;
            }
        };

        let shard = match routing::shard_for_dcid(
            &self.conn_id_secret,
            &pkt.dcid,
            self.dispatchers.len(),
        ) {
            Some(shard) => shard,
            None => {
                // No DCID to pin the packet with; spread the load.
                self.next_rr = (self.next_rr + 1) % self.dispatchers.len();
                self.next_rr
            }
        };

        trace!(
            reader = self.index,
            shard,
            kind = ?pkt.kind,
            len = pkt.datagram_len(),
            "datagram classified"
        );

        if let Err(reason) = self.dispatchers[shard].deliver(pkt) {
            self.metrics.record_drop(reason);
        }
    }
}

//! Per-connection actor.
//!
//! One tokio task owns the QUIC connection state machine for one peer.
//! The contract is "one owner mutates, everyone else messages": dispatchers
//! deliver datagrams into the packet mailbox, the application handler sends
//! commands into the command mailbox, and the actor is the only code that
//! touches the `quiche::Connection`. Outgoing datagrams drain through the
//! sender bound to the dispatcher that created the connection.

use crate::connection::InboundDatagram;
use crate::netio::sender::SenderHandle;
use crate::peer::PeerAddr;
use crate::telemetry::Metrics;
use bytes::Bytes;
use quicway_x::{Command, ConnectionHandle, ConnectionId, Event, HandlerFactory, StreamId};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Stream-read scratch size; stream data is chunked into events at most
/// this large.
const STREAM_READ_CHUNK: usize = 16 * 1024;

pub struct ConnectionActor {
    cid: ConnectionId,
    conn: quiche::Connection,
    peer: PeerAddr,
    local: SocketAddr,
    packets_rx: mpsc::Receiver<InboundDatagram>,
    commands_rx: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<Event>,
    /// Receiver/sender pair handed to the handler task once the handshake
    /// completes.
    handler_seed: Option<(mpsc::Receiver<Event>, mpsc::Sender<Command>)>,
    factory: HandlerFactory,
    sender: SenderHandle,
    metrics: Arc<Metrics>,
    notified_streams: HashSet<u64>,
    packets_gone: bool,
    handler_gone: bool,
    established_notified: bool,
    closing_notified: bool,
    /// Next server-initiated stream ids (bidi: 1, 5, 9…; uni: 3, 7, 11…).
    next_bidi_stream: u64,
    next_uni_stream: u64,
    out_buf: Vec<u8>,
    stream_buf: Vec<u8>,
}

/// Everything the supervisor wires into a new actor.
pub struct ActorParts {
    pub cid: ConnectionId,
    pub conn: quiche::Connection,
    pub peer: PeerAddr,
    pub local: SocketAddr,
    pub packets_rx: mpsc::Receiver<InboundDatagram>,
    pub commands_rx: mpsc::Receiver<Command>,
    pub commands_tx: mpsc::Sender<Command>,
    pub events_tx: mpsc::Sender<Event>,
    pub events_rx: mpsc::Receiver<Event>,
    pub factory: HandlerFactory,
    pub sender: SenderHandle,
    pub metrics: Arc<Metrics>,
    pub max_udp_payload: usize,
}

impl ConnectionActor {
    pub fn new(parts: ActorParts) -> Self {
        Self {
            cid: parts.cid,
            conn: parts.conn,
            peer: parts.peer,
            local: parts.local,
            packets_rx: parts.packets_rx,
            commands_rx: parts.commands_rx,
            events_tx: parts.events_tx,
            handler_seed: Some((parts.events_rx, parts.commands_tx)),
            factory: parts.factory,
            sender: parts.sender,
            metrics: parts.metrics,
            notified_streams: HashSet::new(),
            packets_gone: false,
            handler_gone: false,
            established_notified: false,
            closing_notified: false,
            next_bidi_stream: 1,
            next_uni_stream: 3,
            out_buf: vec![0u8; parts.max_udp_payload],
            stream_buf: vec![0u8; STREAM_READ_CHUNK],
        }
    }

    pub async fn run(mut self) {
        trace!(cid = %self.cid, peer = %self.peer, "connection actor started");

        loop {
            let timeout = self.conn.timeout();

            // Nothing left that could ever wake us.
            if self.packets_gone && self.handler_gone && timeout.is_none() {
                break;
            }

            tokio::select! {
                pkt = self.packets_rx.recv(), if !self.packets_gone => match pkt {
                    Some(pkt) => self.on_packet(pkt),
                    // All mailbox senders dropped: the server is tearing
                    // down around us. Close and drain.
                    None => {
                        self.packets_gone = true;
                        let _ = self.conn.close(false, 0x0, b"shutdown");
                    }
                },
                cmd = self.commands_rx.recv(), if !self.handler_gone => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => self.handler_gone = true,
                },
                _ = timeout_expired(timeout) => {
                    self.conn.on_timeout();
                }
                else => break,
            }

            self.pump();
            self.drain_send();

            if self.conn.is_closed() {
                break;
            }
        }

        self.notify_closed().await;
        debug!(cid = %self.cid, peer = %self.peer, "connection actor finished");
    }

    fn on_packet(&mut self, mut pkt: InboundDatagram) {
        // Track the current path; the QUIC library validates migrations.
        self.peer = pkt.peer;

        let info = quiche::RecvInfo {
            from: pkt.peer.socket_addr(),
            to: self.local,
        };

        match self.conn.recv(&mut pkt.payload, info) {
            Ok(read) => {
                trace!(cid = %self.cid, bytes = read, "datagram processed");
            }
            Err(quiche::Error::Done) => {}
            Err(e) => {
                debug!(cid = %self.cid, error = ?e, "connection recv error");
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::StreamSend {
                stream_id,
                data,
                fin,
            } => self.stream_send(stream_id.0, &data, fin),
            Command::OpenBiStream => {
                let id = self.next_bidi_stream;
                self.next_bidi_stream += 4;
                self.emit(Event::StreamOpenedConfirm {
                    stream_id: StreamId(id),
                });
            }
            Command::OpenUniStream => {
                let id = self.next_uni_stream;
                self.next_uni_stream += 4;
                self.emit(Event::StreamOpenedConfirm {
                    stream_id: StreamId(id),
                });
            }
            Command::DgramSend { data } => {
                if let Err(e) = self.conn.dgram_send(&data) {
                    debug!(cid = %self.cid, error = ?e, "dgram send failed");
                }
            }
            Command::Close { error_code, reason } => {
                let _ = self.conn.close(true, error_code, reason.as_bytes());
            }
        }
    }

    /// Write to a stream, retrying partial writes until the library reports
    /// it has taken everything it can for now.
    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) {
        let mut pos = 0;
        loop {
            match self.conn.stream_send(stream_id, &data[pos..], fin) {
                Ok(written) => {
                    pos += written;
                    if pos >= data.len() {
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    debug!(cid = %self.cid, stream_id, error = ?e, "stream send failed");
                    break;
                }
            }
        }
    }

    /// Surface readable streams and datagrams as handler events, spawning
    /// the handler task on the first usable moment.
    fn pump(&mut self) {
        if !(self.conn.is_established() || self.conn.is_in_early_data()) {
            self.check_closing();
            return;
        }

        self.spawn_handler();

        let readable: Vec<u64> = self.conn.readable().collect();
        for stream_id in readable {
            if self.notified_streams.insert(stream_id) {
                let sid = StreamId(stream_id);
                self.emit(Event::StreamOpened {
                    stream_id: sid,
                    is_bidirectional: sid.is_bidirectional(),
                });
            }

            loop {
                match self.conn.stream_recv(stream_id, &mut self.stream_buf) {
                    Ok((len, fin)) => {
                        if len > 0 || fin {
                            let data = Bytes::copy_from_slice(&self.stream_buf[..len]);
                            self.emit(Event::StreamData {
                                stream_id: StreamId(stream_id),
                                data,
                                fin,
                            });
                        }
                        if fin {
                            break;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        debug!(cid = %self.cid, stream_id, error = ?e, "stream recv error");
                        break;
                    }
                }
            }
        }

        loop {
            match self.conn.dgram_recv(&mut self.stream_buf) {
                Ok(len) => {
                    let data = Bytes::copy_from_slice(&self.stream_buf[..len]);
                    self.emit(Event::DatagramReceived { data });
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    debug!(cid = %self.cid, error = ?e, "dgram recv error");
                    break;
                }
            }
        }

        self.check_closing();
    }

    fn check_closing(&mut self) {
        if self.closing_notified {
            return;
        }
        let closing = self
            .conn
            .peer_error()
            .map(|e| (e.error_code, String::from_utf8_lossy(&e.reason).into_owned()));
        if let Some((error_code, reason)) = closing {
            self.closing_notified = true;
            self.emit(Event::ConnectionClosing { error_code, reason });
        }
    }

    fn spawn_handler(&mut self) {
        if let Some((events_rx, commands_tx)) = self.handler_seed.take() {
            self.metrics.connections_established.incr();

            let handle = ConnectionHandle::new(self.cid, events_rx, commands_tx);
            let handler = (self.factory)();
            tokio::spawn(handler.on_connection(handle));

            debug!(cid = %self.cid, "handler task spawned");
        }

        if !self.established_notified {
            self.established_notified = true;
            self.emit(Event::Established);
        }
    }

    /// Drain outgoing datagrams from the library into the bound sender.
    ///
    /// One call flushes everything the connection has pending: the loop
    /// ends only on `Done` (nothing left to send), a full send queue, or a
    /// fatal send error.
    fn drain_send(&mut self) {
        loop {
            match self.conn.send(&mut self.out_buf) {
                Ok((len, info)) => {
                    let packet = Bytes::copy_from_slice(&self.out_buf[..len]);
                    if !self.sender.try_send(info.to.into(), packet) {
                        // Send queue full: shed this datagram, the peer's
                        // loss recovery covers it.
                        warn!(cid = %self.cid, "send queue full, dropping outgoing datagram");
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    debug!(cid = %self.cid, error = ?e, "connection send failed, closing");
                    let _ = self.conn.close(false, 0x1, b"send failure");
                    break;
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        if self.handler_gone {
            return;
        }
        if self.events_tx.try_send(event).is_err() {
            // Handler is slow or gone; QUIC flow control holds the peer.
            trace!(cid = %self.cid, "event channel full or closed");
        }
    }

    async fn notify_closed(&mut self) {
        if !self.handler_gone {
            let _ = self.events_tx.send(Event::ConnectionClosed).await;
        }
        self.metrics.connections_closed.incr();
    }
}

async fn timeout_expired(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

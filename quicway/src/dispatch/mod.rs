//! Dispatcher workers.
//!
//! Each dispatcher is a native OS thread owning classification-to-routing
//! for one shard of inbound datagrams. A dispatcher either replies
//! statelessly (Version Negotiation, Retry), forwards to the connection
//! actor that owns the DCID, or creates that actor after the retry token
//! validates. All per-packet errors are absorbed as drops; nothing here
//! blocks on I/O besides its own inboxes.

pub mod classify;

#[cfg(test)]
mod tests;

use crate::config::ServerConfig;
use crate::connection::registry::ConnectionRegistry;
use crate::connection::supervisor::ConnectionSupervisor;
use crate::connection::InboundDatagram;
use crate::error::{CreateError, DropReason};
use crate::netio::sender::SenderHandle;
use crate::peer::PeerAddr;
use crate::routing;
use crate::telemetry::Metrics;
use bytes::Bytes;
use classify::{ClassifiedDatagram, PacketKind};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use quicway_x::ConnectionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// RFC 9000 §14.1: Initials below this datagram size are dropped before any
/// stateless response is considered.
const MIN_INITIAL_DATAGRAM: usize = 1200;

/// Version Negotiation rate limit: max replies per peer per window.
const MAX_VN_PER_WINDOW: u32 = 10;
const VN_WINDOW: Duration = Duration::from_secs(1);

/// Stateless-response builder owned by one dispatcher.
///
/// Wraps the output buffer the QUIC library serializes into. Dropped with
/// the dispatcher on every exit path, including a failed construction.
pub struct PacketBuilder {
    out: Vec<u8>,
}

impl PacketBuilder {
    pub fn new(max_datagram: usize) -> Self {
        Self {
            out: vec![0u8; max_datagram],
        }
    }

    /// Build a Version Negotiation packet echoing the peer's CIDs.
    pub fn negotiate_version(&mut self, scid: &[u8], dcid: &[u8]) -> quiche::Result<&[u8]> {
        let scid = quiche::ConnectionId::from_ref(scid);
        let dcid = quiche::ConnectionId::from_ref(dcid);
        let len = quiche::negotiate_version(&scid, &dcid, &mut self.out)?;
        Ok(&self.out[..len])
    }

    /// Build a Retry packet. The Retry Integrity Tag is computed by the
    /// QUIC library.
    pub fn retry(
        &mut self,
        scid: &[u8],
        dcid: &[u8],
        new_cid: &ConnectionId,
        token: &[u8],
        version: u32,
    ) -> quiche::Result<&[u8]> {
        let scid = quiche::ConnectionId::from_ref(scid);
        let dcid = quiche::ConnectionId::from_ref(dcid);
        let new_scid = quiche::ConnectionId::from_ref(new_cid.as_bytes());
        let len = quiche::retry(&scid, &dcid, &new_scid, token, version, &mut self.out)?;
        Ok(&self.out[..len])
    }
}

/// Routing decision for one classified datagram.
///
/// Computed by [`route`] without side effects so the algorithm is testable
/// against the scenarios it must satisfy; the dispatcher applies it.
#[derive(Debug)]
pub enum Action {
    /// Reply with a Version Negotiation packet (subject to rate limiting).
    VersionNegotiate,
    /// Reply with a Retry carrying a freshly minted token.
    Retry {
        new_cid: ConnectionId,
        token: Vec<u8>,
    },
    /// Forward the datagram to the registered owner of this CID.
    Forward(InboundTarget),
    /// Validate succeeded: create the connection, then forward.
    Create {
        cid: ConnectionId,
        odcid: Vec<u8>,
    },
    /// Discard without response.
    Drop(DropReason),
}

/// Where a forwarded datagram goes: the owning actor's packet mailbox.
#[derive(Debug, Clone)]
pub struct InboundTarget {
    pub cid: ConnectionId,
    pub packets: tokio::sync::mpsc::Sender<InboundDatagram>,
}

/// Pure routing algorithm.
///
/// ```text
/// Initial, unsupported version → VersionNegotiate
/// Initial, supported           → INIT
/// anything else                → REGULAR
/// ```
pub fn route(
    pkt: &ClassifiedDatagram,
    registry: &ConnectionRegistry,
    token_secret: &[u8],
    conn_id_secret: &[u8],
    allow_address_routing: bool,
) -> Action {
    match pkt.kind {
        PacketKind::Initial if !pkt.version_supported => {
            if pkt.datagram_len() < MIN_INITIAL_DATAGRAM {
                return Action::Drop(DropReason::UndersizedInitial);
            }
            Action::VersionNegotiate
        }
        PacketKind::Initial => route_initial(pkt, registry, token_secret, conn_id_secret),
        _ => route_regular(pkt, registry, allow_address_routing),
    }
}

fn route_initial(
    pkt: &ClassifiedDatagram,
    registry: &ConnectionRegistry,
    token_secret: &[u8],
    conn_id_secret: &[u8],
) -> Action {
    if pkt.datagram_len() < MIN_INITIAL_DATAGRAM {
        return Action::Drop(DropReason::UndersizedInitial);
    }

    // A follow-up Initial for an established handshake carries our CID.
    if let Some(cid) = ConnectionId::from_slice(&pkt.dcid) {
        if let Some(entry) = registry.lookup(&cid) {
            return Action::Forward(InboundTarget {
                cid,
                packets: entry.packets,
            });
        }
    }

    let token = pkt.token.as_deref().unwrap_or(&[]);
    if token.is_empty() {
        // Unvalidated address: force the peer to echo a token back.
        let new_cid = routing::derive(conn_id_secret, &pkt.dcid);
        let token = routing::token::mint(&pkt.peer, &pkt.dcid, &new_cid, token_secret);
        return Action::Retry { new_cid, token };
    }

    // A token-bearing Initial must address the CID the token was minted
    // for, which this server always issues at 20 bytes.
    let cid = match ConnectionId::from_slice(&pkt.dcid) {
        Some(cid) => cid,
        None => return Action::Drop(DropReason::BadDcidLength),
    };

    match routing::token::validate(&pkt.peer, &cid, token_secret, token) {
        Ok(odcid) => Action::Create { cid, odcid },
        Err(_) => Action::Drop(DropReason::InvalidToken),
    }
}

fn route_regular(
    pkt: &ClassifiedDatagram,
    registry: &ConnectionRegistry,
    allow_address_routing: bool,
) -> Action {
    if pkt.dcid.is_empty() {
        // Zero-length DCIDs can only be resolved by source address.
        if allow_address_routing {
            if let Some(entry) = registry.lookup_address(&pkt.peer) {
                return Action::Forward(InboundTarget {
                    cid: entry.cid,
                    packets: entry.packets,
                });
            }
        }
        return Action::Drop(DropReason::UnknownConnection);
    }

    let cid = match ConnectionId::from_slice(&pkt.dcid) {
        Some(cid) => cid,
        None => return Action::Drop(DropReason::BadDcidLength),
    };

    match registry.lookup(&cid) {
        Some(entry) => Action::Forward(InboundTarget {
            cid,
            packets: entry.packets,
        }),
        // No stateless response here; that would be an amplification vector.
        None => Action::Drop(DropReason::UnknownConnection),
    }
}

/// Producer-side handle to one dispatcher's inboxes.
///
/// Pre-handshake traffic (Initials) and established-connection traffic
/// travel on separate bounded queues so overflow can shed handshake load
/// without touching live connections. The queues are mpmc, so on overflow
/// the producer pops the oldest queued Initial before pushing the new one.
#[derive(Clone)]
pub struct DispatcherInbox {
    regular_tx: Sender<ClassifiedDatagram>,
    initial_tx: Sender<ClassifiedDatagram>,
    initial_rx: Receiver<ClassifiedDatagram>,
}

impl DispatcherInbox {
    #[cfg(test)]
    pub(crate) fn with_capacities(
        regular: usize,
        initial: usize,
    ) -> (
        Self,
        Receiver<ClassifiedDatagram>,
        Receiver<ClassifiedDatagram>,
    ) {
        let (regular_tx, regular_rx) = bounded(regular);
        let (initial_tx, initial_rx) = bounded(initial);
        let inbox = DispatcherInbox {
            regular_tx,
            initial_tx,
            initial_rx: initial_rx.clone(),
        };
        (inbox, regular_rx, initial_rx)
    }

    pub fn deliver(&self, pkt: ClassifiedDatagram) -> Result<(), DropReason> {
        if pkt.kind == PacketKind::Initial {
            // Oldest pre-handshake packet gives way under pressure.
            if self.initial_tx.is_full() {
                let _ = self.initial_rx.try_recv();
            }
            return self
                .initial_tx
                .try_send(pkt)
                .map_err(|_| DropReason::QueueFull);
        }

        match self.regular_tx.try_send(pkt) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(DropReason::QueueFull)
            }
        }
    }
}

/// One dispatcher worker.
pub struct Dispatcher {
    endpoint: String,
    index: usize,
    regular_rx: Receiver<ClassifiedDatagram>,
    initial_rx: Receiver<ClassifiedDatagram>,
    quic_config: quiche::Config,
    builder: PacketBuilder,
    sender: SenderHandle,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    token_secret: Vec<u8>,
    conn_id_secret: Vec<u8>,
    allow_address_routing: bool,
    vn_rate_limiter: HashMap<PeerAddr, (u32, Instant)>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: &ServerConfig,
        index: usize,
        regular_rx: Receiver<ClassifiedDatagram>,
        initial_rx: Receiver<ClassifiedDatagram>,
        sender: SenderHandle,
        registry: Arc<ConnectionRegistry>,
        supervisor: Arc<ConnectionSupervisor>,
        metrics: Arc<Metrics>,
        shutdown: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        // Config and builder are owned by this worker; if either fails to
        // build, whatever was constructed is released right here.
        let quic_config = config.build_quiche_config()?;
        let builder = PacketBuilder::new(config.transport.max_udp_payload_size);

        Ok(Self {
            endpoint: config.server.name.clone(),
            index,
            regular_rx,
            initial_rx,
            quic_config,
            builder,
            local_addr: sender.local_addr(),
            sender,
            registry,
            supervisor,
            token_secret: config.secrets.token_secret_bytes(),
            conn_id_secret: config.secrets.connection_id_secret_bytes(),
            allow_address_routing: config.routing.allow_address_routing,
            vn_rate_limiter: HashMap::new(),
            metrics,
            shutdown,
        })
    }

    fn run(mut self) {
        if !routing::register_dispatcher(&self.endpoint, self.index) {
            // Another incarnation of this worker is still registered; a
            // duplicate spawn exits as a normal no-op so supervision stays
            // idempotent.
            info!(
                endpoint = %self.endpoint,
                index = self.index,
                "dispatcher already registered, exiting"
            );
            return;
        }

        debug!(endpoint = %self.endpoint, index = self.index, "dispatcher started");

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            // Established-connection traffic first; handshake work only when
            // the regular queue is idle.
            if let Ok(pkt) = self.regular_rx.try_recv() {
                self.on_packet(pkt);
                continue;
            }
            if let Ok(pkt) = self.initial_rx.try_recv() {
                self.on_packet(pkt);
                continue;
            }

            crossbeam_channel::select! {
                recv(self.regular_rx) -> pkt => match pkt {
                    Ok(pkt) => self.on_packet(pkt),
                    Err(_) => break,
                },
                recv(self.initial_rx) -> pkt => match pkt {
                    Ok(pkt) => self.on_packet(pkt),
                    Err(_) => break,
                },
                default(Duration::from_millis(100)) => {}
            }
        }

        routing::unregister_dispatcher(&self.endpoint, self.index);
        debug!(endpoint = %self.endpoint, index = self.index, "dispatcher stopped");
    }

    /// Apply the routing algorithm to one classified datagram.
    pub fn on_packet(&mut self, pkt: ClassifiedDatagram) {
        let action = route(
            &pkt,
            &self.registry,
            &self.token_secret,
            &self.conn_id_secret,
            self.allow_address_routing,
        );

        match action {
            Action::VersionNegotiate => self.reply_version_negotiation(&pkt),
            Action::Retry { new_cid, token } => self.reply_retry(&pkt, &new_cid, &token),
            Action::Forward(target) => self.forward(target, pkt.peer, pkt.payload),
            Action::Create { cid, odcid } => self.create_and_forward(pkt, cid, odcid),
            Action::Drop(reason) => self.drop_packet(&pkt, reason),
        }
    }

    fn reply_version_negotiation(&mut self, pkt: &ClassifiedDatagram) {
        if !self.should_send_version_negotiation(pkt.peer) {
            debug!(peer = %pkt.peer, "version negotiation rate limited");
            return;
        }

        match self.builder.negotiate_version(&pkt.scid, &pkt.dcid) {
            Ok(out) => {
                debug!(
                    peer = %pkt.peer,
                    version = format_args!("{:#010x}", pkt.version),
                    "sending version negotiation"
                );
                if self.sender.try_send(pkt.peer, Bytes::copy_from_slice(out)) {
                    self.metrics.version_negotiations_sent.incr();
                } else {
                    self.metrics.record_drop(DropReason::QueueFull);
                }
            }
            Err(e) => warn!(peer = %pkt.peer, error = ?e, "failed to build version negotiation"),
        }
    }

    fn reply_retry(&mut self, pkt: &ClassifiedDatagram, new_cid: &ConnectionId, token: &[u8]) {
        match self
            .builder
            .retry(&pkt.scid, &pkt.dcid, new_cid, token, pkt.version)
        {
            Ok(out) => {
                debug!(peer = %pkt.peer, cid = %new_cid, "sending retry");
                if self.sender.try_send(pkt.peer, Bytes::copy_from_slice(out)) {
                    self.metrics.retries_sent.incr();
                } else {
                    self.metrics.record_drop(DropReason::QueueFull);
                }
            }
            Err(e) => warn!(peer = %pkt.peer, error = ?e, "failed to build retry"),
        }
    }

    fn forward(&self, target: InboundTarget, peer: PeerAddr, payload: Vec<u8>) {
        match target.packets.try_send(InboundDatagram { peer, payload }) {
            Ok(()) => {}
            Err(_) => {
                // Mailbox full or actor mid-teardown. QUIC retransmits.
                debug!(cid = %target.cid, "connection mailbox unavailable, dropping datagram");
                self.metrics.record_drop(DropReason::QueueFull);
            }
        }
    }

    fn create_and_forward(&mut self, pkt: ClassifiedDatagram, cid: ConnectionId, odcid: Vec<u8>) {
        self.metrics.tokens_validated.incr();

        let created = self.supervisor.create_connection(
            pkt.peer,
            &pkt.scid,
            cid,
            &odcid,
            &mut self.quic_config,
            self.sender.clone(),
            self.local_addr,
        );

        match created {
            Ok(entry) => {
                self.forward(
                    InboundTarget {
                        cid,
                        packets: entry.packets,
                    },
                    pkt.peer,
                    pkt.payload,
                );
            }
            Err(CreateError::AlreadyRegistered) => {
                // Lost a creation race; the winner's actor takes the packet.
                if let Some(entry) = self.registry.lookup(&cid) {
                    self.forward(
                        InboundTarget {
                            cid,
                            packets: entry.packets,
                        },
                        pkt.peer,
                        pkt.payload,
                    );
                } else {
                    self.drop_packet(&pkt, DropReason::UnknownConnection);
                }
            }
            Err(e) => {
                error!(peer = %pkt.peer, cid = %cid, error = %e, "connection creation failed");
                self.metrics.record_drop(DropReason::SystemError);
            }
        }
    }

    fn drop_packet(&self, pkt: &ClassifiedDatagram, reason: DropReason) {
        if reason == DropReason::InvalidToken {
            self.metrics.token_failures.incr();
        }
        debug!(
            peer = %pkt.peer,
            kind = ?pkt.kind,
            reason = reason.label(),
            "dropping datagram"
        );
        self.metrics.record_drop(reason);
    }

    /// RFC 9000 §5.2.2 allows limiting Version Negotiation volume; sliding
    /// window per source address.
    fn should_send_version_negotiation(&mut self, peer: PeerAddr) -> bool {
        let now = Instant::now();
        let entry = self.vn_rate_limiter.entry(peer).or_insert((0, now));

        if now.duration_since(entry.1) > VN_WINDOW {
            *entry = (1, now);
            true
        } else if entry.0 < MAX_VN_PER_WINDOW {
            entry.0 += 1;
            true
        } else {
            false
        }
    }
}

/// Handle over the dispatcher pool.
pub struct DispatchHandle {
    workers: Vec<JoinHandle<()>>,
    inboxes: Vec<DispatcherInbox>,
    shutdown: Arc<AtomicBool>,
}

impl DispatchHandle {
    pub fn inboxes(&self) -> Vec<DispatcherInbox> {
        self.inboxes.clone()
    }

    pub fn worker_count(&self) -> usize {
        self.inboxes.len()
    }

    /// Signal and join all workers. Queued datagrams are drained by the
    /// worker loops before their channels disconnect.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (i, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                error!(worker = i, "dispatcher thread panicked");
            }
        }
        info!("dispatcher pool stopped");
    }
}

/// Spawn the dispatcher pool.
///
/// The sender binding is fixed: `sender_index = dispatcher_index mod
/// socket_count`, which together with CID sharding gives every connection a
/// stable write path.
pub fn spawn(
    config: &Arc<ServerConfig>,
    senders: &[SenderHandle],
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    metrics: Arc<Metrics>,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<DispatchHandle> {
    let count = config.pools.dispatcher_pool_size;
    anyhow::ensure!(count > 0, "dispatcher pool must have at least 1 worker");
    anyhow::ensure!(!senders.is_empty(), "dispatcher pool requires senders");

    let mut workers = Vec::with_capacity(count);
    let mut inboxes = Vec::with_capacity(count);

    for index in 0..count {
        let (regular_tx, regular_rx) = bounded(config.channels.dispatcher_regular_capacity);
        let (initial_tx, initial_rx) = bounded(config.channels.dispatcher_initial_capacity);

        let inbox = DispatcherInbox {
            regular_tx,
            initial_tx,
            initial_rx: initial_rx.clone(),
        };

        let sender = senders[index % senders.len()].clone();
        let dispatcher = Dispatcher::new(
            config,
            index,
            regular_rx,
            initial_rx,
            sender,
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            Arc::clone(&metrics),
            Arc::clone(&shutdown),
        )?;

        let pin = config.pools.pin_to_cpu;
        let handle = thread::Builder::new()
            .name(format!("dispatch-{}", index))
            .spawn(move || {
                if pin {
                    if let Some(core) =
                        core_affinity::get_core_ids().and_then(|ids| ids.get(index).copied())
                    {
                        core_affinity::set_for_current(core);
                    }
                }
                dispatcher.run()
            })?;

        workers.push(handle);
        inboxes.push(inbox);
    }

    info!(dispatchers = count, "dispatcher pool started");

    Ok(DispatchHandle {
        workers,
        inboxes,
        shutdown,
    })
}

//! Connection supervisor.
//!
//! Factory and lifecycle manager for connection actors. Creation is atomic
//! with respect to the registry: the entry is reserved first, the QUIC
//! connection is accepted second, and the reservation is rolled back if the
//! accept fails. A monitor task watches every actor and removes its registry
//! entry when the actor ends, whether it returned or panicked.

use crate::config::ServerConfig;
use crate::connection::actor::{ActorParts, ConnectionActor};
use crate::connection::registry::{ConnectionEntry, ConnectionRegistry};
use crate::connection::InboundDatagram;
use crate::error::CreateError;
use crate::netio::sender::SenderHandle;
use crate::peer::PeerAddr;
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use quicway_x::{Command, ConnectionId, HandlerFactory};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// How long terminating actors get to close cleanly before they are killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct ActorRecord {
    cid: ConnectionId,
    peer: PeerAddr,
    /// Command path into the actor, used to request a graceful close.
    commands: mpsc::Sender<Command>,
    abort: AbortHandle,
}

pub struct ConnectionSupervisor {
    runtime: Handle,
    registry: Arc<ConnectionRegistry>,
    factory: HandlerFactory,
    config: Arc<ServerConfig>,
    metrics: Arc<Metrics>,
    actors: Arc<Mutex<HashMap<u64, ActorRecord>>>,
    next_actor_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ConnectionSupervisor {
    pub fn new(
        runtime: Handle,
        registry: Arc<ConnectionRegistry>,
        factory: HandlerFactory,
        config: Arc<ServerConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            runtime,
            registry,
            factory,
            config,
            metrics,
            actors: Arc::new(Mutex::new(HashMap::new())),
            next_actor_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Create the connection actor owning `cid`, or fail with
    /// `AlreadyRegistered` if another actor beat us to it (the caller
    /// adopts that one via the registry).
    #[allow(clippy::too_many_arguments)]
    pub fn create_connection(
        &self,
        peer: PeerAddr,
        client_scid: &[u8],
        cid: ConnectionId,
        odcid: &[u8],
        quic_config: &mut quiche::Config,
        sender: SenderHandle,
        local: SocketAddr,
    ) -> Result<ConnectionEntry, CreateError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(CreateError::ShuttingDown);
        }

        let actor_id = self.next_actor_id.fetch_add(1, Ordering::Relaxed);
        let (packets_tx, packets_rx) =
            mpsc::channel::<InboundDatagram>(self.config.channels.connection_mailbox_capacity);

        let entry = ConnectionEntry {
            cid,
            actor_id,
            packets: packets_tx,
            created_at: Instant::now(),
        };

        // Reserve the identity before touching the QUIC library; uniqueness
        // on insert is what makes concurrent creation benign.
        if let Err(_existing) = self.registry.insert_unique(entry.clone()) {
            return Err(CreateError::AlreadyRegistered);
        }

        let scid = quiche::ConnectionId::from_ref(cid.as_bytes());
        let odcid_q = quiche::ConnectionId::from_ref(odcid);
        let conn = match quiche::accept(
            &scid,
            Some(&odcid_q),
            local,
            peer.socket_addr(),
            quic_config,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                // Roll the reservation back before surfacing the failure.
                self.registry.remove(&cid, actor_id);
                return Err(CreateError::System(e));
            }
        };

        let (events_tx, events_rx) =
            mpsc::channel(self.config.channels.handler_event_capacity);
        let (commands_tx, commands_rx) = mpsc::channel(self.config.channels.command_capacity);

        let actor = ConnectionActor::new(ActorParts {
            cid,
            conn,
            peer,
            local,
            packets_rx,
            commands_rx,
            commands_tx: commands_tx.clone(),
            events_tx,
            events_rx,
            factory: Arc::clone(&self.factory),
            sender,
            metrics: Arc::clone(&self.metrics),
            max_udp_payload: self.config.transport.max_udp_payload_size,
        });

        let join = self.runtime.spawn(actor.run());
        let abort = join.abort_handle();

        self.actors.lock().insert(
            actor_id,
            ActorRecord {
                cid,
                peer,
                commands: commands_tx,
                abort,
            },
        );

        self.registry.bind_address(peer, cid);
        self.metrics.connections_active.incr();

        // Monitor: the registry holds an entry iff the actor is alive, so
        // cleanup rides on task termination, panics included.
        let registry = Arc::clone(&self.registry);
        let actors = Arc::clone(&self.actors);
        let metrics = Arc::clone(&self.metrics);
        self.runtime.spawn(async move {
            if let Err(e) = join.await {
                if e.is_panic() {
                    warn!(cid = %cid, "connection actor panicked");
                }
            }
            registry.remove(&cid, actor_id);
            registry.unbind_address(&peer, &cid);
            actors.lock().remove(&actor_id);
            metrics.connections_active.decr();
            debug!(cid = %cid, "connection entry removed");
        });

        debug!(
            cid = %cid,
            peer = %peer,
            scid = ?client_scid,
            odcid_len = odcid.len(),
            "connection created"
        );
        self.metrics.connections_created.incr();

        Ok(entry)
    }

    /// Thin lookup wrapper over the registry.
    pub fn lookup_connection(&self, cid: &ConnectionId) -> Option<ConnectionEntry> {
        self.registry.lookup(cid)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Close every actor, allowing [`SHUTDOWN_GRACE`] for clean teardown,
    /// then abort whatever is left.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);

        let records: Vec<(u64, mpsc::Sender<Command>)> = {
            let actors = self.actors.lock();
            actors
                .iter()
                .map(|(id, r)| (*id, r.commands.clone()))
                .collect()
        };

        info!(connections = records.len(), "closing connections");

        for (_, commands) in &records {
            let _ = commands.try_send(Command::Close {
                error_code: 0x0,
                reason: "server shutdown".to_string(),
            });
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            if self.actors.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let stragglers: Vec<ActorRecord> = {
            let mut actors = self.actors.lock();
            actors.drain().map(|(_, r)| r).collect()
        };
        if !stragglers.is_empty() {
            warn!(
                connections = stragglers.len(),
                "grace window expired, aborting remaining actors"
            );
            for record in stragglers {
                // The monitor sees the aborted task and clears the registry.
                record.abort.abort();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("connection supervisor stopped");
    }
}

//! Root coordinator.
//!
//! Wires configuration into the three pools and owns startup and teardown
//! order. Startup: registry → supervisor → dispatcher pool → sender pool →
//! socket readers. Teardown: readers first (stop ingress), then the
//! supervisor's actors (with senders still alive so CONNECTION_CLOSE
//! packets drain), then dispatchers, then senders, then the registry.

use crate::config::ServerConfig;
use crate::connection::{ConnectionRegistry, ConnectionSupervisor};
use crate::dispatch::{self, DispatchHandle};
use crate::netio::{NetIoHandle, SocketPool};
use crate::telemetry::Metrics;
use anyhow::{Context, Result};
use quicway_x::HandlerFactory;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// A started server. Dropping it does not stop the threads; call
/// [`RunningServer::shutdown`].
pub struct RunningServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    netio: NetIoHandle,
    dispatch: DispatchHandle,
    metrics: Arc<Metrics>,
}

/// Start the server with the given application handler factory.
///
/// `runtime` hosts the connection actors and handler tasks; the pools run
/// on their own native threads.
pub fn start(
    config: Arc<ServerConfig>,
    factory: HandlerFactory,
    runtime: Handle,
) -> Result<RunningServer> {
    let metrics = Arc::new(Metrics::new());
    let shutdown = Arc::new(AtomicBool::new(false));

    // Sockets and sender queues exist before anything that needs a write
    // path; their threads start later in order.
    let pool = SocketPool::open(&config, &metrics, &shutdown).context("opening socket pool")?;

    let registry = Arc::new(ConnectionRegistry::new(
        config.routing.allow_address_routing,
    ));

    let supervisor = Arc::new(ConnectionSupervisor::new(
        runtime,
        Arc::clone(&registry),
        factory,
        Arc::clone(&config),
        Arc::clone(&metrics),
    ));

    let dispatch = dispatch::spawn(
        &config,
        pool.sender_handles(),
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    )
    .context("starting dispatcher pool")?;

    let netio = pool
        .start(&config, dispatch.inboxes(), &metrics, &shutdown)
        .context("starting network layer")?;

    info!(
        endpoint = %config.server.name,
        addr = %config.bind_addr()?,
        sockets = config.pools.socket_pool_size,
        dispatchers = dispatch.worker_count(),
        "server started"
    );

    Ok(RunningServer {
        config,
        registry,
        supervisor,
        netio,
        dispatch,
        metrics,
    })
}

impl RunningServer {
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Orderly teardown; every stage gets its grace window before the next
    /// one starts.
    pub async fn shutdown(mut self) {
        info!(endpoint = %self.config.server.name, "shutting down");

        // 1. No new input.
        self.netio.stop_readers();

        // 2. Close connection actors; senders are still draining, so close
        //    frames reach the wire. Actors must be gone before dispatchers
        //    drop their QUIC configurations.
        self.supervisor.shutdown().await;

        // 3. Dispatchers have nothing left to route.
        self.dispatch.shutdown();

        // 4. Flush and stop the write path.
        self.netio.stop_senders();

        info!(
            connections_remaining = self.registry.len(),
            "shutdown complete\n{}",
            self.metrics.render()
        );
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use quicway::{config, runtime, server, telemetry};
use quicway_x::{ConnectionHandle, ConnectionHandler, Event};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, info};

/// Default application: echoes stream data and datagrams back to the peer.
struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn on_connection(self: Box<Self>, mut handle: ConnectionHandle) {
        info!(cid = %handle.id(), "connection ready");

        while let Some(event) = handle.next_event().await {
            match event {
                Event::StreamData {
                    stream_id,
                    data,
                    fin,
                } if stream_id.is_bidirectional() => {
                    if handle.stream_send(stream_id, data, fin).await.is_err() {
                        break;
                    }
                }
                Event::DatagramReceived { data } => {
                    if handle.dgram_send(data).await.is_err() {
                        break;
                    }
                }
                Event::ConnectionClosed => break,
                other => debug!(cid = %handle.id(), event = ?other, "event"),
            }
        }

        info!(cid = %handle.id(), "connection finished");
    }
}

fn main() -> Result<()> {
    let cfg = config::load_config()?;

    telemetry::init_logging(&cfg.logging).context("failed to initialize logging")?;
    info!(endpoint = %cfg.server.name, "configuration loaded");

    let rt = runtime::create_runtime(&cfg.runtime).context("failed to build runtime")?;
    let cfg = Arc::new(cfg);

    rt.block_on(async {
        let factory: quicway_x::HandlerFactory = Arc::new(|| Box::new(EchoHandler));
        let running = server::start(Arc::clone(&cfg), factory, tokio::runtime::Handle::current())?;

        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;

        info!("shutdown signal received");
        running.shutdown().await;

        Ok::<(), anyhow::Error>(())
    })
}

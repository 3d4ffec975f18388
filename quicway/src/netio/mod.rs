//! Network I/O: the socket pool and its reader and sender threads.

pub mod reader;
pub mod sender;
pub mod socket;

#[cfg(test)]
mod tests;

use crate::config::ServerConfig;
use crate::dispatch::DispatcherInbox;
use crate::telemetry::Metrics;
use anyhow::{Context, Result};
use reader::SocketReader;
use sender::{SenderHandle, SenderWorker};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// The socket pool before any thread has been spawned.
///
/// Sockets and sender queues are created early so dispatchers can bind to
/// their senders; the servicing threads start later, in dependency order.
pub struct SocketPool {
    sockets: Vec<UdpSocket>,
    sender_handles: Vec<SenderHandle>,
    sender_workers: Vec<SenderWorker>,
}

impl SocketPool {
    /// Open `socket_pool_size` sockets on the configured address and pair
    /// each with a sender.
    pub fn open(
        config: &ServerConfig,
        metrics: &Arc<Metrics>,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<Self> {
        let bind_addr = config.bind_addr()?;
        let count = config.pools.socket_pool_size;
        anyhow::ensure!(count > 0, "socket pool must have at least 1 socket");

        let mut sockets = Vec::with_capacity(count);
        let mut sender_handles = Vec::with_capacity(count);
        let mut sender_workers = Vec::with_capacity(count);

        for index in 0..count {
            let socket = socket::create_udp_socket(
                bind_addr,
                config.pools.socket_recv_buffer_size,
                config.pools.socket_send_buffer_size,
            )
            .with_context(|| format!("opening socket {}", index))?;

            let send_socket = socket
                .try_clone()
                .with_context(|| format!("cloning socket {} for its sender", index))?;

            let (handle, worker) = sender::new_sender(
                index,
                send_socket,
                config.channels.sender_capacity,
                Arc::clone(metrics),
                Arc::clone(shutdown),
            )?;

            sockets.push(socket);
            sender_handles.push(handle);
            sender_workers.push(worker);
        }

        info!(sockets = count, addr = %bind_addr, "socket pool open");

        Ok(Self {
            sockets,
            sender_handles,
            sender_workers,
        })
    }

    pub fn sender_handles(&self) -> &[SenderHandle] {
        &self.sender_handles
    }

    /// Spawn the sender threads, then the reader threads, consuming the
    /// pool. Dispatcher inboxes must already exist.
    pub fn start(
        self,
        config: &ServerConfig,
        inboxes: Vec<DispatcherInbox>,
        metrics: &Arc<Metrics>,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<NetIoHandle> {
        let mut senders = Vec::with_capacity(self.sender_workers.len());
        for worker in self.sender_workers {
            senders.push(worker.spawn()?);
        }

        let polling_timeout = Duration::from_millis(config.pools.socket_polling_timeout_ms);
        let mut readers = Vec::with_capacity(self.sockets.len());
        for (index, socket) in self.sockets.into_iter().enumerate() {
            let reader = SocketReader::new(
                index,
                socket,
                inboxes.clone(),
                config.secrets.connection_id_secret_bytes(),
                config.pools.socket_event_capacity,
                polling_timeout,
                Arc::clone(metrics),
                Arc::clone(shutdown),
            )?;
            readers.push(reader.spawn(config.pools.pin_to_cpu)?);
        }

        info!(
            readers = readers.len(),
            senders = senders.len(),
            "network layer started"
        );

        Ok(NetIoHandle {
            readers,
            senders,
            shutdown: Arc::clone(shutdown),
        })
    }
}

/// Handle over the running reader and sender threads.
pub struct NetIoHandle {
    readers: Vec<JoinHandle<()>>,
    senders: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl NetIoHandle {
    /// Stop the readers only; senders keep draining so closing connections
    /// can still flush.
    pub fn stop_readers(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (i, reader) in self.readers.drain(..).enumerate() {
            if reader.join().is_err() {
                error!(reader = i, "reader thread panicked");
            }
        }
        info!("socket readers stopped");
    }

    /// Join the sender threads. Call after everything that writes is done.
    pub fn stop_senders(mut self) {
        for (i, sender) in self.senders.drain(..).enumerate() {
            if sender.join().is_err() {
                error!(sender = i, "sender thread panicked");
            }
        }
        info!("senders stopped");
    }
}

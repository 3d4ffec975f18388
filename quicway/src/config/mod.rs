//! Server configuration.
//!
//! Composable section structs with serde defaults and per-section
//! `validate()` methods; loading precedence (defaults < file < env < CLI)
//! lives in [`loader`].

pub mod loader;

#[cfg(test)]
mod tests;

pub use loader::load_config;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Smallest secret the server accepts, in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Master configuration for one server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: EndpointConfig,
    pub pools: PoolConfig,
    pub secrets: SecretConfig,
    pub tls: TlsConfig,
    pub transport: TransportConfig,
    pub routing: RoutingConfig,
    pub channels: ChannelConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: EndpointConfig::default(),
            pools: PoolConfig::default(),
            secrets: SecretConfig::default(),
            tls: TlsConfig::default(),
            transport: TransportConfig::default(),
            routing: RoutingConfig::default(),
            channels: ChannelConfig::default(),
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.pools.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.secrets.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.tls.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.channels.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.runtime.validate() {
            errors.extend(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid bind address {}:{}",
                    self.server.host, self.server.port
                )
            })
    }

    /// Build the QUIC library configuration a dispatcher owns.
    pub fn build_quiche_config(&self) -> anyhow::Result<quiche::Config> {
        let mut qc = quiche::Config::new(quiche::PROTOCOL_VERSION)
            .context("creating QUIC configuration")?;

        let cert = self
            .tls
            .cert_path
            .as_ref()
            .context("tls.cert_path is required")?;
        let key = self
            .tls
            .key_path
            .as_ref()
            .context("tls.key_path is required")?;

        qc.load_cert_chain_from_pem_file(&cert.to_string_lossy())
            .with_context(|| format!("loading certificate chain from {}", cert.display()))?;
        qc.load_priv_key_from_pem_file(&key.to_string_lossy())
            .with_context(|| format!("loading private key from {}", key.display()))?;

        let alpn: Vec<&[u8]> = self.tls.alpn.iter().map(|p| p.as_bytes()).collect();
        qc.set_application_protos(&alpn)
            .context("setting ALPN protocols")?;

        let t = &self.transport;
        qc.set_max_idle_timeout(t.max_idle_timeout_ms);
        qc.set_max_recv_udp_payload_size(t.max_udp_payload_size);
        qc.set_max_send_udp_payload_size(t.max_udp_payload_size);
        qc.set_initial_max_data(t.initial_max_data);
        qc.set_initial_max_stream_data_bidi_local(t.initial_max_stream_data_bidi_local);
        qc.set_initial_max_stream_data_bidi_remote(t.initial_max_stream_data_bidi_remote);
        qc.set_initial_max_stream_data_uni(t.initial_max_stream_data_uni);
        qc.set_initial_max_streams_bidi(t.initial_max_streams_bidi);
        qc.set_initial_max_streams_uni(t.initial_max_streams_uni);
        qc.set_disable_active_migration(t.disable_active_migration);

        if t.enable_dgram {
            qc.enable_dgram(true, t.dgram_queue_len, t.dgram_queue_len);
        }
        if t.enable_early_data {
            qc.enable_early_data();
        }

        qc.verify_peer(false);

        Ok(qc)
    }
}

/// Endpoint identity and binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Name under which dispatchers register; also the telemetry service
    /// name.
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "quicway".to_string(),
            host: "0.0.0.0".to_string(),
            port: 4433,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("server.name must not be empty".to_string());
        }
        if self.host.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("invalid host address: {}", self.host));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Pool sizing and socket polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of UDP sockets (and senders). Each socket gets a reader
    /// thread; SO_REUSEPORT spreads inbound load across them.
    pub socket_pool_size: usize,
    /// Number of dispatcher workers.
    pub dispatcher_pool_size: usize,
    /// Max datagrams a reader drains per wake.
    pub socket_event_capacity: usize,
    /// Socket read timeout; bounds how long a quiet reader sleeps.
    pub socket_polling_timeout_ms: u64,
    /// Pin reader and dispatcher threads to CPU cores.
    pub pin_to_cpu: bool,
    /// Optional SO_RCVBUF size.
    pub socket_recv_buffer_size: Option<usize>,
    /// Optional SO_SNDBUF size.
    pub socket_send_buffer_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            socket_pool_size: num_cpus::get().max(1),
            dispatcher_pool_size: num_cpus::get().max(1),
            socket_event_capacity: 64,
            socket_polling_timeout_ms: 50,
            pin_to_cpu: false,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.socket_pool_size == 0 {
            errors.push("pools.socket_pool_size must be > 0".to_string());
        }
        if self.dispatcher_pool_size == 0 {
            errors.push("pools.dispatcher_pool_size must be > 0".to_string());
        }
        if self.socket_event_capacity == 0 {
            errors.push("pools.socket_event_capacity must be > 0".to_string());
        }
        if self.socket_polling_timeout_ms == 0 {
            errors.push("pools.socket_polling_timeout_ms must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Process-wide secrets; immutable once loaded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretConfig {
    /// Keys the retry-token MAC. At least 32 bytes.
    pub token_secret: String,
    /// Keys the connection-ID derivation. At least 32 bytes.
    pub connection_id_secret: String,
}

impl SecretConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.token_secret.len() < MIN_SECRET_LEN {
            errors.push(format!(
                "secrets.token_secret must be at least {} bytes",
                MIN_SECRET_LEN
            ));
        }
        if self.connection_id_secret.len() < MIN_SECRET_LEN {
            errors.push(format!(
                "secrets.connection_id_secret must be at least {} bytes",
                MIN_SECRET_LEN
            ));
        }
        if !self.token_secret.is_empty() && self.token_secret == self.connection_id_secret {
            errors.push("secrets.token_secret and secrets.connection_id_secret must differ".into());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn token_secret_bytes(&self) -> Vec<u8> {
        self.token_secret.as_bytes().to_vec()
    }

    pub fn connection_id_secret_bytes(&self) -> Vec<u8> {
        self.connection_id_secret.as_bytes().to_vec()
    }
}

/// TLS material for the QUIC handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// ALPN identifiers, most preferred first.
    pub alpn: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            alpn: vec!["wq-vvv-01".to_string(), "h3".to_string()],
        }
    }
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.cert_path.is_none() {
            errors.push("tls.cert_path is required".to_string());
        }
        if self.key_path.is_none() {
            errors.push("tls.key_path is required".to_string());
        }
        if let Some(cert) = &self.cert_path {
            if !cert.exists() {
                errors.push(format!("certificate file not found: {}", cert.display()));
            }
        }
        if let Some(key) = &self.key_path {
            if !key.exists() {
                errors.push(format!("private key file not found: {}", key.display()));
            }
        }
        if self.alpn.is_empty() {
            errors.push("tls.alpn must list at least one protocol".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// QUIC transport parameters applied to every dispatcher's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub initial_max_data: u64,
    pub max_udp_payload_size: usize,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout_ms: u64,
    pub disable_active_migration: bool,
    pub enable_early_data: bool,
    pub enable_dgram: bool,
    pub dgram_queue_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            initial_max_data: 10_000_000,
            max_udp_payload_size: 1350,
            initial_max_stream_data_bidi_local: 1_000_000,
            initial_max_stream_data_bidi_remote: 1_000_000,
            initial_max_stream_data_uni: 1_000_000,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_idle_timeout_ms: 30_000,
            disable_active_migration: true,
            enable_early_data: false,
            enable_dgram: true,
            dgram_queue_len: 1024,
        }
    }
}

/// Routing knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Maintain an address→CID side-table so zero-length-DCID packets and
    /// migrating peers can still be routed.
    pub allow_address_routing: bool,
}

/// Channel capacities for every hop in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Dispatcher inbox for pre-handshake Initials; overflow sheds oldest.
    pub dispatcher_initial_capacity: usize,
    /// Dispatcher inbox for established-connection traffic.
    pub dispatcher_regular_capacity: usize,
    /// Per-sender outbound queue.
    pub sender_capacity: usize,
    /// Per-connection packet mailbox.
    pub connection_mailbox_capacity: usize,
    /// Actor→handler event channel.
    pub handler_event_capacity: usize,
    /// Handler→actor command channel.
    pub command_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dispatcher_initial_capacity: 256,
            dispatcher_regular_capacity: 2048,
            sender_capacity: 4096,
            connection_mailbox_capacity: 256,
            handler_event_capacity: 1024,
            command_capacity: 256,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.dispatcher_initial_capacity < 16 {
            errors.push("channels.dispatcher_initial_capacity must be at least 16".to_string());
        }
        if self.dispatcher_regular_capacity < 64 {
            errors.push("channels.dispatcher_regular_capacity must be at least 64".to_string());
        }
        if self.sender_capacity < 64 {
            errors.push("channels.sender_capacity must be at least 64".to_string());
        }
        if self.connection_mailbox_capacity < 16 {
            errors.push("channels.connection_mailbox_capacity must be at least 16".to_string());
        }
        if self.handler_event_capacity < 32 {
            errors.push("channels.handler_event_capacity must be at least 32".to_string());
        }
        if self.command_capacity < 16 {
            errors.push("channels.command_capacity must be at least 16".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Tokio runtime settings for connection actors and handler tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
    pub max_blocking_threads: usize,
    pub thread_name: String,
    pub thread_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            max_blocking_threads: 512,
            thread_name: "quicway-conn".to_string(),
            thread_stack_size: 2 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.worker_threads == 0 {
            errors.push("runtime.worker_threads must be > 0".to_string());
        }
        if self.thread_stack_size < 128 * 1024 {
            errors.push("runtime.thread_stack_size too small (< 128 KiB)".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset.
    pub level: String,
    /// Emit JSON-structured log lines.
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

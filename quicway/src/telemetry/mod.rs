//! Telemetry: structured logging and lock-free counters.
//!
//! Hot paths record into atomic counters only; nothing here blocks or
//! allocates. The counter snapshot renders in Prometheus text exposition
//! format for embedding or logging at shutdown.

use crate::config::LoggingConfig;
use crate::error::DropReason;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging. `RUST_LOG` wins over the configured
/// level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// A monotonically adjusted counter (or gauge, via `decr`).
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Server-wide instrumentation, shared by reference with every component.
#[derive(Debug)]
pub struct Metrics {
    // Ingress / egress
    pub packets_received: Counter,
    pub bytes_received: Counter,
    pub packets_sent: Counter,
    pub bytes_sent: Counter,
    pub recv_errors: Counter,
    pub send_errors: Counter,

    // Stateless responses
    pub version_negotiations_sent: Counter,
    pub retries_sent: Counter,

    // Address validation
    pub tokens_validated: Counter,
    pub token_failures: Counter,

    // Connection lifecycle
    pub connections_created: Counter,
    pub connections_established: Counter,
    pub connections_closed: Counter,
    pub connections_active: Counter,

    // Drops by reason
    pub drops_malformed: Counter,
    pub drops_bad_dcid: Counter,
    pub drops_invalid_token: Counter,
    pub drops_unknown_connection: Counter,
    pub drops_undersized: Counter,
    pub drops_queue_full: Counter,
    pub drops_system: Counter,

    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            packets_received: Counter::default(),
            bytes_received: Counter::default(),
            packets_sent: Counter::default(),
            bytes_sent: Counter::default(),
            recv_errors: Counter::default(),
            send_errors: Counter::default(),
            version_negotiations_sent: Counter::default(),
            retries_sent: Counter::default(),
            tokens_validated: Counter::default(),
            token_failures: Counter::default(),
            connections_created: Counter::default(),
            connections_established: Counter::default(),
            connections_closed: Counter::default(),
            connections_active: Counter::default(),
            drops_malformed: Counter::default(),
            drops_bad_dcid: Counter::default(),
            drops_invalid_token: Counter::default(),
            drops_unknown_connection: Counter::default(),
            drops_undersized: Counter::default(),
            drops_queue_full: Counter::default(),
            drops_system: Counter::default(),
            start_time: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_drop(&self, reason: DropReason) {
        match reason {
            DropReason::MalformedPacket => self.drops_malformed.incr(),
            DropReason::BadDcidLength => self.drops_bad_dcid.incr(),
            DropReason::InvalidToken => self.drops_invalid_token.incr(),
            DropReason::UnknownConnection => self.drops_unknown_connection.incr(),
            DropReason::UndersizedInitial => self.drops_undersized.incr(),
            DropReason::QueueFull => self.drops_queue_full.incr(),
            DropReason::SystemError => self.drops_system.incr(),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.drops_malformed.get()
            + self.drops_bad_dcid.get()
            + self.drops_invalid_token.get()
            + self.drops_unknown_connection.get()
            + self.drops_undersized.get()
            + self.drops_queue_full.get()
            + self.drops_system.get()
    }

    /// Render a snapshot in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP quicway_uptime_seconds Seconds since server start\n\
             # TYPE quicway_uptime_seconds counter\n\
             quicway_uptime_seconds {}\n\
             # HELP quicway_packets_received_total UDP datagrams received\n\
             # TYPE quicway_packets_received_total counter\n\
             quicway_packets_received_total {}\n\
             # HELP quicway_packets_sent_total UDP datagrams sent\n\
             # TYPE quicway_packets_sent_total counter\n\
             quicway_packets_sent_total {}\n\
             # HELP quicway_version_negotiations_sent_total Version Negotiation replies\n\
             # TYPE quicway_version_negotiations_sent_total counter\n\
             quicway_version_negotiations_sent_total {}\n\
             # HELP quicway_retries_sent_total Stateless Retry replies\n\
             # TYPE quicway_retries_sent_total counter\n\
             quicway_retries_sent_total {}\n\
             # HELP quicway_retry_tokens_validated_total Tokens that validated\n\
             # TYPE quicway_retry_tokens_validated_total counter\n\
             quicway_retry_tokens_validated_total {}\n\
             # HELP quicway_retry_token_failures_total Tokens that failed validation\n\
             # TYPE quicway_retry_token_failures_total counter\n\
             quicway_retry_token_failures_total {}\n\
             # HELP quicway_connections_active Current live connections\n\
             # TYPE quicway_connections_active gauge\n\
             quicway_connections_active {}\n\
             # HELP quicway_connections_created_total Connections accepted\n\
             # TYPE quicway_connections_created_total counter\n\
             quicway_connections_created_total {}\n\
             # HELP quicway_packets_dropped_total Datagrams dropped, all reasons\n\
             # TYPE quicway_packets_dropped_total counter\n\
             quicway_packets_dropped_total {}\n",
            uptime,
            self.packets_received.get(),
            self.packets_sent.get(),
            self.version_negotiations_sent.get(),
            self.retries_sent.get(),
            self.tokens_validated.get(),
            self.token_failures.get(),
            self.connections_active.get(),
            self.connections_created.get(),
            self.dropped_total(),
        )
    }
}

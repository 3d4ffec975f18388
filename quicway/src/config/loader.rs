//! Configuration loading.
//!
//! Sources overlay in increasing precedence: built-in defaults, then the
//! TOML file, then `QUICWAY_*` environment variables, then command-line
//! flags. Every recognized environment override lives in one table so the
//! list stays auditable in a single place.

use anyhow::{Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use std::path::Path;

use super::ServerConfig;

/// quicway server command line.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// TOML configuration file to load.
    #[arg(long, short = 'c', default_value = "quicway.toml")]
    pub config: String,

    /// Override the bind host from the configuration.
    #[arg(long)]
    pub host: Option<String>,

    /// Override the bind port from the configuration.
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Check the configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,

    /// Write the built-in defaults as TOML to stdout and exit.
    #[arg(long)]
    pub print_default_config: bool,
}

impl CliArgs {
    fn overlay(&self, cfg: &mut ServerConfig) {
        if let Some(host) = &self.host {
            cfg.server.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(level) = &self.log_level {
            cfg.logging.level = level.clone();
        }
    }
}

/// Recognized environment overrides, keyed by their dotted config path.
/// The variable name follows from the path: `server.host` reads
/// `QUICWAY_SERVER__HOST`, and so on.
const ENV_OVERRIDES: &[(&str, fn(&mut ServerConfig, String))] = &[
    ("server.host", |cfg, v| cfg.server.host = v),
    ("server.port", |cfg, v| {
        if let Ok(port) = v.parse() {
            cfg.server.port = port;
        }
    }),
    ("secrets.token_secret", |cfg, v| cfg.secrets.token_secret = v),
    ("secrets.connection_id_secret", |cfg, v| {
        cfg.secrets.connection_id_secret = v
    }),
    ("logging.level", |cfg, v| cfg.logging.level = v),
];

/// Assemble the server configuration from all sources and validate it.
///
/// `--validate` and `--print-default-config` short-circuit the process
/// before anything binds; validation failures exit non-zero the same way.
pub fn load_config() -> Result<ServerConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        let rendered = toml::to_string_pretty(&ServerConfig::default())
            .context("rendering default configuration")?;
        println!("{rendered}");
        std::process::exit(0);
    }

    let mut cfg = read_config_file(Path::new(&cli.config))?;
    overlay_env(&mut cfg)?;
    cli.overlay(&mut cfg);

    if let Err(problems) = cfg.validate() {
        anyhow::bail!("invalid configuration:\n  - {}", problems.join("\n  - "));
    }

    if cli.validate {
        println!("configuration ok: {}", cli.config);
        std::process::exit(0);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<ServerConfig> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "no configuration file, starting from defaults"
            );
            return Ok(ServerConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", path.display()));
        }
    };

    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn overlay_env(cfg: &mut ServerConfig) -> Result<()> {
    let env = ConfigLoader::builder()
        .add_source(config::Environment::with_prefix("QUICWAY").separator("__"))
        .build()
        .context("reading QUICWAY_* environment")?;

    for (key, apply) in ENV_OVERRIDES {
        if let Ok(value) = env.get_string(key) {
            apply(cfg, value);
        }
    }

    Ok(())
}

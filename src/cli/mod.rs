// ABOUTME: CLI argument parsing for the mongoproxy binary
//
// Flags override values read from the config file, which override defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use crate::config::ProxyConfig;

/// Connection-multiplexing proxy for MongoDB
#[derive(Parser, Debug)]
#[command(name = "mongoproxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (TOML). Defaults to the user config dir if present.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to accept clients on
    #[arg(long)]
    pub listen: Option<String>,

    /// Backend address
    #[arg(long)]
    pub backend: Option<String>,

    /// Backend connections (0 means the maximum, 20000)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Requests buffered ahead of the worker pool
    #[arg(long)]
    pub queue_len: Option<usize>,

    /// Queue admission and backend read/write deadline, in milliseconds
    #[arg(long)]
    pub dispatcher_timeout_ms: Option<u64>,

    /// Per-request wait and shutdown drain bound, in milliseconds
    #[arg(long)]
    pub listener_timeout_ms: Option<u64>,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Resolve the effective configuration: file (explicit or default
    /// location), then flags on top.
    pub fn resolve_config(&self) -> Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load(path)?,
            None => match ProxyConfig::default_path() {
                Some(path) if path.exists() => ProxyConfig::load(&path)?,
                _ => ProxyConfig::default(),
            },
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut ProxyConfig) {
        if let Some(listen) = &self.listen {
            config.listen_addr.clone_from(listen);
        }
        if let Some(backend) = &self.backend {
            config.backend_addr.clone_from(backend);
        }
        if let Some(n) = self.max_connections {
            config.max_backend_connections = n;
        }
        if let Some(n) = self.queue_len {
            config.dispatch_queue_len = n;
        }
        if let Some(ms) = self.dispatcher_timeout_ms {
            config.dispatcher_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.listener_timeout_ms {
            config.listener_timeout = Duration::from_millis(ms);
        }
    }
}

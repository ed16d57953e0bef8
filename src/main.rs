// ABOUTME: Main entry point for mongoproxy
//
// Binary: mongoproxy
// Usage: mongoproxy [--config FILE] [--listen ADDR] [--backend ADDR] ...
// Serves until Ctrl-C, then drains client connections and stops the workers.

#![allow(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use mongoproxy::cli::Cli;
use mongoproxy::proxy::Proxy;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(args.log_json);
    setup_panic_handler();

    let config = args.resolve_config()?;
    let mut proxy = Proxy::new(config).context("Invalid proxy configuration")?;
    let addr = proxy.start().await.context("Failed to start proxy")?;
    info!(listen = %addr, "Ready");

    tokio::select! {
        result = proxy.serve() => {
            if let Err(e) = result {
                error!(error = %e, "Accept loop failed");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
        }
    }

    proxy.stop().await.context("Failed to stop proxy")?;
    Ok(())
}

fn setup_logging(json: bool) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mongoproxy=info".into());

    let (plain, json) = if json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_ansi(false),
            ),
        )
    } else {
        (Some(tracing_subscriber::fmt::layer().with_target(true)), None)
    };

    tracing_subscriber::registry()
        .with(plain)
        .with(json)
        .with(filter)
        .init();
}

fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Application panicked: {}", panic_info);
        default_hook(panic_info);
    }));
}

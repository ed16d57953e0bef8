// ABOUTME: Proxy core: framing, bounded dispatch to a backend worker pool, client listener
// ABOUTME: Proxy ties a Dispatcher and a Listener to one validated configuration

//! Connection-multiplexing proxy for the MongoDB wire protocol.
//!
//! Many client connections are funneled onto a fixed pool of backend
//! connections. Frames are relayed without decoding their bodies.
//!
//! # Usage
//!
//! ```ignore
//! use mongoproxy::config::ProxyConfig;
//! use mongoproxy::proxy::Proxy;
//!
//! let mut proxy = Proxy::new(ProxyConfig::default())?;
//! let addr = proxy.start().await?;
//!
//! tokio::select! {
//!     result = proxy.serve() => result?,
//!     _ = tokio::signal::ctrl_c() => {}
//! }
//! proxy.stop().await?;
//! ```

pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod timeout;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::config::ProxyConfig;

pub use backoff::{call_with_backoff, BackoffPolicy};
pub use dispatcher::Dispatcher;
pub use error::{ProxyError, ProxyResult};
pub use listener::{Listener, ListenerState};
pub use message::{Completion, ConnectionId, DispatchMessage};
pub use metrics::{Counter, DispatchMetrics, Gauge, ListenerMetrics, ProxyMetrics};
pub use timeout::{is_timeout, timeout_in};
pub use wire::{MsgHeader, OpCode, WireConn, HEADER_LEN, MAX_MESSAGE_LEN};

/// A dispatcher and a listener sharing one configuration.
pub struct Proxy {
    config: ProxyConfig,
    dispatcher: Arc<Dispatcher>,
    listener: Option<Arc<Listener>>,
    metrics: ProxyMetrics,
}

impl Proxy {
    /// Validate `config` and build the proxy. Nothing is bound or dialed yet.
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let config = config.validate()?;
        let metrics = ProxyMetrics::default();
        let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&metrics.dispatch)));

        Ok(Self {
            config,
            dispatcher,
            listener: None,
            metrics,
        })
    }

    /// Start the worker pool, then bind the listen socket. Workers exist
    /// before the first client can connect.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&mut self) -> ProxyResult<SocketAddr> {
        if self.listener.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        self.dispatcher.start()?;
        let listener = Listener::bind(
            &self.config.listen_addr,
            Arc::clone(&self.dispatcher),
            self.config.listener_timeout,
            Arc::clone(&self.metrics.listener),
        )
        .await?;

        let addr = listener.local_addr();
        self.listener = Some(Arc::new(listener));
        info!(
            listen = %addr,
            backend = %self.config.backend_addr,
            "Proxy started"
        );
        Ok(addr)
    }

    /// Accept clients until [`Proxy::stop`] is called.
    pub async fn serve(&self) -> ProxyResult<()> {
        self.listener()?.serve().await
    }

    /// Stop accepting, drain client connections, then stop the workers.
    pub async fn stop(&self) -> ProxyResult<()> {
        self.listener()?.stop().await?;
        self.dispatcher.stop(self.config.dispatcher_timeout).await?;
        info!("Proxy stopped");
        Ok(())
    }

    /// Listener handle, available once started
    pub fn listener(&self) -> ProxyResult<&Arc<Listener>> {
        self.listener.as_ref().ok_or(ProxyError::NotRunning)
    }

    pub const fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub const fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }
}

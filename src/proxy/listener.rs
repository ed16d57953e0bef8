// ABOUTME: Client-facing accept loop and per-connection read loop
// ABOUTME: Turns each client request into a dispatch message and drains connections on stop

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::dispatcher::Dispatcher;
use super::error::{ProxyError, ProxyResult};
use super::message::{ConnectionId, DispatchMessage};
use super::metrics::ListenerMetrics;
use super::timeout::timeout_in;
use super::wire::WireConn;

/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Listener lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Socket bound, not yet accepting
    Idle,
    Running,
    /// Socket closed, draining live connections
    Stopping,
    Stopped,
}

/// Accepts client connections and feeds their requests to the dispatcher.
pub struct Listener {
    /// Taken by `serve`, dropped on stop to close the socket
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,

    /// Bound on each dispatch, each completion wait and the shutdown drain
    timeout: Duration,

    metrics: Arc<ListenerMetrics>,
    state: RwLock<ListenerState>,
    shutdown: CancellationToken,

    /// One task per live client connection
    connections: TaskTracker,
}

impl Listener {
    /// Bind the listen socket. Connections queue in the backlog until
    /// [`Listener::serve`] starts accepting.
    pub async fn bind(
        addr: &str,
        dispatcher: Arc<Dispatcher>,
        timeout: Duration,
        metrics: Arc<ListenerMetrics>,
    ) -> ProxyResult<Self> {
        let socket = TcpListener::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "Listener bound");

        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local_addr,
            dispatcher,
            timeout,
            metrics,
            state: RwLock::new(ListenerState::Idle),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }

    /// Run the accept loop until [`Listener::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if the loop is already running, or
    /// `NotRunning` if the listener was stopped.
    pub async fn serve(&self) -> ProxyResult<()> {
        let socket = {
            let mut state = self.state.write().expect("RwLock poisoned");
            match *state {
                ListenerState::Idle => {}
                ListenerState::Running => return Err(ProxyError::AlreadyRunning),
                ListenerState::Stopping | ListenerState::Stopped => {
                    return Err(ProxyError::NotRunning)
                }
            }
            *state = ListenerState::Running;
            self.socket.lock().expect("Mutex poisoned").take()
        };
        let Some(socket) = socket else {
            return Err(ProxyError::NotRunning);
        };

        info!(addr = %self.local_addr, "Accepting connections");

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        // Transient (e.g. fd exhaustion); keep listening
                        error!(error = %e, "Accept failed");
                        self.metrics.accept_errors.mark(1);
                        tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                    }
                },
            }
        }

        drop(socket);
        debug!(addr = %self.local_addr, "Listen socket closed");
        Ok(())
    }

    /// Close the listen socket and wait up to the listener timeout for live
    /// connections to finish. Connections still open after the timeout are
    /// left running and `stop` returns anyway.
    pub async fn stop(&self) -> ProxyResult<()> {
        {
            let mut state = self.state.write().expect("RwLock poisoned");
            match *state {
                ListenerState::Idle | ListenerState::Running => *state = ListenerState::Stopping,
                ListenerState::Stopping | ListenerState::Stopped => {
                    return Err(ProxyError::NotRunning)
                }
            }
        }

        info!(
            addr = %self.local_addr,
            connections = self.connections.len(),
            "Stopping listener"
        );
        self.shutdown.cancel();
        // Not yet serving: close the socket here
        drop(self.socket.lock().expect("Mutex poisoned").take());
        self.connections.close();

        let drained = timeout_in(
            async {
                self.connections.wait().await;
                Ok(())
            },
            self.timeout,
        )
        .await;
        match drained {
            Ok(()) => info!("All client connections drained"),
            Err(e) => warn!(
                error = %e,
                remaining = self.connections.len(),
                "Shutdown timeout elapsed with connections still open"
            ),
        }

        *self.state.write().expect("RwLock poisoned") = ListenerState::Stopped;
        Ok(())
    }

    /// Bound address, with the real port when 0 was requested
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        *self.state.read().expect("RwLock poisoned")
    }

    /// Client connections currently open
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Listener-side counters
    pub fn metrics(&self) -> &Arc<ListenerMetrics> {
        &self.metrics
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.metrics.connections_accepted.mark(1);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn_id = ConnectionId::new();
        debug!(conn = %conn_id, peer = %peer, "Client connected");

        let dispatcher = Arc::clone(&self.dispatcher);
        let metrics = Arc::clone(&self.metrics);
        let shutdown = self.shutdown.clone();
        let timeout = self.timeout;

        self.connections.spawn(async move {
            let conn = WireConn::new(stream);
            match read_loop(conn, conn_id, &dispatcher, timeout, &shutdown).await {
                Ok(()) => debug!(conn = %conn_id, peer = %peer, "Connection closed"),
                Err(ProxyError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(conn = %conn_id, peer = %peer, "Client disconnected");
                }
                Err(e) if e.is_timeout() => {
                    warn!(conn = %conn_id, peer = %peer, error = %e, "Request timed out, closing connection");
                }
                Err(e) => {
                    warn!(conn = %conn_id, peer = %peer, error = %e, "Closing connection");
                }
            }
            metrics.connections_dropped.mark(1);
        });
    }
}

/// Serve one client connection, one request at a time. The next header is
/// not read until the previous request has completed, which keeps requests
/// from a single connection in order.
///
/// Any error ends the loop; the connection is closed when dropped.
async fn read_loop(
    mut conn: WireConn,
    conn_id: ConnectionId,
    dispatcher: &Dispatcher,
    timeout: Duration,
    shutdown: &CancellationToken,
) -> ProxyResult<()> {
    loop {
        let header = tokio::select! {
            biased;
            () = shutdown.cancelled() => None,
            header = conn.read_header() => Some(header?),
        };
        let Some(header) = header else {
            conn.close().await?;
            return Ok(());
        };

        let (msg, completion) = DispatchMessage::new(conn_id, conn, header);
        dispatcher.dispatch(msg, timeout).await?;
        conn = completion.wait(timeout).await?;
    }
}

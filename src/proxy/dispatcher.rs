// ABOUTME: Bounded request queue and backend worker pool
// ABOUTME: Forwards client frames to backend connections and relays replies back

//! Dispatcher multiplexing client requests onto a fixed pool of backend
//! connections.
//!
//! # Architecture
//!
//! ```text
//!  read loops ──dispatch(msg, timeout)──▶ ┌────────────────────────┐
//!   (many)                                 │ bounded mpsc queue     │
//!                                          │ capacity = queue_len   │
//!                                          └───────────┬────────────┘
//!                                                      │ shared receiver
//!                           ┌──────────────────────────┼──────────────────────────┐
//!                           ▼                          ▼                          ▼
//!                      ┌─────────┐                ┌─────────┐                ┌─────────┐
//!                      │worker 0 │                │worker 1 │       ...      │worker N │
//!                      │ backend │                │ backend │                │ backend │
//!                      └─────────┘                └─────────┘                └─────────┘
//! ```
//!
//! At most `workers` requests are in flight against the backend, plus up to
//! `queue_len` waiting for a free worker. Each worker owns one backend
//! connection for as long as it stays healthy. After any error while serving
//! a message the connection may be mid-frame, so the worker drops it and
//! redials with exponential backoff. A worker whose dial budget runs out
//! exits and is counted in `workers_lost`.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use super::backoff::{call_with_backoff, BackoffPolicy};
use super::error::{ProxyError, ProxyResult};
use super::message::DispatchMessage;
use super::metrics::DispatchMetrics;
use super::timeout::timeout_in;
use super::wire::{MsgHeader, WireConn};
use crate::config::ProxyConfig;

type Queue<S> = Arc<Mutex<mpsc::Receiver<DispatchMessage<S>>>>;

/// Bounded queue plus a fixed pool of backend workers.
pub struct Dispatcher<S = TcpStream> {
    /// Backend address dialed by every worker
    target_addr: String,

    /// Worker count, one backend connection each
    num_workers: usize,

    /// Backend read/write deadline
    timeout: Duration,

    connect_retries: u32,
    connect_backoff: Duration,

    tx: mpsc::Sender<DispatchMessage<S>>,
    rx: Queue<S>,

    metrics: Arc<DispatchMetrics>,

    /// Cancelled by `stop`
    shutdown: CancellationToken,

    /// Worker tasks
    workers: TaskTracker,

    started: AtomicBool,
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a dispatcher from validated configuration. Nothing is dialed
    /// until [`Dispatcher::start`].
    pub fn new(config: &ProxyConfig, metrics: Arc<DispatchMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(config.dispatch_queue_len.max(1));

        Self {
            target_addr: config.backend_addr.clone(),
            num_workers: config.max_backend_connections,
            timeout: config.dispatcher_timeout,
            connect_retries: config.backend_connect_retries,
            connect_backoff: config.backend_connect_backoff,
            tx,
            rx: Arc::new(Mutex::new(rx)),
            metrics,
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Launch the worker pool. Each worker dials its backend connection in
    /// the background before serving the queue.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if called twice.
    pub fn start(&self) -> ProxyResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyRunning);
        }

        info!(
            backend = %self.target_addr,
            workers = self.num_workers,
            queue = self.tx.max_capacity(),
            "Starting dispatcher"
        );

        for id in 0..self.num_workers {
            let worker = Worker {
                id,
                target_addr: self.target_addr.clone(),
                timeout: self.timeout,
                connect_retries: self.connect_retries,
                connect_backoff: self.connect_backoff,
                queue: Arc::clone(&self.rx),
                metrics: Arc::clone(&self.metrics),
                shutdown: self.shutdown.clone(),
            };
            self.workers.spawn(worker.run());
        }

        Ok(())
    }

    /// Enqueue `msg`, waiting at most `timeout` for queue space.
    ///
    /// On timeout the message is dropped without reaching a worker, which
    /// closes its client connection.
    pub async fn dispatch(&self, msg: DispatchMessage<S>, timeout: Duration) -> ProxyResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(ProxyError::DispatcherClosed);
        }

        let result = timeout_in(
            async {
                self.tx
                    .send(msg)
                    .await
                    .map_err(|_| ProxyError::DispatcherClosed)
            },
            timeout,
        )
        .await;

        match &result {
            Ok(()) => self.metrics.messages_dispatched.mark(1),
            Err(e) if e.is_timeout() => self.metrics.dispatch_timeouts.mark(1),
            Err(_) => {}
        }
        result
    }

    /// Stop the workers, waiting up to `timeout` for in-flight requests.
    ///
    /// Requests still queued afterwards are failed with `DispatcherClosed`.
    pub async fn stop(&self, timeout: Duration) -> ProxyResult<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(ProxyError::NotRunning);
        }

        info!(backend = %self.target_addr, "Stopping dispatcher");
        self.shutdown.cancel();
        self.workers.close();

        let drained = timeout_in(
            async {
                self.workers.wait().await;
                Ok(())
            },
            timeout,
        )
        .await;
        if let Err(e) = drained {
            warn!(
                error = %e,
                remaining = self.workers.len(),
                "Workers still busy after stop timeout"
            );
            return Ok(());
        }

        let mut queue = self.rx.lock().await;
        queue.close();
        while let Ok(msg) = queue.try_recv() {
            msg.complete(Err(ProxyError::DispatcherClosed));
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Requests waiting in the queue
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Dispatcher-side counters
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }
}

/// One backend connection serving the shared queue
struct Worker<S> {
    id: usize,
    target_addr: String,
    timeout: Duration,
    connect_retries: u32,
    connect_backoff: Duration,
    queue: Queue<S>,
    metrics: Arc<DispatchMetrics>,
    shutdown: CancellationToken,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self) {
        self.metrics.workers_active.increment();

        loop {
            let mut backend = match self.connect().await {
                Ok(backend) => backend,
                Err(_) if self.shutdown.is_cancelled() => break,
                Err(e) => {
                    error!(
                        worker = self.id,
                        error = %e,
                        "Worker giving up, backend capacity reduced"
                    );
                    self.metrics.workers_lost.mark(1);
                    break;
                }
            };

            if !self.serve(&mut backend).await {
                break;
            }
            debug!(worker = self.id, "Backend connection discarded, redialing");
        }

        self.metrics.workers_active.decrement();
        debug!(worker = self.id, "Worker exited");
    }

    /// Dial the backend, retrying with exponential backoff.
    async fn connect(&self) -> ProxyResult<WireConn> {
        let mut policy = BackoffPolicy::exponential(self.connect_retries, self.connect_backoff);
        let addr = self.target_addr.as_str();
        let id = self.id;

        let dial = call_with_backoff(&mut policy, || async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => ControlFlow::Break(stream),
                Err(e) => {
                    warn!(worker = id, backend = %addr, error = %e, "Backend dial failed");
                    ControlFlow::Continue(())
                }
            }
        });

        let stream = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(ProxyError::NotRunning),
            stream = dial => stream,
        };

        let Some(stream) = stream else {
            return Err(ProxyError::BackendUnavailable {
                addr: self.target_addr.clone(),
                attempts: self.connect_retries.saturating_add(1),
            });
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(worker = self.id, error = %e, "Failed to set TCP_NODELAY");
        }
        self.metrics.backend_connects.mark(1);
        debug!(worker = self.id, backend = %self.target_addr, "Backend connected");

        Ok(WireConn::new(stream).with_read_write_timeout(self.timeout))
    }

    /// Serve queued messages until the backend connection must be discarded
    /// (returns true) or the dispatcher shuts down (returns false).
    async fn serve(&self, backend: &mut WireConn) -> bool {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => return false,
                    msg = queue.recv() => msg,
                }
            };
            let Some(mut msg) = next else {
                return false;
            };

            // Waiter timed out while this sat in the queue. The backend was
            // never touched, so the connection stays usable.
            if msg.is_abandoned() {
                self.metrics.messages_abandoned.mark(1);
                debug!(
                    worker = self.id,
                    conn = %msg.conn_id(),
                    request_id = msg.header().request_id,
                    "Skipping abandoned request"
                );
                msg.complete(Err(ProxyError::Abandoned));
                continue;
            }

            let result = self.forward(&mut msg, backend).await;
            let healthy = result.is_ok();
            if let Err(e) = &result {
                if matches!(e, ProxyError::Abandoned) {
                    self.metrics.messages_abandoned.mark(1);
                }
                self.metrics.message_errors.mark(1);
                warn!(
                    worker = self.id,
                    conn = %msg.conn_id(),
                    request_id = msg.header().request_id,
                    error = %e,
                    "Request failed"
                );
            }
            msg.complete(result);

            if !healthy {
                return true;
            }
        }
    }

    /// Forward one request and, when the opcode has one, relay its reply.
    /// Gives up with `Abandoned` as soon as the waiter stops waiting.
    async fn forward(&self, msg: &mut DispatchMessage<S>, backend: &mut WireConn) -> ProxyResult<()> {
        let DispatchMessage {
            conn: client,
            header,
            done,
            ..
        } = msg;
        let header = *header;

        // Client-side reads and writes share the backend deadline
        let saved = client.read_write_timeout();
        client.set_read_write_timeout(Some(self.timeout));
        let relayed = tokio::select! {
            relayed = relay(&header, client, backend) => relayed,
            () = done.closed() => Err(ProxyError::Abandoned),
        };
        client.set_read_write_timeout(saved);

        if let Some(reply) = relayed? {
            self.metrics.replies_relayed.mark(1);
            trace!(
                worker = self.id,
                request_id = header.request_id,
                response_to = reply.response_to,
                "Reply relayed"
            );
        }
        Ok(())
    }
}

async fn relay<S>(
    header: &MsgHeader,
    client: &mut WireConn<S>,
    backend: &mut WireConn,
) -> ProxyResult<Option<MsgHeader>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    backend.write_header(header).await?;
    backend.copy_n(client, header.body_len()).await?;

    if !header.expects_reply() {
        return Ok(None);
    }
    client.copy_response(backend).await.map(Some)
}

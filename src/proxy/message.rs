// ABOUTME: Per-request dispatch message and its one-shot completion signal
//
// The client connection travels with the message: the worker borrows it to
// read the request body and write the reply, then hands it back through the
// completion signal. If the waiter gave up, the connection is dropped there.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::error::{ProxyError, ProxyResult};
use super::timeout::timeout_in;
use super::wire::{MsgHeader, WireConn};

/// Identifier for one accepted client connection, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Outcome<S> = ProxyResult<WireConn<S>>;

/// One client request queued for a dispatcher worker.
pub struct DispatchMessage<S = TcpStream> {
    conn_id: ConnectionId,
    pub(super) conn: WireConn<S>,
    pub(super) header: MsgHeader,
    /// Closed once the waiter drops its [`Completion`]
    pub(super) done: oneshot::Sender<Outcome<S>>,
}

/// Waiting half of a [`DispatchMessage`]; resolves once the worker finishes.
pub struct Completion<S = TcpStream> {
    rx: oneshot::Receiver<Outcome<S>>,
}

impl<S> DispatchMessage<S> {
    /// Build a message for a request whose header was just read from `conn`.
    pub fn new(conn_id: ConnectionId, conn: WireConn<S>, header: MsgHeader) -> (Self, Completion<S>) {
        let (done, rx) = oneshot::channel();
        let msg = Self {
            conn_id,
            conn,
            header,
            done,
        };
        (msg, Completion { rx })
    }

    /// Client connection this request arrived on
    pub const fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Header of the request, already read off the client connection
    pub const fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// Whether the waiter has already given up on this request
    pub fn is_abandoned(&self) -> bool {
        self.done.is_closed()
    }

    /// Signal completion. On success the client connection is handed back to
    /// the waiter; on error it is closed here.
    pub fn complete(self, result: ProxyResult<()>) {
        let outcome = result.map(|()| self.conn);
        // Waiter already timed out; dropping the outcome closes the connection
        let _ = self.done.send(outcome);
    }
}

impl<S> Completion<S> {
    /// Wait up to `timeout` for the worker to finish this request.
    ///
    /// Returns the client connection so the read loop can continue with it.
    pub async fn wait(self, timeout: Duration) -> ProxyResult<WireConn<S>> {
        timeout_in(
            async move { self.rx.await.map_err(|_| ProxyError::DispatcherClosed)? },
            timeout,
        )
        .await
    }
}

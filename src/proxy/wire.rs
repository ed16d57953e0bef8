// ABOUTME: Wire-protocol framing: fixed 16-byte header codec and opaque body relay
//
// Frame layout (all fields little-endian int32):
//   offset 0  messageLength  total frame bytes, header included
//   offset 4  requestID
//   offset 8  responseTo
//   offset 12 opCode
// The body (messageLength - 16 bytes) is never decoded, only copied.

//! Framing primitives for moving MongoDB wire-protocol frames between
//! connections without decoding their payloads.
//!
//! [`WireConn`] wraps any async byte stream. Every operation applies the
//! connection's read/write timeout, when set, as a deadline on that single
//! operation.
//!
//! # Example
//!
//! ```ignore
//! let mut client = WireConn::new(client_stream);
//! let mut backend = WireConn::new(backend_stream);
//!
//! let header = client.read_header().await?;
//! backend.write_header(&header).await?;
//! backend.copy_n(&mut client, header.body_len()).await?;
//! if header.expects_reply() {
//!     client.copy_response(&mut backend).await?;
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::{ProxyError, ProxyResult};

/// Size of the fixed message header in bytes
pub const HEADER_LEN: usize = 16;

/// Largest frame the backend accepts (48 MB)
pub const MAX_MESSAGE_LEN: i32 = 48_000_000;

/// Operation carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Reply to a client request
    Reply,
    /// Generic message
    Message,
    /// Update document
    Update,
    /// Insert new document
    Insert,
    /// Formerly used for getByOID
    Reserved,
    /// Query a collection
    Query,
    /// Get more data from a query
    GetMore,
    /// Delete documents
    Delete,
    /// Client is done with a cursor
    KillCursors,
    /// Any opcode this proxy does not name; relayed unchanged
    Other(i32),
}

impl OpCode {
    /// Numeric code as it appears on the wire
    pub const fn code(self) -> i32 {
        match self {
            Self::Reply => 1,
            Self::Message => 1000,
            Self::Update => 2001,
            Self::Insert => 2002,
            Self::Reserved => 2003,
            Self::Query => 2004,
            Self::GetMore => 2005,
            Self::Delete => 2006,
            Self::KillCursors => 2007,
            Self::Other(code) => code,
        }
    }
}

impl From<i32> for OpCode {
    fn from(code: i32) -> Self {
        match code {
            1 => Self::Reply,
            1000 => Self::Message,
            2001 => Self::Update,
            2002 => Self::Insert,
            2003 => Self::Reserved,
            2004 => Self::Query,
            2005 => Self::GetMore,
            2006 => Self::Delete,
            2007 => Self::KillCursors,
            other => Self::Other(other),
        }
    }
}

impl From<OpCode> for i32 {
    fn from(op: OpCode) -> Self {
        op.code()
    }
}

/// The fixed-size header preceding every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total frame size, header included
    pub message_length: i32,
    /// Producer-assigned identifier, unique per connection
    pub request_id: i32,
    /// `request_id` of the request this frame answers (0 on requests)
    pub response_to: i32,
    /// Frame operation
    pub op_code: OpCode,
}

impl MsgHeader {
    /// Whether the backend answers a frame with this opcode.
    ///
    /// Update, insert and delete are fire-and-forget in this protocol
    /// version; every other opcode gets exactly one reply frame.
    pub const fn expects_reply(&self) -> bool {
        !matches!(
            self.op_code,
            OpCode::Insert | OpCode::Update | OpCode::Delete
        )
    }

    /// Number of body bytes following the header
    pub fn body_len(&self) -> u64 {
        u64::try_from(self.message_length)
            .unwrap_or(0)
            .saturating_sub(HEADER_LEN as u64)
    }

    /// Encode into wire bytes
    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        let mut b = [0u8; HEADER_LEN];
        b[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        b[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        b[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        b[12..16].copy_from_slice(&self.op_code.code().to_le_bytes());
        b
    }

    /// Decode from wire bytes. Does not validate the length field.
    pub fn from_wire(b: &[u8; HEADER_LEN]) -> Self {
        let field = |pos: usize| i32::from_le_bytes([b[pos], b[pos + 1], b[pos + 2], b[pos + 3]]);
        Self {
            message_length: field(0),
            request_id: field(4),
            response_to: field(8),
            op_code: OpCode::from(field(12)),
        }
    }

    /// Reject lengths that cannot describe a frame
    pub fn validate(&self) -> ProxyResult<()> {
        if self.message_length < HEADER_LEN as i32 || self.message_length > MAX_MESSAGE_LEN {
            return Err(ProxyError::InvalidMessageLength(self.message_length));
        }
        Ok(())
    }
}

/// Frame-level operations on top of a byte stream connection.
pub struct WireConn<S = TcpStream> {
    stream: S,
    /// Deadline applied to each individual operation, if set
    read_write_timeout: Option<Duration>,
}

impl<S> WireConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a connection with no read/write deadline
    pub const fn new(stream: S) -> Self {
        Self {
            stream,
            read_write_timeout: None,
        }
    }

    /// Apply `timeout` as a deadline to every subsequent operation
    #[must_use]
    pub const fn with_read_write_timeout(mut self, timeout: Duration) -> Self {
        self.read_write_timeout = Some(timeout);
        self
    }

    /// Current per-operation deadline
    pub const fn read_write_timeout(&self) -> Option<Duration> {
        self.read_write_timeout
    }

    /// Replace the per-operation deadline; `None` removes it
    pub fn set_read_write_timeout(&mut self, timeout: Option<Duration>) {
        self.read_write_timeout = timeout;
    }

    /// Read one header, looping over partial reads until 16 bytes arrive.
    pub async fn read_header(&mut self) -> ProxyResult<MsgHeader> {
        let mut b = [0u8; HEADER_LEN];
        with_deadline(self.read_write_timeout, self.stream.read_exact(&mut b)).await?;
        let header = MsgHeader::from_wire(&b);
        header.validate()?;
        Ok(header)
    }

    /// Encode and write one header.
    pub async fn write_header(&mut self, header: &MsgHeader) -> ProxyResult<()> {
        let b = header.to_wire();
        let written =
            with_deadline(self.read_write_timeout, write_fully(&mut self.stream, &b)).await?;
        if written != HEADER_LEN {
            return Err(ProxyError::ShortWrite {
                expected: HEADER_LEN as u64,
                written: written as u64,
            });
        }
        Ok(())
    }

    /// Copy exactly `n` bytes from `from` into this connection.
    pub async fn copy_n<R>(&mut self, from: &mut WireConn<R>, n: u64) -> ProxyResult<()>
    where
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let mut limited = (&mut from.stream).take(n);
        let written = with_deadline(self.read_write_timeout, async {
            let written = tokio::io::copy(&mut limited, &mut self.stream).await?;
            self.stream.flush().await?;
            Ok(written)
        })
        .await?;

        if written != n {
            return Err(ProxyError::ShortWrite {
                expected: n,
                written,
            });
        }
        Ok(())
    }

    /// Relay one complete frame from `from` into this connection without
    /// decoding its body. Returns the relayed header.
    pub async fn copy_response<R>(&mut self, from: &mut WireConn<R>) -> ProxyResult<MsgHeader>
    where
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let header = from.read_header().await?;
        self.write_header(&header).await?;
        self.copy_n(from, header.body_len()).await?;
        Ok(header)
    }

    /// Shut down the write side, flushing anything buffered
    pub async fn close(&mut self) -> ProxyResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Write all of `buf`, stopping early only if the stream accepts no more bytes.
async fn write_fully<S>(stream: &mut S, buf: &[u8]) -> std::io::Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < buf.len() {
        let n = stream.write(&buf[written..]).await?;
        if n == 0 {
            break;
        }
        written += n;
    }
    stream.flush().await?;
    Ok(written)
}

async fn with_deadline<T, F>(deadline: Option<Duration>, io: F) -> std::io::Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, io).await.unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("i/o deadline of {limit:?} exceeded"),
            ))
        }),
        None => io.await,
    }
}

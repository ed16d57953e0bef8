// ABOUTME: Shared fixtures for end-to-end proxy tests
//
// Provides:
// - FakeBackend: in-process TCP backend that records frames and answers
//   every frame expecting a reply, after a configurable delay
// - TestProxy: a started proxy serving on an ephemeral port
// - send_frame / read_frame: raw wire helpers for test clients

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use mongoproxy::config::ProxyConfig;
use mongoproxy::proxy::{MsgHeader, OpCode, Proxy, ProxyResult, HEADER_LEN};

/// Offset added to a request id to form the backend-assigned reply id
pub const REPLY_ID_OFFSET: i32 = 9000;

/// One frame as received by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MsgHeader,
    pub body: Vec<u8>,
}

/// Backend stand-in. Replies carry `response_to` = request id and a body of
/// `reply:` followed by the request body.
pub struct FakeBackend {
    pub addr: SocketAddr,
    frames: Arc<Mutex<Vec<Frame>>>,
}

impl FakeBackend {
    pub async fn spawn(delay: Duration) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let frames = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&frames);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = serve_backend_conn(stream, recorded, delay).await;
                });
            }
        });

        Ok(Self { addr, frames })
    }

    /// Frames received so far, in arrival order
    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    /// Wait until at least `n` frames have arrived
    pub async fn wait_for_frames(&self, n: usize) -> Result<()> {
        for _ in 0..300 {
            if self.frames.lock().unwrap().len() >= n {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        bail!("backend saw {} frames, expected {}", self.frames().len(), n)
    }
}

async fn serve_backend_conn(
    mut stream: TcpStream,
    frames: Arc<Mutex<Vec<Frame>>>,
    delay: Duration,
) -> Result<()> {
    loop {
        let frame = read_frame(&mut stream).await?;
        frames.lock().unwrap().push(frame.clone());

        if frame.header.expects_reply() {
            tokio::time::sleep(delay).await;
            let mut body = b"reply:".to_vec();
            body.extend_from_slice(&frame.body);
            let header = MsgHeader {
                message_length: (HEADER_LEN + body.len()) as i32,
                request_id: REPLY_ID_OFFSET + frame.header.request_id,
                response_to: frame.header.request_id,
                op_code: OpCode::Reply,
            };
            stream.write_all(&header.to_wire()).await?;
            stream.write_all(&body).await?;
        }
    }
}

/// Write one request frame
pub async fn send_frame(stream: &mut TcpStream, request_id: i32, op_code: OpCode, body: &[u8]) -> Result<()> {
    let header = MsgHeader {
        message_length: (HEADER_LEN + body.len()) as i32,
        request_id,
        response_to: 0,
        op_code,
    };
    stream.write_all(&header.to_wire()).await?;
    stream.write_all(body).await?;
    Ok(())
}

/// Read one complete frame
pub async fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).await?;
    let header = MsgHeader::from_wire(&raw);
    header.validate()?;

    let mut body = vec![0u8; header.body_len() as usize];
    stream.read_exact(&mut body).await?;
    Ok(Frame { header, body })
}

/// True once the peer has closed the connection without sending more data
pub async fn is_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf)).await,
        Ok(Ok(0) | Err(_))
    )
}

/// Config pointing at `backend`, listening on an ephemeral port
pub fn config_for(backend: &FakeBackend) -> ProxyConfig {
    ProxyConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        backend_addr: backend.addr.to_string(),
        max_backend_connections: 4,
        dispatch_queue_len: 16,
        dispatcher_timeout: Duration::from_secs(3),
        listener_timeout: Duration::from_secs(3),
        backend_connect_retries: 3,
        backend_connect_backoff: Duration::from_millis(10),
    }
}

/// A started proxy with its accept loop running in the background
pub struct TestProxy {
    pub proxy: Arc<Proxy>,
    pub addr: SocketAddr,
    pub serving: JoinHandle<ProxyResult<()>>,
}

impl TestProxy {
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        let mut proxy = Proxy::new(config)?;
        let addr = proxy.start().await?;
        let proxy = Arc::new(proxy);

        let serving = tokio::spawn({
            let proxy = Arc::clone(&proxy);
            async move { proxy.serve().await }
        });

        // Every worker holds a backend connection before clients arrive
        let workers = proxy.config().max_backend_connections as u64;
        for _ in 0..300 {
            if proxy.metrics().dispatch.backend_connects.count() >= workers {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Ok(Self { proxy, addr, serving })
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }
}

//! Wire plumbing: the peer transport trait, the TCP implementation, an
//! in-process loopback mesh, and the newline-delimited JSON server loop.
//!
//! Timeouts live inside the transport. Wrapping a transport call in an
//! outer timeout would cancel it mid-exchange and leave the persistent
//! connection desynchronized, so callers never race transport futures
//! against timers.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::node::Node;
use crate::proto::{HandshakeFrame, Request, Response, ServerId, SyncEvent};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How a node talks to one peer. Object safe so nodes can run over TCP in
/// production and over a loopback mesh in tests without generics leaking
/// through the whole stack.
pub trait PeerTransport: Send + Sync {
    /// Deliver one replicated event and wait for its ack.
    fn sync<'a>(
        &'a self,
        peer: &'a str,
        from: &'a str,
        event: &'a SyncEvent,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Exchange gossip frames; the reply is the callee's own frame.
    fn handshake<'a>(
        &'a self,
        peer: &'a str,
        frame: &'a HandshakeFrame,
    ) -> BoxFuture<'a, Result<HandshakeFrame, TransportError>>;
}

// ── TCP transport ───────────────────────────────────────────────────────────

struct PeerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

/// Lazy persistent connections, one per peer, JSON lines both ways. A
/// failed or timed-out exchange drops the connection; the next call
/// redials.
pub struct NetTransport {
    addrs: HashMap<ServerId, String>,
    conns: HashMap<ServerId, Mutex<Option<PeerConn>>>,
    connect_timeout: Duration,
    rpc_timeout: Duration,
}

impl NetTransport {
    pub fn new(
        addrs: HashMap<ServerId, String>,
        connect_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        let conns = addrs.keys().map(|id| (id.clone(), Mutex::new(None))).collect();
        Self {
            addrs,
            conns,
            connect_timeout,
            rpc_timeout,
        }
    }

    async fn rpc(&self, peer: &str, request: &Request) -> Result<Response, TransportError> {
        let slot = self
            .conns
            .get(peer)
            .ok_or_else(|| TransportError::Unreachable(format!("unknown peer {peer}")))?;
        let mut guard = slot.lock().await;
        if guard.is_none() {
            let addr = &self.addrs[peer];
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::Timeout(format!("connect to {peer}")))??;
            stream.set_nodelay(true).ok();
            let (read_half, write_half) = stream.into_split();
            *guard = Some(PeerConn {
                reader: BufReader::new(read_half),
                writer: write_half,
                line: String::new(),
            });
            tracing::debug!(peer = %peer, addr = %addr, "peer connection opened");
        }
        let conn = guard.as_mut().ok_or_else(|| {
            TransportError::Unreachable(format!("no connection to {peer}"))
        })?;
        match tokio::time::timeout(self.rpc_timeout, Self::exchange(conn, request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                // The stream may carry a half-written or half-read frame.
                *guard = None;
                Err(TransportError::Timeout(format!("rpc to {peer}")))
            }
        }
    }

    async fn exchange(conn: &mut PeerConn, request: &Request) -> Result<Response, TransportError> {
        let mut frame = serde_json::to_string(request)?;
        frame.push('\n');
        conn.writer.write_all(frame.as_bytes()).await?;
        conn.line.clear();
        let n = conn.reader.read_line(&mut conn.line).await?;
        if n == 0 {
            return Err(TransportError::Unreachable("peer closed connection".into()));
        }
        Ok(serde_json::from_str(conn.line.trim())?)
    }
}

impl PeerTransport for NetTransport {
    fn sync<'a>(
        &'a self,
        peer: &'a str,
        from: &'a str,
        event: &'a SyncEvent,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let request = Request::Sync {
                from: from.to_string(),
                event: event.clone(),
            };
            match self.rpc(peer, &request).await? {
                Response::SyncAck { origin, send_ts }
                    if origin == event.origin && send_ts == event.send_ts =>
                {
                    Ok(())
                }
                Response::Error { detail } => Err(TransportError::Rejected(detail)),
                other => Err(TransportError::Rejected(format!(
                    "unexpected sync reply: {other:?}"
                ))),
            }
        })
    }

    fn handshake<'a>(
        &'a self,
        peer: &'a str,
        frame: &'a HandshakeFrame,
    ) -> BoxFuture<'a, Result<HandshakeFrame, TransportError>> {
        Box::pin(async move {
            let request = Request::Handshake { frame: frame.clone() };
            match self.rpc(peer, &request).await? {
                Response::HandshakeAck { frame } => Ok(frame),
                Response::Error { detail } => Err(TransportError::Rejected(detail)),
                other => Err(TransportError::Rejected(format!(
                    "unexpected handshake reply: {other:?}"
                ))),
            }
        })
    }
}

// ── Loopback mesh ───────────────────────────────────────────────────────────

/// In-process transport connecting [`Node`]s directly. Links can be cut
/// per direction, which is how the tests stage partitions and partial
/// meshes.
#[derive(Default)]
pub struct LoopbackMesh {
    nodes: parking_lot::RwLock<HashMap<ServerId, Arc<Node>>>,
    blocked: parking_lot::RwLock<HashSet<(ServerId, ServerId)>>,
}

impl LoopbackMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, id: &str, node: Arc<Node>) {
        self.nodes.write().insert(id.to_string(), node);
    }

    /// Cut the directed link `from → to`.
    pub fn block(&self, from: &str, to: &str) {
        self.blocked
            .write()
            .insert((from.to_string(), to.to_string()));
    }

    /// Cut both directions between two servers.
    pub fn block_between(&self, a: &str, b: &str) {
        self.block(a, b);
        self.block(b, a);
    }

    pub fn unblock_between(&self, a: &str, b: &str) {
        let mut blocked = self.blocked.write();
        blocked.remove(&(a.to_string(), b.to_string()));
        blocked.remove(&(b.to_string(), a.to_string()));
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<Node>, TransportError> {
        if self
            .blocked
            .read()
            .contains(&(from.to_string(), to.to_string()))
        {
            return Err(TransportError::Unreachable(format!(
                "link {from} -> {to} is blocked"
            )));
        }
        self.nodes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(format!("no node {to}")))
    }
}

impl PeerTransport for LoopbackMesh {
    fn sync<'a>(
        &'a self,
        peer: &'a str,
        from: &'a str,
        event: &'a SyncEvent,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let node = self.route(from, peer)?;
            node.apply_sync(from, event)
                .map_err(|e| TransportError::Rejected(e.to_string()))?;
            Ok(())
        })
    }

    fn handshake<'a>(
        &'a self,
        peer: &'a str,
        frame: &'a HandshakeFrame,
    ) -> BoxFuture<'a, Result<HandshakeFrame, TransportError>> {
        Box::pin(async move {
            let node = self.route(&frame.from, peer)?;
            node.apply_handshake(frame)
                .map_err(|e| TransportError::Rejected(e.to_string()))
        })
    }
}

// ── Server loop ─────────────────────────────────────────────────────────────

/// Accept loop: one task per connection, client and peer frames on the
/// same port.
pub async fn serve(node: Arc<Node>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            stream.set_nodelay(true).ok();
            if let Err(e) = handle_connection(node, stream, addr.to_string()).await {
                tracing::debug!(addr = %addr, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(
    node: Arc<Node>,
    stream: TcpStream,
    addr: String,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));
    let session_id = node.open_session(&addr);
    tracing::debug!(addr = %addr, session = session_id, "connection opened");
    let result = connection_loop(&node, session_id, &mut reader, &writer).await;
    node.close_session(session_id);
    tracing::debug!(addr = %addr, session = session_id, "connection closed");
    result
}

async fn connection_loop(
    node: &Arc<Node>,
    session_id: u64,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
) -> std::io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                let response = Response::Error {
                    detail: format!("unreadable frame: {e}"),
                };
                write_response(writer, &response).await?;
                continue;
            }
        };
        let response = match request {
            // Subscriptions push frames from their own task so the read
            // loop stays free for further requests.
            Request::Subscribe { cursor } => match node.subscribe_session(session_id, cursor) {
                Ok(mut subscription) => {
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        while let Some((cursor, deltas)) = subscription.next().await {
                            let frame = Response::Deltas { cursor, deltas };
                            if write_response(&writer, &frame).await.is_err() {
                                break;
                            }
                        }
                    });
                    Response::Ok
                }
                Err(response) => response,
            },
            other => node.handle_request(session_id, other),
        };
        write_response(writer, &response).await?;
    }
}

async fn write_response(
    writer: &Mutex<OwnedWriteHalf>,
    response: &Response,
) -> std::io::Result<()> {
    let mut frame = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    frame.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&frame).await
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("peer rejected request: {0}")]
    Rejected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

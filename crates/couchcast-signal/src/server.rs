//! The TCP accept loop, WebSocket handshake, and per-connection plumbing.
//!
//! One listener serves two things on the same port:
//!
//! - Requests carrying `Upgrade: websocket` complete the RFC6455 opening
//!   handshake and enter the framing loop.
//! - Any other `GET` receives a one-shot JSON status document (liveness plus
//!   the live session count) and the connection closes.
//!
//! Each accepted socket gets a reader loop on the accept task and a dedicated
//! writer task fed by an mpsc channel, so a slow consumer never blocks
//! registry dispatch. All registry access goes through one shared
//! `tokio::sync::Mutex` — the registry itself is pure and single-owner.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use couchcast_core::protocol::frame::{
    accept_key, decode_frame, encode_frame, Frame, FrameDecode, Opcode,
};
use couchcast_core::protocol::messages::{ClientMessage, ServerMessage};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SignalConfig;
use crate::registry::{ConnectionId, Directives, SessionRegistry};

/// Upper bound on the HTTP request head. Anything larger is not a handshake.
const MAX_REQUEST_HEAD: usize = 8 * 1024;
/// Accept timeout so the loop can observe the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Frames queued for one connection's writer task.
enum Outbound {
    Message(ServerMessage),
    Pong(Vec<u8>),
    Close,
}

/// Registry plus the writer handle for every live connection.
struct ServerState {
    registry: SessionRegistry,
    senders: HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
}

impl ServerState {
    fn deliver(&self, directives: Directives) {
        for (conn, msg) in directives {
            match self.senders.get(&conn) {
                Some(tx) => {
                    let _ = tx.send(Outbound::Message(msg));
                }
                None => debug!("directive for departed connection {conn}; dropped"),
            }
        }
    }
}

type SharedState = Arc<Mutex<ServerState>>;

/// A bound signaling server, not yet serving.
///
/// Binding is split from running so callers (and tests) can bind port 0 and
/// read back the assigned address before the accept loop starts.
pub struct SignalServer {
    listener: TcpListener,
    config: SignalConfig,
    state: SharedState,
}

impl SignalServer {
    pub async fn bind(config: SignalConfig) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self {
            listener,
            config,
            state: Arc::new(Mutex::new(ServerState {
                registry: SessionRegistry::new(),
                senders: HashMap::new(),
            })),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `running` is cleared. Also drives the idle-session sweep.
    pub async fn run(self, running: Arc<AtomicBool>) {
        let SignalServer {
            listener,
            config,
            state,
        } = self;

        // Idle-session garbage collection.
        let sweep_state = Arc::clone(&state);
        let ttl = config.session_ttl();
        let sweep_every = config.sweep_interval();
        let sweep_running = Arc::clone(&running);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            interval.tick().await;
            while sweep_running.load(Ordering::Relaxed) {
                interval.tick().await;
                let mut state = sweep_state.lock().await;
                let directives = state.registry.sweep_idle(ttl);
                state.deliver(directives);
            }
        });

        info!("signaling server listening");
        while running.load(Ordering::Relaxed) {
            let accepted = tokio::time::timeout(ACCEPT_POLL, listener.accept()).await;
            let (stream, peer) = match accepted {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    warn!("accept failed: {e}");
                    continue;
                }
                // Timeout: re-check the shutdown flag.
                Err(_) => continue,
            };

            debug!("connection from {peer}");
            let state = Arc::clone(&state);
            let name = config.server.name.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, state, &name).await {
                    debug!("connection {peer} ended with error: {e}");
                }
            });
        }
        info!("signaling server stopped");
    }
}

/// Binds and serves in one call.
pub async fn run_server(config: SignalConfig, running: Arc<AtomicBool>) -> Result<(), ServerError> {
    let server = SignalServer::bind(config).await?;
    if let Ok(addr) = server.local_addr() {
        info!("bound {addr}");
    }
    server.run(running).await;
    Ok(())
}

// ── Connection handling ───────────────────────────────────────────────────────

/// Minimal parsed view of an HTTP request head.
struct RequestHead {
    is_get: bool,
    headers: HashMap<String, String>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    fn wants_websocket(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade && connection
    }
}

fn parse_request_head(head: &str) -> Option<RequestHead> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let is_get = request_line.starts_with("GET ");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    Some(RequestHead { is_get, headers })
}

async fn handle_connection(
    mut stream: TcpStream,
    state: SharedState,
    server_name: &str,
) -> std::io::Result<()> {
    // Read until the blank line ending the request head. Whatever arrives
    // after it (the first WebSocket frames, for an eager client) is kept.
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_REQUEST_HEAD {
            debug!("request head exceeded {MAX_REQUEST_HEAD} bytes; dropping");
            return Ok(());
        }
    };

    let head_text = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let Some(head) = parse_request_head(&head_text) else {
        return Ok(());
    };
    let leftover = buf.split_off(head_end + 4);

    if head.wants_websocket() {
        let Some(client_key) = head.header("sec-websocket-key") else {
            debug!("upgrade request without Sec-WebSocket-Key; dropping");
            return Ok(());
        };
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(client_key)
        );
        stream.write_all(response.as_bytes()).await?;
        serve_websocket(stream, leftover, state).await
    } else if head.is_get {
        let sessions = state.lock().await.registry.session_count();
        let body = serde_json::json!({
            "status": "ok",
            "name": server_name,
            "sessions": sessions,
        })
        .to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    } else {
        stream
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n")
            .await
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Runs one upgraded connection: registers a writer, decodes frames, feeds
/// the registry, and unbinds on close or error.
async fn serve_websocket(
    stream: TcpStream,
    leftover: Vec<u8>,
    state: SharedState,
) -> std::io::Result<()> {
    let conn_id: ConnectionId = Uuid::new_v4();
    let (mut read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::unbounded_channel();
    state.lock().await.senders.insert(conn_id, tx.clone());
    let writer = tokio::spawn(write_loop(write_half, rx));
    debug!("connection {conn_id} upgraded");

    // Stream reassembly: accumulate, slice complete frames off the front.
    let mut buf = leftover;
    let mut chunk = [0u8; 4096];
    'conn: loop {
        loop {
            match decode_frame(&buf) {
                FrameDecode::Frame { frame, consumed } => {
                    buf.drain(..consumed);
                    if !handle_frame(conn_id, frame, &tx, &state).await {
                        break 'conn;
                    }
                }
                FrameDecode::Incomplete => break,
                FrameDecode::Reject(reason) => {
                    warn!("connection {conn_id} violated framing: {reason}");
                    let _ = tx.send(Outbound::Close);
                    break 'conn;
                }
            }
        }

        match read_half.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("connection {conn_id} read error: {e}");
                break;
            }
        }
    }

    // Socket gone for any reason: identical semantics to leave-session.
    {
        let mut state = state.lock().await;
        state.senders.remove(&conn_id);
        let directives = state.registry.disconnect(conn_id);
        state.deliver(directives);
    }
    drop(tx);
    let _ = writer.await;
    debug!("connection {conn_id} closed");
    Ok(())
}

/// Processes one decoded frame. Returns `false` when the connection must end.
async fn handle_frame(
    conn_id: ConnectionId,
    frame: Frame,
    tx: &mpsc::UnboundedSender<Outbound>,
    state: &SharedState,
) -> bool {
    match frame.opcode {
        Opcode::Text => {
            match serde_json::from_slice::<ClientMessage>(&frame.payload) {
                Ok(msg) => {
                    let mut state = state.lock().await;
                    let directives = state.registry.handle(conn_id, msg);
                    state.deliver(directives);
                }
                // Malformed messages are logged and dropped, never fatal.
                Err(e) => warn!("connection {conn_id} sent malformed message: {e}"),
            }
            true
        }
        Opcode::Ping => {
            let _ = tx.send(Outbound::Pong(frame.payload));
            true
        }
        Opcode::Pong => true,
        Opcode::Close => {
            let _ = tx.send(Outbound::Close);
            false
        }
        Opcode::Binary | Opcode::Continuation => {
            debug!("connection {conn_id} sent non-text data frame; dropped");
            true
        }
    }
}

/// Drains the outbound queue onto the socket. Owns the write half.
async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let (opcode, payload) = match outbound {
            Outbound::Message(msg) => match serde_json::to_vec(&msg) {
                Ok(json) => (Opcode::Text, json),
                Err(e) => {
                    warn!("failed to serialize outbound message: {e}");
                    continue;
                }
            },
            Outbound::Pong(payload) => (Opcode::Pong, payload),
            Outbound::Close => {
                let _ = write_half.write_all(&encode_frame(Opcode::Close, &[])).await;
                break;
            }
        };
        if write_half
            .write_all(&encode_frame(opcode, &payload))
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_head_extracts_headers_case_insensitively() {
        let head = "GET /ws HTTP/1.1\r\nHost: example\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Key: abc==";
        let parsed = parse_request_head(head).unwrap();
        assert!(parsed.is_get);
        assert!(parsed.wants_websocket());
        assert_eq!(parsed.header("sec-websocket-key"), Some("abc=="));
    }

    #[test]
    fn test_plain_get_is_not_a_websocket_request() {
        let head = "GET / HTTP/1.1\r\nHost: example";
        let parsed = parse_request_head(head).unwrap();
        assert!(parsed.is_get);
        assert!(!parsed.wants_websocket());
    }

    #[test]
    fn test_upgrade_header_without_connection_upgrade_is_rejected() {
        let head = "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive";
        let parsed = parse_request_head(head).unwrap();
        assert!(!parsed.wants_websocket());
    }

    #[test]
    fn test_find_head_end_locates_blank_line() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nrest";
        let pos = find_head_end(buf).unwrap();
        assert_eq!(&buf[pos..pos + 4], b"\r\n\r\n");
        assert_eq!(&buf[pos + 4..], b"rest");
    }

    #[test]
    fn test_find_head_end_none_when_head_incomplete() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\nHost: x\r\n"), None);
    }
}

//! Client side of the signaling protocol.
//!
//! Raw TCP plus a hand-rolled RFC6455 client handshake — the same framing
//! the server speaks, from the other side: every outbound frame is masked
//! with fresh OS randomness, inbound frames arrive unmasked.
//!
//! Connecting retries with bounded exponential backoff; exhausting the
//! attempts is fatal and surfaces to the orchestrator, which reports it to
//! the UI rather than spinning forever against a dead rendezvous point.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use couchcast_core::protocol::frame::{
    decode_frame, encode_frame_masked, FrameDecode, Opcode,
};
use couchcast_core::protocol::messages::{ClientMessage, ServerMessage};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connection attempts before giving up.
const MAX_ATTEMPTS: u32 = 5;
/// First retry delay; doubles each attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Ceiling on any single retry delay.
const BACKOFF_CAP: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("could not reach signaling server after {MAX_ATTEMPTS} attempts: {last}")]
    RetriesExhausted { last: std::io::Error },
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("signaling connection is closed")]
    Closed,
}

enum Outbound {
    Message(ClientMessage),
    Pong(Vec<u8>),
    Close,
}

/// A connected signaling channel.
///
/// Messages from the server arrive on the receiver returned by
/// [`SignalingClient::connect`]; the channel closing means the connection
/// ended.
pub struct SignalingClient {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SignalingClient {
    /// Dials `addr`, retrying with backoff, and completes the handshake.
    pub async fn connect(
        addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), SignalingError> {
        let stream = dial_with_backoff(addr).await?;
        let (mut read_half, write_half) = handshake(stream, addr).await?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, out_rx));

        // Reader: reassemble frames, forward decoded messages, answer pings.
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            'conn: loop {
                loop {
                    match decode_frame(&buf) {
                        FrameDecode::Frame { frame, consumed } => {
                            buf.drain(..consumed);
                            match frame.opcode {
                                Opcode::Text => {
                                    match serde_json::from_slice::<ServerMessage>(&frame.payload) {
                                        Ok(msg) => {
                                            if event_tx.send(msg).is_err() {
                                                break 'conn;
                                            }
                                        }
                                        Err(e) => {
                                            warn!("malformed signaling message dropped: {e}")
                                        }
                                    }
                                }
                                Opcode::Ping => {
                                    let _ = pong_tx.send(Outbound::Pong(frame.payload));
                                }
                                Opcode::Close => break 'conn,
                                _ => {}
                            }
                        }
                        FrameDecode::Incomplete => break,
                        FrameDecode::Reject(reason) => {
                            warn!("signaling server framing violation: {reason}");
                            break 'conn;
                        }
                    }
                }
                match read_half.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("signaling read error: {e}");
                        break;
                    }
                }
            }
            // event_tx dropped here closes the consumer's stream.
        });

        Ok((Self { tx: out_tx }, event_rx))
    }

    /// Queues one message for the server.
    pub fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.tx
            .send(Outbound::Message(msg))
            .map_err(|_| SignalingError::Closed)
    }

    /// Sends a close frame and releases the socket. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

async fn dial_with_backoff(addr: &str) -> Result<TcpStream, SignalingError> {
    let mut delay = BACKOFF_BASE;
    let mut last_err: Option<std::io::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("signaling connect attempt {attempt}/{MAX_ATTEMPTS} failed: {e}");
                last_err = Some(e);
            }
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(BACKOFF_CAP);
        }
    }

    Err(SignalingError::RetriesExhausted {
        last: last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "no attempt recorded")
        }),
    })
}

/// Performs the client half of the opening handshake. Returns the split
/// stream with any bytes that trailed the response head already consumed
/// into the reader's buffer — the server may start framing immediately.
async fn handshake(
    mut stream: TcpStream,
    addr: &str,
) -> Result<(BufferedReader, OwnedWriteHalf), SignalingError> {
    let mut key_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut key_bytes);
    let key = BASE64.encode(key_bytes);

    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nSec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    let leftover = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(SignalingError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = head.windows(4).position(|w| w == b"\r\n\r\n") {
            break head.split_off(pos + 4);
        }
        if head.len() > 8 * 1024 {
            return Err(SignalingError::Handshake("oversized response head".to_string()));
        }
    };

    let head_text = String::from_utf8_lossy(&head);
    if !head_text.starts_with("HTTP/1.1 101") {
        let status = head_text.lines().next().unwrap_or("").to_string();
        return Err(SignalingError::Handshake(format!(
            "server refused upgrade: {status}"
        )));
    }

    let (read_half, write_half) = stream.into_split();
    Ok((
        BufferedReader {
            inner: read_half,
            leftover,
        },
        write_half,
    ))
}

/// Read half plus handshake leftovers.
struct BufferedReader {
    inner: tokio::net::tcp::OwnedReadHalf,
    leftover: Vec<u8>,
}

impl BufferedReader {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.drain(..n);
            return Ok(n);
        }
        self.inner.read(buf).await
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let (opcode, payload) = match outbound {
            Outbound::Message(msg) => match serde_json::to_vec(&msg) {
                Ok(json) => (Opcode::Text, json),
                Err(e) => {
                    warn!("failed to serialize signaling message: {e}");
                    continue;
                }
            },
            Outbound::Pong(payload) => (Opcode::Pong, payload),
            Outbound::Close => {
                let _ = write_half
                    .write_all(&encode_frame_masked(Opcode::Close, &[], fresh_mask()))
                    .await;
                break;
            }
        };
        let frame = encode_frame_masked(opcode, &payload, fresh_mask());
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

fn fresh_mask() -> [u8; 4] {
    let mut mask = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut mask);
    mask
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Hand-rolled RFC6455 WebSocket framing.
//!
//! The signaling service speaks the WebSocket wire format directly instead of
//! pulling in a WebSocket library. The codec is modelled as pure functions
//! over byte slices — `bytes → Frame | Incomplete | Reject` — so it can be
//! unit-tested without any socket, and callers own the stream-reassembly
//! loop: keep an accumulating buffer, call [`decode_frame`] repeatedly, and
//! drain `consumed` bytes from the front for every complete frame until
//! [`FrameDecode::Incomplete`] comes back.
//!
//! Frames whose length field uses the 64-bit extension (length code 127) are
//! rejected. That is a deliberate, permanent ceiling of the signaling
//! protocol: signaling payloads are small JSON documents, and a peer sending
//! a 64-bit-length frame is violating the protocol, so the connection is
//! closed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key in the RFC6455 opening handshake.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket frame opcodes used by the signaling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// A complete frame sliced from the front of a connection buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Why a frame was rejected. Rejection closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    /// Length code 127 (64-bit extension). Permanent protocol ceiling.
    #[error("frame requires 64-bit length encoding, which the protocol rejects")]
    FrameTooLarge,
    /// Opcode bits did not name a known frame type.
    #[error("unknown frame opcode: 0x{0:X}")]
    UnknownOpcode(u8),
}

/// Outcome of attempting to slice one frame from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecode {
    /// A complete frame; `consumed` bytes should be drained from the buffer.
    Frame { frame: Frame, consumed: usize },
    /// Not enough bytes yet; wait for the next chunk. Never an error.
    Incomplete,
    /// Protocol violation; the caller must close the connection.
    Reject(RejectReason),
}

/// Computes the `Sec-WebSocket-Accept` value for an opening handshake:
/// `base64(SHA1(client_key + fixed GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns [`FrameDecode::Incomplete`] whenever `buf` does not yet hold a
/// complete frame — the caller must never block waiting for more bytes
/// synchronously, it simply retries after the next chunk arrives.
pub fn decode_frame(buf: &[u8]) -> FrameDecode {
    if buf.len() < 2 {
        return FrameDecode::Incomplete;
    }

    let opcode_bits = buf[0] & 0x0F;
    let opcode = match Opcode::from_bits(opcode_bits) {
        Some(op) => op,
        None => return FrameDecode::Reject(RejectReason::UnknownOpcode(opcode_bits)),
    };

    // A close frame ends the connection; the payload (status code, reason)
    // is not used by the signaling protocol, and any trailing bytes in the
    // buffer die with the connection.
    if opcode == Opcode::Close {
        return FrameDecode::Frame {
            frame: Frame {
                opcode: Opcode::Close,
                payload: Vec::new(),
            },
            consumed: buf.len(),
        };
    }

    let masked = buf[1] & 0x80 != 0;
    let len_code = buf[1] & 0x7F;

    let (payload_len, mut offset) = match len_code {
        0..=125 => (len_code as usize, 2),
        126 => {
            if buf.len() < 4 {
                return FrameDecode::Incomplete;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        // 127 selects the 64-bit length extension, which is out of protocol.
        _ => return FrameDecode::Reject(RejectReason::FrameTooLarge),
    };

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return FrameDecode::Incomplete;
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return FrameDecode::Incomplete;
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    FrameDecode::Frame {
        frame: Frame { opcode, payload },
        consumed: offset + payload_len,
    }
}

/// Encodes a single unmasked frame (server → client direction).
///
/// FIN is always set: the signaling protocol never fragments messages.
/// Payloads ≤125 bytes use the direct length byte, 126–65535 the 16-bit
/// extension, and larger the 64-bit extension. (The encoder keeps the 64-bit
/// branch so status payloads of any size can be emitted; the *decoder* is
/// where the ceiling is enforced on inbound traffic.)
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.bits());
    push_length(&mut out, payload.len(), 0x00);
    out.extend_from_slice(payload);
    out
}

/// Encodes a single masked frame (client → server direction).
///
/// RFC6455 requires every client-originated frame to be masked; `mask` must
/// come from a secure random source.
pub fn encode_frame_masked(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode.bits());
    push_length(&mut out, payload.len(), 0x80);
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

fn push_length(out: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &[u8]) -> Frame {
        let encoded = encode_frame(Opcode::Binary, payload);
        match decode_frame(&encoded) {
            FrameDecode::Frame { frame, consumed } => {
                assert_eq!(consumed, encoded.len(), "whole frame must be consumed");
                frame
            }
            other => panic!("expected complete frame, got {other:?}"),
        }
    }

    #[test]
    fn test_accept_key_matches_rfc6455_example() {
        // The worked example from RFC6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let frame = round_trip(&[]);
        assert_eq!(frame.payload, Vec::<u8>::new());
    }

    #[test]
    fn test_round_trip_125_bytes_direct_length() {
        let payload = vec![0x5A; 125];
        let encoded = encode_frame(Opcode::Binary, &payload);
        assert_eq!(encoded[1], 125, "125 bytes must use the direct length byte");
        assert_eq!(round_trip(&payload).payload, payload);
    }

    #[test]
    fn test_round_trip_126_bytes_uses_16bit_extension() {
        let payload = vec![0xA5; 126];
        let encoded = encode_frame(Opcode::Binary, &payload);
        assert_eq!(encoded[1], 126);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 126);
        assert_eq!(round_trip(&payload).payload, payload);
    }

    #[test]
    fn test_round_trip_65535_bytes_upper_16bit_boundary() {
        let payload = vec![0x11; 65535];
        let encoded = encode_frame(Opcode::Binary, &payload);
        assert_eq!(encoded[1], 126);
        assert_eq!(round_trip(&payload).payload, payload);
    }

    #[test]
    fn test_65536_byte_frame_is_rejected_on_decode() {
        // The encoder emits the 64-bit extension; the decoder must refuse it.
        let payload = vec![0u8; 65536];
        let encoded = encode_frame(Opcode::Binary, &payload);
        assert_eq!(encoded[1], 127);
        assert_eq!(
            decode_frame(&encoded),
            FrameDecode::Reject(RejectReason::FrameTooLarge)
        );
    }

    #[test]
    fn test_masked_payload_is_unmasked_on_decode() {
        let mask = [0xDE, 0xAD, 0xBE, 0xEF];
        let encoded = encode_frame_masked(Opcode::Text, b"hello", mask);
        assert_eq!(encoded[1] & 0x80, 0x80, "mask bit must be set");
        match decode_frame(&encoded) {
            FrameDecode::Frame { frame, .. } => {
                assert_eq!(frame.opcode, Opcode::Text);
                assert_eq!(frame.payload, b"hello");
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_mask_cycles_over_four_bytes() {
        let mask = [1, 2, 3, 4];
        let payload = [10u8, 20, 30, 40, 50, 60];
        let encoded = encode_frame_masked(Opcode::Binary, &payload, mask);
        // Masked bytes on the wire differ from the plaintext.
        assert_ne!(&encoded[6..], &payload);
        match decode_frame(&encoded) {
            FrameDecode::Frame { frame, .. } => assert_eq!(frame.payload, payload),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_header_is_incomplete() {
        assert_eq!(decode_frame(&[]), FrameDecode::Incomplete);
        assert_eq!(decode_frame(&[0x82]), FrameDecode::Incomplete);
    }

    #[test]
    fn test_truncated_extended_length_is_incomplete() {
        // Length code 126 but only one extension byte present.
        assert_eq!(decode_frame(&[0x82, 126, 0x01]), FrameDecode::Incomplete);
    }

    #[test]
    fn test_truncated_payload_is_incomplete() {
        let mut encoded = encode_frame(Opcode::Binary, &[1, 2, 3, 4]);
        encoded.truncate(encoded.len() - 1);
        assert_eq!(decode_frame(&encoded), FrameDecode::Incomplete);
    }

    #[test]
    fn test_two_frames_back_to_back_decode_in_sequence() {
        let mut buf = encode_frame(Opcode::Text, b"first");
        buf.extend(encode_frame(Opcode::Text, b"second"));

        let consumed = match decode_frame(&buf) {
            FrameDecode::Frame { frame, consumed } => {
                assert_eq!(frame.payload, b"first");
                consumed
            }
            other => panic!("expected frame, got {other:?}"),
        };
        buf.drain(..consumed);
        match decode_frame(&buf) {
            FrameDecode::Frame { frame, .. } => assert_eq!(frame.payload, b"second"),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_close_opcode_yields_empty_close_frame() {
        // Close with a 2-byte status payload still surfaces as empty-close.
        let encoded = encode_frame(Opcode::Close, &[0x03, 0xE8]);
        match decode_frame(&encoded) {
            FrameDecode::Frame { frame, consumed } => {
                assert_eq!(frame.opcode, Opcode::Close);
                assert!(frame.payload.is_empty());
                assert_eq!(consumed, encoded.len());
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        assert_eq!(
            decode_frame(&[0x83, 0x00]),
            FrameDecode::Reject(RejectReason::UnknownOpcode(0x3))
        );
    }

    #[test]
    fn test_ping_round_trip() {
        let encoded = encode_frame(Opcode::Ping, b"ka");
        match decode_frame(&encoded) {
            FrameDecode::Frame { frame, .. } => {
                assert_eq!(frame.opcode, Opcode::Ping);
                assert_eq!(frame.payload, b"ka");
            }
            other => panic!("expected ping frame, got {other:?}"),
        }
    }
}

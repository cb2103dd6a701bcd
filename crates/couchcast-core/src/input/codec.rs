//! Binary codec for the real-time controller-input packet.
//!
//! Wire format (24 bytes, big-endian, fixed offsets):
//!
//! ```text
//! [buttons:u32][lx:i16][ly:i16][rx:i16][ry:i16][lt:u8][rt:u8][reserved:2][timestamp_ms:u64]
//!  0           4       6       8       10      12     13     14          16..24
//! ```
//!
//! The packet travels on an unreliable, unordered, zero-retransmit data
//! channel, so it must be self-contained and minimal: one packet per poll
//! tick, no framing, no sequence negotiation. Ordering is recovered at the
//! consumer by the drop-stale rule — a packet whose timestamp is not newer
//! than the last applied one is discarded, never applied.
//!
//! Stick axes are quantized to `i16` (value = round(axis × 32767)) and
//! triggers to `u8` (round(trigger × 255)). Inputs outside the legal range
//! are clamped on encode, so encoding never fails.

use thiserror::Error;

/// Exact size of an encoded input packet. Decode rejects anything else.
pub const PACKET_SIZE: usize = 24;

/// Gamepad button bitmask values for [`GamepadInputState::buttons`].
pub mod buttons {
    pub const A: u32 = 1 << 0;
    pub const B: u32 = 1 << 1;
    pub const X: u32 = 1 << 2;
    pub const Y: u32 = 1 << 3;
    pub const LEFT_BUMPER: u32 = 1 << 4;
    pub const RIGHT_BUMPER: u32 = 1 << 5;
    pub const BACK: u32 = 1 << 6;
    pub const START: u32 = 1 << 7;
    pub const LEFT_STICK: u32 = 1 << 8;
    pub const RIGHT_STICK: u32 = 1 << 9;
    pub const DPAD_UP: u32 = 1 << 10;
    pub const DPAD_DOWN: u32 = 1 << 11;
    pub const DPAD_LEFT: u32 = 1 << 12;
    pub const DPAD_RIGHT: u32 = 1 << 13;
    pub const GUIDE: u32 = 1 << 14;
}

/// Complete controller state at one poll tick.
///
/// Produced by the client-side input source every tick and consumed exactly
/// once by the host-side controller sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GamepadInputState {
    /// Pressed-button bitmask; see [`buttons`].
    pub buttons: u32,
    /// Stick axes, normalized to `[-1.0, 1.0]`.
    pub left_stick_x: f32,
    pub left_stick_y: f32,
    pub right_stick_x: f32,
    pub right_stick_y: f32,
    /// Analog triggers, normalized to `[0.0, 1.0]`.
    pub left_trigger: f32,
    pub right_trigger: f32,
    /// Monotonic clock, milliseconds. Drives the consumer's drop-stale rule.
    pub timestamp_ms: u64,
}

impl GamepadInputState {
    /// A neutral state: no buttons, centered sticks, released triggers.
    pub fn neutral(timestamp_ms: u64) -> Self {
        Self {
            buttons: 0,
            left_stick_x: 0.0,
            left_stick_y: 0.0,
            right_stick_x: 0.0,
            right_stick_y: 0.0,
            left_trigger: 0.0,
            right_trigger: 0.0,
            timestamp_ms,
        }
    }
}

/// Errors that can occur while decoding an input packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputCodecError {
    /// The buffer is not exactly [`PACKET_SIZE`] bytes.
    #[error("input packet must be exactly {PACKET_SIZE} bytes, got {0}")]
    WrongSize(usize),
}

/// Encodes a controller state into the fixed 24-byte packet.
pub fn encode_input(state: &GamepadInputState) -> [u8; PACKET_SIZE] {
    let mut buf = [0u8; PACKET_SIZE];
    buf[0..4].copy_from_slice(&state.buttons.to_be_bytes());
    buf[4..6].copy_from_slice(&quantize_axis(state.left_stick_x).to_be_bytes());
    buf[6..8].copy_from_slice(&quantize_axis(state.left_stick_y).to_be_bytes());
    buf[8..10].copy_from_slice(&quantize_axis(state.right_stick_x).to_be_bytes());
    buf[10..12].copy_from_slice(&quantize_axis(state.right_stick_y).to_be_bytes());
    buf[12] = quantize_trigger(state.left_trigger);
    buf[13] = quantize_trigger(state.right_trigger);
    // bytes 14..16 reserved, zero
    buf[16..24].copy_from_slice(&state.timestamp_ms.to_be_bytes());
    buf
}

/// Decodes a 24-byte packet back into a controller state.
///
/// # Errors
///
/// Returns [`InputCodecError::WrongSize`] for any buffer whose length is not
/// exactly [`PACKET_SIZE`]. Partial or concatenated packets are never valid:
/// the data channel delivers whole messages or nothing.
pub fn decode_input(buf: &[u8]) -> Result<GamepadInputState, InputCodecError> {
    if buf.len() != PACKET_SIZE {
        return Err(InputCodecError::WrongSize(buf.len()));
    }
    Ok(GamepadInputState {
        buttons: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        left_stick_x: dequantize_axis(i16::from_be_bytes([buf[4], buf[5]])),
        left_stick_y: dequantize_axis(i16::from_be_bytes([buf[6], buf[7]])),
        right_stick_x: dequantize_axis(i16::from_be_bytes([buf[8], buf[9]])),
        right_stick_y: dequantize_axis(i16::from_be_bytes([buf[10], buf[11]])),
        left_trigger: dequantize_trigger(buf[12]),
        right_trigger: dequantize_trigger(buf[13]),
        timestamp_ms: u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]),
    })
}

fn quantize_axis(v: f32) -> i16 {
    (v.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

fn dequantize_axis(v: i16) -> f32 {
    v as f32 / 32767.0
}

fn quantize_trigger(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn dequantize_trigger(v: u8) -> f32 {
    v as f32 / 255.0
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const AXIS_STEP: f32 = 1.0 / 32767.0;
    const TRIGGER_STEP: f32 = 1.0 / 255.0;

    fn sample_state() -> GamepadInputState {
        GamepadInputState {
            buttons: buttons::A | buttons::RIGHT_BUMPER | buttons::DPAD_LEFT,
            left_stick_x: -1.0,
            left_stick_y: 1.0,
            right_stick_x: 0.0,
            right_stick_y: 12000.0 / 32767.0,
            left_trigger: 0.0,
            right_trigger: 1.0,
            timestamp_ms: 1_234_567_890,
        }
    }

    #[test]
    fn test_packet_is_exactly_24_bytes() {
        let bytes = encode_input(&sample_state());
        assert_eq!(bytes.len(), PACKET_SIZE);
    }

    #[test]
    fn test_round_trip_exact_for_representable_values() {
        // Every field in this state survives quantization exactly.
        let state = sample_state();
        let decoded = decode_input(&encode_input(&state)).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_round_trip_within_one_quantization_step_for_arbitrary_values() {
        let state = GamepadInputState {
            buttons: 0,
            left_stick_x: 0.333,
            left_stick_y: -0.717,
            right_stick_x: 0.5,
            right_stick_y: -0.25,
            left_trigger: 0.1,
            right_trigger: 0.9,
            timestamp_ms: 42,
        };
        let decoded = decode_input(&encode_input(&state)).unwrap();
        for (got, want) in [
            (decoded.left_stick_x, state.left_stick_x),
            (decoded.left_stick_y, state.left_stick_y),
            (decoded.right_stick_x, state.right_stick_x),
            (decoded.right_stick_y, state.right_stick_y),
        ] {
            assert!((got - want).abs() <= AXIS_STEP, "axis {got} vs {want}");
        }
        assert!((decoded.left_trigger - state.left_trigger).abs() <= TRIGGER_STEP);
        assert!((decoded.right_trigger - state.right_trigger).abs() <= TRIGGER_STEP);
        assert_eq!(decoded.timestamp_ms, state.timestamp_ms);
    }

    #[test]
    fn test_re_encode_is_idempotent() {
        // Quantization settles after one pass: encode(decode(encode(s)))
        // must equal encode(s) byte for byte.
        let state = GamepadInputState {
            buttons: buttons::START,
            left_stick_x: 0.123,
            left_stick_y: 0.456,
            right_stick_x: -0.789,
            right_stick_y: 0.987,
            left_trigger: 0.321,
            right_trigger: 0.654,
            timestamp_ms: 99,
        };
        let first = encode_input(&state);
        let second = encode_input(&decode_input(&first).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let state = GamepadInputState {
            buttons: 0,
            left_stick_x: -5.0,
            left_stick_y: 5.0,
            right_stick_x: 0.0,
            right_stick_y: 0.0,
            left_trigger: -1.0,
            right_trigger: 2.0,
            timestamp_ms: 0,
        };
        let decoded = decode_input(&encode_input(&state)).unwrap();
        assert_eq!(decoded.left_stick_x, -1.0);
        assert_eq!(decoded.left_stick_y, 1.0);
        assert_eq!(decoded.left_trigger, 0.0);
        assert_eq!(decoded.right_trigger, 1.0);
    }

    #[test]
    fn test_field_offsets_are_fixed() {
        let state = GamepadInputState {
            buttons: 0xAABB_CCDD,
            left_stick_x: 1.0,
            ..GamepadInputState::neutral(0x0102_0304_0506_0708)
        };
        let bytes = encode_input(&state);
        assert_eq!(&bytes[0..4], &0xAABB_CCDDu32.to_be_bytes());
        assert_eq!(&bytes[4..6], &32767i16.to_be_bytes());
        assert_eq!(&bytes[14..16], &[0, 0], "reserved bytes stay zero");
        assert_eq!(&bytes[16..24], &0x0102_0304_0506_0708u64.to_be_bytes());
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert_eq!(decode_input(&[0u8; 23]), Err(InputCodecError::WrongSize(23)));
    }

    #[test]
    fn test_decode_rejects_long_buffer() {
        assert_eq!(decode_input(&[0u8; 25]), Err(InputCodecError::WrongSize(25)));
    }

    #[test]
    fn test_decode_rejects_empty_buffer() {
        assert_eq!(decode_input(&[]), Err(InputCodecError::WrongSize(0)));
    }

    #[test]
    fn test_timestamp_extremes_round_trip() {
        for ts in [0u64, 1, u64::MAX] {
            let state = GamepadInputState::neutral(ts);
            assert_eq!(decode_input(&encode_input(&state)).unwrap().timestamp_ms, ts);
        }
    }
}

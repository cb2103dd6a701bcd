//! Controller input: the fixed-size binary packet and button bitmask.

pub mod codec;

pub use codec::{decode_input, encode_input, GamepadInputState, InputCodecError, PACKET_SIZE};

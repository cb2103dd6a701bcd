//! Signaling wire protocol: JSON message schema and RFC6455 framing.
//!
//! The signaling stream is UTF-8 JSON inside WebSocket text frames. Both
//! halves are defined here: [`messages`] is the schema, [`frame`] is the
//! framing. Neither module touches a socket.

pub mod frame;
pub mod messages;

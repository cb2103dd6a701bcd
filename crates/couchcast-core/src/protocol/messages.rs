//! JSON message types for the signaling protocol.
//!
//! Every message is a JSON object with a `"type"` field that identifies the
//! variant; all other fields sit in the same object. For example:
//!
//! ```json
//! {"type":"create-session","sessionCode":"ABC123","hostId":"h1"}
//! {"type":"session-joined","data":{"hostId":"h1"}}
//! ```
//!
//! Serde's `#[serde(tag = "type")]` attribute handles the discriminant.
//!
//! # Why two enums?
//!
//! The two directions carry different information: peers *send* session
//! commands, the server *sends* session outcomes and routed signals. Using
//! distinct enums makes it a compile-time error to route a server-only
//! message back toward the server. Anything that does not match a known tag
//! fails deserialization at the wire boundary; the server logs and drops it
//! rather than passing unknown payloads through.

use serde::{Deserialize, Serialize};

// ── Peer → Server messages ────────────────────────────────────────────────────

/// All messages a peer can send to the signaling server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Host registers a new session under a shareable code.
    #[serde(rename_all = "camelCase")]
    CreateSession {
        session_code: String,
        host_id: String,
    },

    /// Client asks to join an existing session by code.
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_code: String,
        client_id: String,
    },

    /// Opaque negotiation payload (SDP offer/answer, ICE candidate) relayed
    /// through the server.
    ///
    /// With `to` set the message is unicast to that peer id; without it the
    /// server broadcasts to every other member of the session.
    #[serde(rename_all = "camelCase")]
    Signal {
        session_code: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        payload: serde_json::Value,
    },

    /// Peer leaves its session explicitly. Socket close/error has identical
    /// server-side semantics.
    #[serde(rename_all = "camelCase")]
    LeaveSession { session_code: String },
}

// ── Server → Peer messages ────────────────────────────────────────────────────

/// Payload of `session-joined`: identifies the session's host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionJoinedData {
    pub host_id: String,
}

/// Payload of `peer-joined` / `peer-left`: identifies the affected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerData {
    pub peer_id: String,
}

/// All messages the signaling server can send to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The host's `create-session` succeeded.
    SessionCreated,

    /// The client's `join-session` succeeded; carries the host id the client
    /// needs to address its answer and candidates.
    SessionJoined { data: SessionJoinedData },

    /// `join-session` named a code with no active session.
    SessionNotFound,

    /// Recoverable failure reported only to the requester (e.g. a session
    /// code collision). The existing session is untouched.
    Error { message: String },

    /// A client joined the recipient's session.
    PeerJoined { data: PeerData },

    /// A client left the recipient's session.
    PeerLeft { data: PeerData },

    /// The host left; the session is gone and members should tear down.
    HostLeft,

    /// A relayed negotiation payload from another peer.
    #[serde(rename_all = "camelCase")]
    Signal {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        payload: serde_json::Value,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

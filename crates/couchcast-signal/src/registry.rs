//! The session registry and message routing.
//!
//! Everything in this module is pure state manipulation: handlers take a
//! connection id and a decoded [`ClientMessage`] and return *routing
//! directives* — `(ConnectionId, ServerMessage)` pairs the socket layer then
//! delivers. That split keeps every protocol rule unit-testable without a
//! network harness, and it keeps all registry mutation behind one owner (the
//! server wraps the registry in a single `tokio::sync::Mutex`).
//!
//! Per-connection state machine:
//!
//! ```text
//! unbound ──create-session──► host ───┐
//! unbound ──join-session────► client ─┴── leave-session | close | error ──► unbound
//! ```
//!
//! Socket close/error is handled by [`SessionRegistry::disconnect`], which
//! has *identical* semantics to an explicit `leave-session`.
//!
//! A binding is exclusive: a bound connection issuing another
//! `create-session` or `join-session` implicitly leaves its current session
//! first, so the old session's members are notified rather than left
//! waiting for the TTL sweep.

use std::collections::HashMap;
use std::time::Instant;

use couchcast_core::protocol::messages::{
    ClientMessage, PeerData, ServerMessage, SessionJoinedData,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one accepted socket for the lifetime of the process.
pub type ConnectionId = Uuid;

/// Messages to deliver, addressed by connection.
pub type Directives = Vec<(ConnectionId, ServerMessage)>;

/// A client bound into a session.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub connection_id: ConnectionId,
    pub joined_at: Instant,
}

/// One active session: a host and any number of clients, keyed by code.
#[derive(Debug)]
pub struct Session {
    pub code: String,
    pub host_id: String,
    pub host_connection_id: ConnectionId,
    pub clients: HashMap<String, ClientEntry>,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    /// Every connection currently bound to this session.
    fn member_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        std::iter::once(self.host_connection_id)
            .chain(self.clients.values().map(|c| c.connection_id))
    }
}

/// What a connection is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Host { code: String },
    Client { code: String, client_id: String },
}

/// In-memory registry of all active sessions and connection bindings.
///
/// At most one host per code; codes are unique among active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    bindings: HashMap<ConnectionId, Binding>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, code: &str) -> Option<&Session> {
        self.sessions.get(code)
    }

    /// Dispatches one inbound message and returns the directives to deliver.
    pub fn handle(&mut self, conn: ConnectionId, msg: ClientMessage) -> Directives {
        match msg {
            ClientMessage::CreateSession {
                session_code,
                host_id,
            } => self.create_session(conn, session_code, host_id),
            ClientMessage::JoinSession {
                session_code,
                client_id,
            } => self.join_session(conn, session_code, client_id),
            ClientMessage::Signal {
                session_code,
                to,
                from,
                payload,
            } => self.route_signal(conn, &session_code, to, from, payload),
            ClientMessage::LeaveSession { .. } => self.disconnect(conn),
        }
    }

    /// Registers a new session. A code collision is reported only to the
    /// requester; the existing session is untouched.
    fn create_session(
        &mut self,
        conn: ConnectionId,
        code: String,
        host_id: String,
    ) -> Directives {
        if self.sessions.contains_key(&code) {
            warn!("create-session collision on code {code}");
            return vec![(
                conn,
                ServerMessage::Error {
                    message: format!("session code {code} is already in use"),
                },
            )];
        }

        // Still bound from an earlier create/join: leave that session first.
        let mut directives = self.disconnect(conn);

        let now = Instant::now();
        self.sessions.insert(
            code.clone(),
            Session {
                code: code.clone(),
                host_id,
                host_connection_id: conn,
                clients: HashMap::new(),
                created_at: now,
                last_activity: now,
            },
        );
        self.bindings.insert(conn, Binding::Host { code });
        directives.push((conn, ServerMessage::SessionCreated));
        directives
    }

    /// Binds a client into an existing session and introduces it to the host.
    fn join_session(
        &mut self,
        conn: ConnectionId,
        code: String,
        client_id: String,
    ) -> Directives {
        if !self.sessions.contains_key(&code) {
            debug!("join-session for unknown code {code}");
            return vec![(conn, ServerMessage::SessionNotFound)];
        }

        // Same exclusive-binding rule as create-session.
        let mut directives = self.disconnect(conn);
        let Some(session) = self.sessions.get_mut(&code) else {
            // The prior binding hosted this very session; it is gone now.
            directives.push((conn, ServerMessage::SessionNotFound));
            return directives;
        };

        session.last_activity = Instant::now();
        session.clients.insert(
            client_id.clone(),
            ClientEntry {
                connection_id: conn,
                joined_at: Instant::now(),
            },
        );
        let host_conn = session.host_connection_id;
        let host_id = session.host_id.clone();
        self.bindings.insert(
            conn,
            Binding::Client {
                code,
                client_id: client_id.clone(),
            },
        );

        directives.extend([
            (
                conn,
                ServerMessage::SessionJoined {
                    data: SessionJoinedData { host_id },
                },
            ),
            (
                host_conn,
                ServerMessage::PeerJoined {
                    data: PeerData { peer_id: client_id },
                },
            ),
        ]);
        directives
    }

    /// Routes a `signal`: unicast when `to` names a peer, otherwise a
    /// broadcast to every session member except the sender.
    fn route_signal(
        &mut self,
        sender: ConnectionId,
        code: &str,
        to: Option<String>,
        from: Option<String>,
        payload: serde_json::Value,
    ) -> Directives {
        let Some(session) = self.sessions.get_mut(code) else {
            debug!("signal for unknown session {code}; dropped");
            return Vec::new();
        };
        session.last_activity = Instant::now();

        let outbound = ServerMessage::Signal { from, payload };
        match to {
            Some(target) => {
                let conn = if target == session.host_id {
                    Some(session.host_connection_id)
                } else {
                    session.clients.get(&target).map(|c| c.connection_id)
                };
                match conn {
                    Some(conn) => vec![(conn, outbound)],
                    None => {
                        debug!("signal target {target} not in session {code}; dropped");
                        Vec::new()
                    }
                }
            }
            None => session
                .member_connections()
                .filter(|&c| c != sender)
                .map(|c| (c, outbound.clone()))
                .collect(),
        }
    }

    /// Unbinds a connection, with `leave-session` semantics:
    ///
    /// - Host: broadcast `host-left` to every member and delete the session.
    /// - Client: remove its entry and notify the host with `peer-left`.
    /// - Unbound: nothing to do.
    pub fn disconnect(&mut self, conn: ConnectionId) -> Directives {
        match self.bindings.remove(&conn) {
            Some(Binding::Host { code }) => {
                let Some(session) = self.sessions.remove(&code) else {
                    return Vec::new();
                };
                // Every remaining member drops back to unbound.
                let mut directives = Vec::new();
                for client in session.clients.values() {
                    self.bindings.remove(&client.connection_id);
                    directives.push((client.connection_id, ServerMessage::HostLeft));
                }
                debug!("host left; session {code} deleted");
                directives
            }
            Some(Binding::Client { code, client_id }) => {
                let Some(session) = self.sessions.get_mut(&code) else {
                    return Vec::new();
                };
                session.clients.remove(&client_id);
                session.last_activity = Instant::now();
                vec![(
                    session.host_connection_id,
                    ServerMessage::PeerLeft {
                        data: PeerData { peer_id: client_id },
                    },
                )]
            }
            None => Vec::new(),
        }
    }

    /// Garbage-collects sessions idle past `ttl`. Members of a collected
    /// session are told the host is gone, exactly as if it had left.
    pub fn sweep_idle(&mut self, ttl: std::time::Duration) -> Directives {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.last_activity.elapsed() > ttl)
            .map(|s| s.code.clone())
            .collect();

        let mut directives = Vec::new();
        for code in expired {
            if let Some(session) = self.sessions.remove(&code) {
                debug!("session {code} idle past TTL; collected");
                self.bindings.remove(&session.host_connection_id);
                for client in session.clients.values() {
                    self.bindings.remove(&client.connection_id);
                    directives.push((client.connection_id, ServerMessage::HostLeft));
                }
            }
        }
        directives
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn create(reg: &mut SessionRegistry, conn: ConnectionId, code: &str, host: &str) -> Directives {
        reg.handle(
            conn,
            ClientMessage::CreateSession {
                session_code: code.to_string(),
                host_id: host.to_string(),
            },
        )
    }

    fn join(reg: &mut SessionRegistry, conn: ConnectionId, code: &str, client: &str) -> Directives {
        reg.handle(
            conn,
            ClientMessage::JoinSession {
                session_code: code.to_string(),
                client_id: client.to_string(),
            },
        )
    }

    #[test]
    fn test_create_session_succeeds_and_replies_session_created() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let out = create(&mut reg, host, "ABC123", "h1");
        assert_eq!(out, vec![(host, ServerMessage::SessionCreated)]);
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn test_duplicate_code_errors_second_requester_only() {
        let mut reg = SessionRegistry::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        create(&mut reg, first, "ABC123", "h1");

        let out = create(&mut reg, second, "ABC123", "h2");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, second);
        assert!(matches!(out[0].1, ServerMessage::Error { .. }));

        // First session untouched and still queryable.
        let session = reg.session("ABC123").unwrap();
        assert_eq!(session.host_id, "h1");
        assert_eq!(session.host_connection_id, first);
    }

    #[test]
    fn test_recreate_while_hosting_ends_the_first_session() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");

        let out = create(&mut reg, host, "XYZ789", "h1");
        // The old session's member hears host-left before the new session
        // is confirmed; nothing lingers for the sweep.
        assert_eq!(
            out,
            vec![
                (c1, ServerMessage::HostLeft),
                (host, ServerMessage::SessionCreated),
            ]
        );
        assert!(reg.session("ABC123").is_none());
        assert_eq!(reg.session("XYZ789").unwrap().host_connection_id, host);
        assert_eq!(reg.session_count(), 1);
    }

    #[test]
    fn test_client_joining_a_second_session_leaves_the_first() {
        let mut reg = SessionRegistry::new();
        let h1 = Uuid::new_v4();
        let h2 = Uuid::new_v4();
        let c = Uuid::new_v4();
        create(&mut reg, h1, "ABC123", "h1");
        create(&mut reg, h2, "XYZ789", "h2");
        join(&mut reg, c, "ABC123", "c1");

        let out = join(&mut reg, c, "XYZ789", "c1");
        // First host hears peer-left, then the usual join directives.
        assert_eq!(
            out[0],
            (
                h1,
                ServerMessage::PeerLeft {
                    data: PeerData {
                        peer_id: "c1".to_string()
                    }
                }
            )
        );
        assert!(reg.session("ABC123").unwrap().clients.is_empty());
        assert!(reg.session("XYZ789").unwrap().clients.contains_key("c1"));
    }

    #[test]
    fn test_join_unknown_code_returns_session_not_found() {
        let mut reg = SessionRegistry::new();
        let conn = Uuid::new_v4();
        let out = join(&mut reg, conn, "NOPE42", "c1");
        assert_eq!(out, vec![(conn, ServerMessage::SessionNotFound)]);
    }

    #[test]
    fn test_join_notifies_joiner_and_host() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let client = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");

        let out = join(&mut reg, client, "ABC123", "c1");
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            (
                client,
                ServerMessage::SessionJoined {
                    data: SessionJoinedData {
                        host_id: "h1".to_string()
                    }
                }
            )
        );
        assert_eq!(
            out[1],
            (
                host,
                ServerMessage::PeerJoined {
                    data: PeerData {
                        peer_id: "c1".to_string()
                    }
                }
            )
        );
    }

    #[test]
    fn test_signal_with_to_host_unicasts_to_host() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let client = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, client, "ABC123", "c1");

        let out = reg.handle(
            client,
            ClientMessage::Signal {
                session_code: "ABC123".to_string(),
                to: Some("h1".to_string()),
                from: Some("c1".to_string()),
                payload: json!({"sdp":"answer"}),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, host);
    }

    #[test]
    fn test_signal_with_to_client_unicasts_to_that_client() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");
        join(&mut reg, c2, "ABC123", "c2");

        let out = reg.handle(
            host,
            ClientMessage::Signal {
                session_code: "ABC123".to_string(),
                to: Some("c2".to_string()),
                from: Some("h1".to_string()),
                payload: json!({"candidate":"..."}),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, c2);
    }

    #[test]
    fn test_signal_without_to_broadcasts_excluding_sender() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");
        join(&mut reg, c2, "ABC123", "c2");

        let out = reg.handle(
            c1,
            ClientMessage::Signal {
                session_code: "ABC123".to_string(),
                to: None,
                from: Some("c1".to_string()),
                payload: json!({"sdp":"offer"}),
            },
        );
        let recipients: Vec<ConnectionId> = out.iter().map(|(c, _)| *c).collect();
        assert_eq!(recipients.len(), 2);
        assert!(recipients.contains(&host));
        assert!(recipients.contains(&c2));
        assert!(!recipients.contains(&c1), "sender must be excluded");
    }

    #[test]
    fn test_signal_to_unknown_target_is_dropped() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        let out = reg.handle(
            host,
            ClientMessage::Signal {
                session_code: "ABC123".to_string(),
                to: Some("ghost".to_string()),
                from: None,
                payload: json!(null),
            },
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_host_disconnect_broadcasts_host_left_and_deletes_session() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");

        let out = reg.disconnect(host);
        assert_eq!(out, vec![(c1, ServerMessage::HostLeft)]);
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn test_client_disconnect_notifies_host_with_peer_left() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");

        let out = reg.disconnect(c1);
        assert_eq!(
            out,
            vec![(
                host,
                ServerMessage::PeerLeft {
                    data: PeerData {
                        peer_id: "c1".to_string()
                    }
                }
            )]
        );
        assert!(reg.session("ABC123").unwrap().clients.is_empty());
    }

    #[test]
    fn test_leave_session_matches_disconnect_semantics() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");

        let out = reg.handle(
            host,
            ClientMessage::LeaveSession {
                session_code: "ABC123".to_string(),
            },
        );
        assert_eq!(out, vec![(c1, ServerMessage::HostLeft)]);
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn test_disconnect_of_unbound_connection_is_a_noop() {
        let mut reg = SessionRegistry::new();
        assert!(reg.disconnect(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_code_is_reusable_after_session_ends() {
        let mut reg = SessionRegistry::new();
        let host1 = Uuid::new_v4();
        create(&mut reg, host1, "ABC123", "h1");
        reg.disconnect(host1);

        // Codes are unique among *active* sessions only.
        let host2 = Uuid::new_v4();
        let out = create(&mut reg, host2, "ABC123", "h2");
        assert_eq!(out, vec![(host2, ServerMessage::SessionCreated)]);
    }

    #[test]
    fn test_sweep_collects_idle_sessions_and_notifies_clients() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        let c1 = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        join(&mut reg, c1, "ABC123", "c1");

        // Zero TTL: everything is instantly idle.
        let out = reg.sweep_idle(Duration::from_secs(0));
        assert_eq!(out, vec![(c1, ServerMessage::HostLeft)]);
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_active_sessions() {
        let mut reg = SessionRegistry::new();
        let host = Uuid::new_v4();
        create(&mut reg, host, "ABC123", "h1");
        let out = reg.sweep_idle(Duration::from_secs(3600));
        assert!(out.is_empty());
        assert_eq!(reg.session_count(), 1);
    }
}

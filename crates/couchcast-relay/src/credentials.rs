//! Shared-secret, time-limited relay credentials (TURN REST scheme).
//!
//! A relay server configured with the same shared secret can verify these
//! credentials statelessly: it splits the username on `:`, checks the expiry
//! epoch, recomputes the HMAC over the whole username, and compares. No
//! account database, no round-trip to this service.
//!
//! Scheme:
//!
//! ```text
//! username   = "<expiryEpochSeconds>:<userId>"
//! credential = base64(HMAC-SHA1(secret, username))
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// One entry of the `getIceServers()` consumer interface.
///
/// STUN entries carry no credentials; relay entries carry both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN entry.
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// A relay entry carrying signed credentials.
    pub fn relay(url: impl Into<String>, creds: &RelayCredentials) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(creds.username.clone()),
            credential: Some(creds.credential.clone()),
        }
    }
}

/// A freshly signed username/credential pair with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    pub username: String,
    pub credential: String,
    pub expires_at_secs: u64,
}

/// Signs credentials valid until exactly `expires_at_secs`.
///
/// Deterministic: the same `(secret, user_id, expiry)` triple always yields
/// the same credential, which is what makes the scheme verifiable by the
/// relay and testable against fixed vectors.
pub fn generate_credentials_at(secret: &str, user_id: &str, expires_at_secs: u64) -> RelayCredentials {
    let username = format!("{expires_at_secs}:{user_id}");
    // HMAC accepts keys of any length; new_from_slice cannot fail for SHA1.
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA1 accepts any key length"));
    mac.update(username.as_bytes());
    let credential = BASE64.encode(mac.finalize().into_bytes());
    RelayCredentials {
        username,
        credential,
        expires_at_secs,
    }
}

/// Signs credentials valid for `ttl` from now.
pub fn generate_credentials(secret: &str, user_id: &str, ttl: Duration) -> RelayCredentials {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    generate_credentials_at(secret, user_id, now + ttl.as_secs())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector_north_relay_secret() {
        // Precomputed: base64(HMAC-SHA1("north-relay-secret", "1700000000:host-7f3a"))
        let creds = generate_credentials_at("north-relay-secret", "host-7f3a", 1_700_000_000);
        assert_eq!(creds.username, "1700000000:host-7f3a");
        assert_eq!(creds.credential, "a4KBpvYEnE4THgOf6HwekCR7rQc=");
    }

    #[test]
    fn test_known_vector_short_secret() {
        // Precomputed: base64(HMAC-SHA1("s3cr3t", "1893456000:user-1"))
        let creds = generate_credentials_at("s3cr3t", "user-1", 1_893_456_000);
        assert_eq!(creds.username, "1893456000:user-1");
        assert_eq!(creds.credential, "dhqzwcS9jbE/Yh3K8YWIfMfEYxQ=");
    }

    #[test]
    fn test_deterministic_for_fixed_expiry() {
        let a = generate_credentials_at("secret", "u", 1_700_000_000);
        let b = generate_credentials_at("secret", "u", 1_700_000_000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_secret_changes_credential() {
        let a = generate_credentials_at("secret-a", "u", 1_700_000_000);
        let b = generate_credentials_at("secret-b", "u", 1_700_000_000);
        assert_eq!(a.username, b.username);
        assert_ne!(a.credential, b.credential);
    }

    #[test]
    fn test_different_user_changes_username_and_credential() {
        let a = generate_credentials_at("secret", "alice", 1_700_000_000);
        let b = generate_credentials_at("secret", "bob", 1_700_000_000);
        assert_ne!(a.username, b.username);
        assert_ne!(a.credential, b.credential);
    }

    #[test]
    fn test_ttl_expiry_is_in_the_future() {
        let creds = generate_credentials("secret", "u", Duration::from_secs(86_400));
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(creds.expires_at_secs >= now + 86_399);
        assert!(creds.username.starts_with(&creds.expires_at_secs.to_string()));
    }

    #[test]
    fn test_stun_entry_carries_no_credentials() {
        let entry = IceServer::stun("stun:stun.example.net:3478");
        assert_eq!(entry.username, None);
        assert_eq!(entry.credential, None);
    }

    #[test]
    fn test_relay_entry_carries_credentials() {
        let creds = generate_credentials_at("secret", "u", 1_700_000_000);
        let entry = IceServer::relay("turn:relay.example.net:3478?transport=udp", &creds);
        assert_eq!(entry.username.as_deref(), Some("1700000000:u"));
        assert!(entry.credential.is_some());
    }
}

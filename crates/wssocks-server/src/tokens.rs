//! Process-wide token registry.
//!
//! Holds forward tokens, reverse tokens with their port/credential
//! bindings, and connector tokens scoped to the reverse session that
//! issued them. Sessions are tracked per token for round-robin dispatch
//! and client counts. Guarded by one read-mostly lock.

use std::collections::HashMap;
use std::sync::RwLock;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use wssocks_core::error::{Result, WssocksError};
use wssocks_core::socks::SocksAuth;

/// Length of generated tokens.
pub const TOKEN_LENGTH: usize = 16;

/// Generate a random alphanumeric token.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Parameters for registering a reverse token.
#[derive(Debug, Default, Clone)]
pub struct ReverseTokenOptions {
    /// Explicit token; generated when `None`.
    pub token: Option<String>,
    /// Explicit SOCKS port; OS-allocated when 0.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ReverseTokenOptions {
    pub fn socks_auth(&self) -> Option<SocksAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(SocksAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

/// What a validated AUTH token entitles the session to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthGrant {
    /// Forward token: the server egresses for this session.
    Forward,
    /// Reverse token: the session egresses for the server's SOCKS listener.
    Reverse,
    /// Connector token: CONNECTs route through the issuer's reverse session.
    Connector { issuer: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Forward,
    Reverse,
    Connector,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Forward => "forward",
            TokenKind::Reverse => "reverse",
            TokenKind::Connector => "connector",
        }
    }
}

/// Registry entry state for the admin status endpoint.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub token: String,
    pub kind: TokenKind,
    pub clients_count: usize,
    pub port: Option<u16>,
}

/// A removed token, with the sessions the caller must close.
#[derive(Debug)]
pub struct RemovedToken {
    pub kind: TokenKind,
    pub sessions: Vec<Uuid>,
    pub port: Option<u16>,
}

#[derive(Default)]
struct ForwardEntry {
    sessions: Vec<Uuid>,
}

struct ReverseEntry {
    port: u16,
    auth: Option<SocksAuth>,
    sessions: Vec<Uuid>,
    cursor: usize,
}

struct ConnectorEntry {
    issuer: Uuid,
    sessions: Vec<Uuid>,
}

#[derive(Default)]
struct Inner {
    forward: HashMap<String, ForwardEntry>,
    reverse: HashMap<String, ReverseEntry>,
    connectors: HashMap<String, ConnectorEntry>,
}

impl Inner {
    fn contains(&self, token: &str) -> bool {
        self.forward.contains_key(token)
            || self.reverse.contains_key(token)
            || self.connectors.contains_key(token)
    }
}

/// Shared token registry. Cheap reads on the auth/dispatch hot path.
#[derive(Default)]
pub struct TokenRegistry {
    inner: RwLock<Inner>,
    /// Signaled whenever a session attaches; dispatchers waiting for a
    /// serving session listen on this.
    joined: Notify,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier fired on every session attach.
    pub fn joined(&self) -> &Notify {
        &self.joined
    }

    /// Register a forward token, generating one when absent. Adding an
    /// existing forward token returns it unchanged.
    pub fn add_forward_token(&self, token: Option<String>) -> String {
        let mut inner = self.inner.write().unwrap();
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => generate_token(),
        };
        if !inner.forward.contains_key(&token) {
            inner.forward.insert(token.clone(), ForwardEntry::default());
            info!(token = %token, "forward token added");
        }
        token
    }

    /// Reserve a reverse token ahead of binding its listener. Fails when
    /// the token already exists in any set.
    pub fn reserve_reverse_token(&self, token: Option<String>) -> Result<String> {
        let inner = self.inner.read().unwrap();
        match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                if inner.contains(&token) {
                    return Err(WssocksError::Alloc(format!("token {token} already exists")));
                }
                Ok(token)
            }
            None => {
                let mut token = generate_token();
                while inner.contains(&token) {
                    token = generate_token();
                }
                Ok(token)
            }
        }
    }

    /// Commit a reverse token once its listener is bound.
    pub fn insert_reverse_token(&self, token: &str, port: u16, auth: Option<SocksAuth>) {
        let mut inner = self.inner.write().unwrap();
        inner.reverse.insert(
            token.to_string(),
            ReverseEntry {
                port,
                auth,
                sessions: Vec::new(),
                cursor: 0,
            },
        );
        info!(token = %token, port, "reverse token added");
    }

    /// Authorize a connector token on behalf of a reverse session.
    pub fn add_connector_token(&self, token: Option<String>, issuer: Uuid) -> Result<String> {
        let mut inner = self.inner.write().unwrap();
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => {
                if inner.contains(&token) {
                    return Err(WssocksError::Alloc(format!("token {token} already exists")));
                }
                token
            }
            None => {
                let mut token = generate_token();
                while inner.contains(&token) {
                    token = generate_token();
                }
                token
            }
        };
        inner.connectors.insert(
            token.clone(),
            ConnectorEntry {
                issuer,
                sessions: Vec::new(),
            },
        );
        info!(token = %token, issuer = %issuer, "connector token added");
        Ok(token)
    }

    /// Revoke a connector token. Only its issuer may remove it. Returns the
    /// dependent sessions to close.
    pub fn remove_connector_token(&self, token: &str, issuer: Uuid) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.write().unwrap();
        match inner.connectors.get(token).map(|e| e.issuer) {
            Some(owner) if owner == issuer => {
                let sessions = inner
                    .connectors
                    .remove(token)
                    .map(|e| e.sessions)
                    .unwrap_or_default();
                info!(token = %token, "connector token removed");
                Ok(sessions)
            }
            Some(_) => Err(WssocksError::Auth(format!(
                "connector token {token} owned by another session"
            ))),
            None => Err(WssocksError::Other(format!(
                "connector token {token} not found"
            ))),
        }
    }

    /// Drop every connector token issued by `issuer` (called on issuer
    /// close). Returns `(token, dependent sessions)` pairs.
    pub fn remove_connectors_of(&self, issuer: Uuid) -> Vec<(String, Vec<Uuid>)> {
        let mut inner = self.inner.write().unwrap();
        let tokens: Vec<String> = inner
            .connectors
            .iter()
            .filter(|(_, e)| e.issuer == issuer)
            .map(|(t, _)| t.clone())
            .collect();
        tokens
            .into_iter()
            .filter_map(|t| {
                inner.connectors.remove(&t).map(|e| {
                    debug!(token = %t, issuer = %issuer, "connector token expired with issuer");
                    (t, e.sessions)
                })
            })
            .collect()
    }

    /// Remove a token of any kind. Returns the sessions to close and, for
    /// reverse tokens, the port whose listener must be torn down.
    pub fn remove_token(&self, token: &str) -> Option<RemovedToken> {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.forward.remove(token) {
            info!(token = %token, "forward token removed");
            return Some(RemovedToken {
                kind: TokenKind::Forward,
                sessions: entry.sessions,
                port: None,
            });
        }
        if let Some(entry) = inner.reverse.remove(token) {
            info!(token = %token, port = entry.port, "reverse token removed");
            return Some(RemovedToken {
                kind: TokenKind::Reverse,
                sessions: entry.sessions,
                port: Some(entry.port),
            });
        }
        if let Some(entry) = inner.connectors.remove(token) {
            info!(token = %token, "connector token removed");
            return Some(RemovedToken {
                kind: TokenKind::Connector,
                sessions: entry.sessions,
                port: None,
            });
        }
        None
    }

    /// Check an AUTH frame against the registry. The `reverse` flag must
    /// match the token type.
    pub fn validate(&self, token: &str, reverse: bool) -> Result<AuthGrant> {
        let inner = self.inner.read().unwrap();
        if reverse {
            if inner.reverse.contains_key(token) {
                return Ok(AuthGrant::Reverse);
            }
            return Err(WssocksError::Auth("invalid token".into()));
        }
        if inner.forward.contains_key(token) {
            return Ok(AuthGrant::Forward);
        }
        if let Some(entry) = inner.connectors.get(token) {
            return Ok(AuthGrant::Connector {
                issuer: entry.issuer,
            });
        }
        Err(WssocksError::Auth("invalid token".into()))
    }

    /// Record a session as serving `token`.
    pub fn attach_session(&self, token: &str, session_id: Uuid) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(entry) = inner.forward.get_mut(token) {
                entry.sessions.push(session_id);
            } else if let Some(entry) = inner.reverse.get_mut(token) {
                entry.sessions.push(session_id);
            } else if let Some(entry) = inner.connectors.get_mut(token) {
                entry.sessions.push(session_id);
            }
        }
        self.joined.notify_waiters();
    }

    /// Forget a session. No-op if the token was already removed.
    pub fn detach_session(&self, token: &str, session_id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.forward.get_mut(token) {
            entry.sessions.retain(|id| *id != session_id);
        } else if let Some(entry) = inner.reverse.get_mut(token) {
            entry.sessions.retain(|id| *id != session_id);
        } else if let Some(entry) = inner.connectors.get_mut(token) {
            entry.sessions.retain(|id| *id != session_id);
        }
    }

    /// Round-robin pick over the sessions serving a reverse token.
    pub fn pick_reverse_session(&self, token: &str) -> Option<Uuid> {
        let mut inner = self.inner.write().unwrap();
        let entry = inner.reverse.get_mut(token)?;
        if entry.sessions.is_empty() {
            return None;
        }
        let picked = entry.sessions[entry.cursor % entry.sessions.len()];
        entry.cursor = entry.cursor.wrapping_add(1);
        Some(picked)
    }

    /// SOCKS credentials configured for a reverse token.
    pub fn reverse_auth(&self, token: &str) -> Option<SocksAuth> {
        self.inner
            .read()
            .unwrap()
            .reverse
            .get(token)
            .and_then(|e| e.auth.clone())
    }

    /// Number of live sessions authenticated with `token`.
    pub fn client_count(&self, token: &str) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .forward
            .get(token)
            .map(|e| e.sessions.len())
            .or_else(|| inner.reverse.get(token).map(|e| e.sessions.len()))
            .or_else(|| inner.connectors.get(token).map(|e| e.sessions.len()))
            .unwrap_or(0)
    }

    /// Snapshot of forward and reverse tokens for the status endpoint.
    pub fn status(&self) -> Vec<TokenStatus> {
        let inner = self.inner.read().unwrap();
        let mut out: Vec<TokenStatus> = inner
            .reverse
            .iter()
            .map(|(token, entry)| TokenStatus {
                token: token.clone(),
                kind: TokenKind::Reverse,
                clients_count: entry.sessions.len(),
                port: Some(entry.port),
            })
            .collect();
        out.extend(inner.forward.iter().map(|(token, entry)| TokenStatus {
            token: token.clone(),
            kind: TokenKind::Forward,
            clients_count: entry.sessions.len(),
            port: None,
        }));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_token_is_idempotent() {
        let reg = TokenRegistry::new();
        let t = reg.add_forward_token(Some("tok1".into()));
        assert_eq!(t, "tok1");
        assert_eq!(reg.add_forward_token(Some("tok1".into())), "tok1");
        assert_eq!(reg.status().len(), 1);
    }

    #[test]
    fn generated_tokens_have_expected_shape() {
        let t = generate_token();
        assert_eq!(t.len(), TOKEN_LENGTH);
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn reverse_token_must_be_unique() {
        let reg = TokenRegistry::new();
        reg.add_forward_token(Some("tok1".into()));
        assert!(reg.reserve_reverse_token(Some("tok1".into())).is_err());
        let t = reg.reserve_reverse_token(Some("tok2".into())).unwrap();
        reg.insert_reverse_token(&t, 11080, None);
        assert!(reg.reserve_reverse_token(Some("tok2".into())).is_err());
    }

    #[test]
    fn validate_matches_role_to_token_kind() {
        let reg = TokenRegistry::new();
        reg.add_forward_token(Some("fwd".into()));
        reg.insert_reverse_token("rev", 11080, None);
        let issuer = Uuid::new_v4();
        reg.add_connector_token(Some("sub".into()), issuer).unwrap();

        assert_eq!(reg.validate("fwd", false).unwrap(), AuthGrant::Forward);
        assert!(reg.validate("fwd", true).is_err());
        assert_eq!(reg.validate("rev", true).unwrap(), AuthGrant::Reverse);
        assert!(reg.validate("rev", false).is_err());
        assert_eq!(
            reg.validate("sub", false).unwrap(),
            AuthGrant::Connector { issuer }
        );
        assert!(reg.validate("sub", true).is_err());
        assert!(reg.validate("nope", false).is_err());
    }

    #[test]
    fn round_robin_is_fair() {
        let reg = TokenRegistry::new();
        reg.insert_reverse_token("rev", 11080, None);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.attach_session("rev", a);
        reg.attach_session("rev", b);

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for _ in 0..100 {
            let picked = reg.pick_reverse_session("rev").unwrap();
            *counts.entry(picked).or_default() += 1;
        }
        assert_eq!(counts[&a], 50);
        assert_eq!(counts[&b], 50);
    }

    #[test]
    fn pick_with_no_sessions_is_none() {
        let reg = TokenRegistry::new();
        reg.insert_reverse_token("rev", 11080, None);
        assert!(reg.pick_reverse_session("rev").is_none());
        assert!(reg.pick_reverse_session("missing").is_none());
    }

    #[test]
    fn detach_shrinks_rotation() {
        let reg = TokenRegistry::new();
        reg.insert_reverse_token("rev", 11080, None);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.attach_session("rev", a);
        reg.attach_session("rev", b);
        reg.detach_session("rev", a);
        for _ in 0..10 {
            assert_eq!(reg.pick_reverse_session("rev"), Some(b));
        }
        assert_eq!(reg.client_count("rev"), 1);
    }

    #[test]
    fn remove_token_reports_sessions_and_port() {
        let reg = TokenRegistry::new();
        reg.insert_reverse_token("rev", 11080, None);
        let a = Uuid::new_v4();
        reg.attach_session("rev", a);

        let removed = reg.remove_token("rev").unwrap();
        assert_eq!(removed.kind, TokenKind::Reverse);
        assert_eq!(removed.sessions, vec![a]);
        assert_eq!(removed.port, Some(11080));
        assert!(reg.remove_token("rev").is_none());
    }

    #[test]
    fn connector_tokens_die_with_their_issuer() {
        let reg = TokenRegistry::new();
        let issuer = Uuid::new_v4();
        let other = Uuid::new_v4();
        reg.add_connector_token(Some("sub1".into()), issuer).unwrap();
        reg.add_connector_token(Some("sub2".into()), issuer).unwrap();
        reg.add_connector_token(Some("keep".into()), other).unwrap();
        let dep = Uuid::new_v4();
        reg.attach_session("sub1", dep);

        let mut removed = reg.remove_connectors_of(issuer);
        removed.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0], ("sub1".into(), vec![dep]));
        assert_eq!(removed[1].0, "sub2");
        assert!(reg.validate("keep", false).is_ok());
        assert!(reg.validate("sub1", false).is_err());
    }

    #[test]
    fn connector_removal_requires_issuer() {
        let reg = TokenRegistry::new();
        let issuer = Uuid::new_v4();
        reg.add_connector_token(Some("sub".into()), issuer).unwrap();
        assert!(reg.remove_connector_token("sub", Uuid::new_v4()).is_err());
        assert!(reg.remove_connector_token("sub", issuer).is_ok());
        assert!(reg.remove_connector_token("sub", issuer).is_err());
    }

    #[test]
    fn generated_connector_token_avoids_collisions() {
        let reg = TokenRegistry::new();
        let t = reg.add_connector_token(None, Uuid::new_v4()).unwrap();
        assert_eq!(t.len(), TOKEN_LENGTH);
        assert!(reg.add_connector_token(Some(t.clone()), Uuid::new_v4()).is_err());
    }
}

//! Session collaborator: the per-client key/value map and the store that persists it.
//!
//! The core only reads and writes a handful of keys through [`SessionAuthState`]; how the map
//! is persisted and tied to a client (cookie, header, ...) belongs to the [`SessionStore`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time;
use tracing::debug;
use uuid::Uuid;

use super::types::{IdentityRecord, RequestToken, Token};

pub const TOKEN_KEY: &str = "token";
pub const TOKEN_PROVIDER_KEY: &str = "token_provider";
pub const PROVIDER_KEY: &str = "oauth_provider";
pub const USER_INFO_KEY: &str = "user_info";
pub const AFTER_AUTH_REDIRECT_KEY: &str = "after_auth_redirect";
pub const CSRF_STATE_KEY: &str = "oauth_state";
pub const REQUEST_TOKEN_KEY: &str = "oauth_request_token";
pub const REQUEST_TOKEN_SECRET_KEY: &str = "oauth_request_token_secret";

static DEFAULT_TTL: u64 = 3600 * 24 * 7; // 7 days

/// Session data with a dirty flag, so stores can skip unchanged sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session(HashMap<String, Value>, bool);

impl Session {
    pub fn new() -> Self {
        Session(HashMap::new(), false)
    }

    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Session(map, false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
        self.1 = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.0.remove(key);
        if removed.is_some() {
            self.1 = true;
        }
        removed
    }

    pub fn is_modified(&self) -> bool {
        self.1
    }

    pub fn into_map(self) -> HashMap<String, Value> {
        self.0
    }
}

/// Typed accessor over the session keys the login flow owns.
pub struct SessionAuthState<'a> {
    session: &'a mut Session,
}

impl<'a> SessionAuthState<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Self { session }
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.session.get(key).and_then(Value::as_str).map(str::to_string)
    }

    pub fn has_token(&self) -> bool {
        self.token().is_some()
    }

    /// Access token, if one is stored and well-formed.
    pub fn token(&self) -> Option<Token> {
        self.session
            .get(TOKEN_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Stores a freshly exchanged token. Any cached identity belonged to the previous token and
    /// is dropped, and so is the previous token's owner.
    pub fn set_token(&mut self, token: &Token) {
        let value = serde_json::to_value(token).unwrap_or(Value::Null);
        self.session.insert(TOKEN_KEY, value);
        self.session.remove(USER_INFO_KEY);
        self.session.remove(TOKEN_PROVIDER_KEY);
    }

    /// Stores a token together with the provider that issued it.
    pub fn set_token_for(&mut self, token: &Token, provider: &str) {
        self.set_token(token);
        self.session
            .insert(TOKEN_PROVIDER_KEY, Value::String(provider.to_string()));
    }

    /// Provider that issued the stored token, when it was recorded.
    pub fn token_provider(&self) -> Option<String> {
        self.get_str(TOKEN_PROVIDER_KEY)
    }

    pub fn oauth_provider(&self) -> Option<String> {
        self.get_str(PROVIDER_KEY)
    }

    pub fn remember_provider(&mut self, name: &str) {
        self.session.insert(PROVIDER_KEY, Value::String(name.to_string()));
    }

    pub fn forget_provider(&mut self) {
        self.session.remove(PROVIDER_KEY);
    }

    /// Cached identity. A value that no longer deserializes is treated as absent.
    pub fn user_info(&self) -> Option<IdentityRecord> {
        self.session
            .get(USER_INFO_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn cache_user_info(&mut self, user: &IdentityRecord) {
        if let Ok(value) = serde_json::to_value(user) {
            self.session.insert(USER_INFO_KEY, value);
        }
    }

    pub fn invalidate_user_info(&mut self) {
        self.session.remove(USER_INFO_KEY);
    }

    pub fn after_auth_redirect(&self) -> Option<String> {
        self.get_str(AFTER_AUTH_REDIRECT_KEY)
    }

    pub fn set_after_auth_redirect(&mut self, target: &str) {
        self.session
            .insert(AFTER_AUTH_REDIRECT_KEY, Value::String(target.to_string()));
    }

    pub fn take_after_auth_redirect(&mut self) -> Option<String> {
        self.session
            .remove(AFTER_AUTH_REDIRECT_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_csrf_state(&mut self, state: &str) {
        self.session.insert(CSRF_STATE_KEY, Value::String(state.to_string()));
    }

    /// Removes and returns the pending CSRF state; each state is usable once.
    pub fn take_csrf_state(&mut self) -> Option<String> {
        self.session
            .remove(CSRF_STATE_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn set_request_token(&mut self, request_token: &RequestToken) {
        self.session.insert(
            REQUEST_TOKEN_KEY,
            Value::String(request_token.oauth_token.clone()),
        );
        self.session.insert(
            REQUEST_TOKEN_SECRET_KEY,
            Value::String(request_token.oauth_token_secret.clone()),
        );
    }

    /// Removes and returns the pending OAuth1 request token and its secret.
    pub fn take_request_token(&mut self) -> Option<(String, String)> {
        let token = self.session.remove(REQUEST_TOKEN_KEY);
        let secret = self.session.remove(REQUEST_TOKEN_SECRET_KEY);
        match (token, secret) {
            (Some(Value::String(t)), Some(Value::String(s))) => Some((t, s)),
            _ => None,
        }
    }

    /// Ends the login: token, its owner, cached identity and remembered provider are removed
    /// together.
    pub fn logout(&mut self) {
        self.session.remove(TOKEN_KEY);
        self.session.remove(TOKEN_PROVIDER_KEY);
        self.session.remove(USER_INFO_KEY);
        self.session.remove(PROVIDER_KEY);
    }
}

/// Failure of the session backend.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session backend error: {0}")]
    Backend(String),
}

/// Persistence of session maps keyed by an opaque per-client identifier.
///
/// The store must serialize reads and writes per key; the login flow does no locking itself.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Loads the session for `session_id`, or starts a new one. Returns the id to hand back to
    /// the client together with the session.
    async fn read(&self, session_id: Option<&str>) -> Result<(String, Session), SessionError>;

    /// Persists the session under `session_id`.
    async fn write(&self, session_id: &str, session: Session) -> Result<(), SessionError>;
}

#[derive(Debug, Clone)]
struct SessionCont {
    expiry_time: u64,
    data: HashMap<String, Value>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Process-local session store with sliding expiry.
#[derive(Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, SessionCont>>,
    ttl_secs: u64,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl_secs: u64) -> Self {
        Self { sessions: Arc::new(DashMap::new()), ttl_secs }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every expired session.
    pub fn purge_expired(&self) {
        let now = now_secs();
        self.sessions.retain(|_, session| session.expiry_time > now);
    }

    /// Purges expired sessions every `interval` on the current tokio runtime.
    pub fn spawn_cleanup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                store.purge_expired();
            }
        })
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn read(&self, session_id: Option<&str>) -> Result<(String, Session), SessionError> {
        let now = now_secs();
        if let Some(id) = session_id {
            if let Some(entry) = self.sessions.get(id) {
                if entry.expiry_time > now {
                    return Ok((id.to_string(), Session::from_map(entry.data.clone())));
                }
            }
        }
        let id = Uuid::new_v4().to_string();
        debug!(session_id = %id, "starting new session");
        Ok((id, Session::new()))
    }

    async fn write(&self, session_id: &str, session: Session) -> Result<(), SessionError> {
        let expiry_time = now_secs() + self.ttl_secs;
        self.sessions.insert(
            session_id.to_string(),
            SessionCont { expiry_time, data: session.into_map() },
        );
        Ok(())
    }
}

//! Request context threaded through the login guard and the callback endpoint.
//!
//! The surrounding HTTP server builds an [`AuthContext`] from the inbound request and the
//! session it loaded, hands it to the middleware, and turns the returned
//! [`AuthContext::response`] into its own response type before persisting the session.

use std::collections::HashMap;

use starberry_lib::parse_pairs;

use super::session::{Session, SessionAuthState};
use super::types::IdentityRecord;

/// Response decided by the middleware or the wrapped handler.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Response {
    /// Nothing decided yet.
    #[default]
    Unset,
    /// `302 Found` to `location`.
    Redirect { location: String },
    /// Bare status with a short plain-text reason.
    Status { code: u16, body: String },
    /// A full response produced by a handler.
    Content {
        code: u16,
        content_type: String,
        body: Vec<u8>,
    },
}

impl Response {
    pub fn redirect(location: impl Into<String>) -> Self {
        Response::Redirect { location: location.into() }
    }

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        Response::Status { code, body: body.into() }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Response::Content {
            code: 200,
            content_type: "text/plain; charset=utf-8".into(),
            body: body.into().into_bytes(),
        }
    }

    pub fn html(body: impl Into<String>) -> Self {
        Response::Content {
            code: 200,
            content_type: "text/html; charset=utf-8".into(),
            body: body.into().into_bytes(),
        }
    }

    /// HTTP status code; `Unset` reads as 200.
    pub fn status_code(&self) -> u16 {
        match self {
            Response::Unset => 200,
            Response::Redirect { .. } => 302,
            Response::Status { code, .. } | Response::Content { code, .. } => *code,
        }
    }

    /// Target of a redirect response.
    pub fn redirect_location(&self) -> Option<&str> {
        match self {
            Response::Redirect { location } => Some(location),
            _ => None,
        }
    }
}

/// Per-request state: the request line, the session and whatever identity the guard resolved.
#[derive(Debug, Clone)]
pub struct AuthContext {
    path: String,
    raw_query: String,
    query: HashMap<String, String>,
    /// Session loaded by the external session store.
    pub session: Session,
    /// Identity attached by the guard when the route asked for it.
    pub user: Option<IdentityRecord>,
    /// Response to send.
    pub response: Response,
}

impl AuthContext {
    /// Builds a context from a request target such as `/profile?tab=1`.
    pub fn new(target: &str, session: Session) -> Self {
        let (path, raw_query) = target.split_once('?').unwrap_or((target, ""));
        let query = parse_pairs(raw_query).into_iter().collect();
        Self {
            path: if path.is_empty() { "/".into() } else { path.to_string() },
            raw_query: raw_query.to_string(),
            query,
            session,
            user: None,
            response: Response::Unset,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path plus the original query string, suitable for a post-login redirect.
    pub fn target(&self) -> String {
        if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        }
    }

    /// Decoded query parameter; the last occurrence wins.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Typed view over the auth-related session keys.
    pub fn auth_state(&mut self) -> SessionAuthState<'_> {
        SessionAuthState::new(&mut self.session)
    }

    /// Hands the session back, e.g. for the session store to persist.
    pub fn into_parts(self) -> (Session, Response) {
        (self.session, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_parses_target() {
        let ctx = AuthContext::new("/oauth?code=abc%20123&state=s1", Session::new());
        assert_eq!(ctx.path(), "/oauth");
        assert_eq!(ctx.query("code"), Some("abc 123"));
        assert_eq!(ctx.query("state"), Some("s1"));
        assert_eq!(ctx.query("missing"), None);
        assert_eq!(ctx.target(), "/oauth?code=abc%20123&state=s1");
    }

    #[test]
    fn test_context_without_query() {
        let ctx = AuthContext::new("/profile", Session::new());
        assert_eq!(ctx.target(), "/profile");
        assert_eq!(ctx.response, Response::Unset);
    }

    #[test]
    fn test_response_templates() {
        assert_eq!(Response::redirect("/oauth").status_code(), 302);
        assert_eq!(Response::redirect("/oauth").redirect_location(), Some("/oauth"));
        assert_eq!(Response::status(403, "no").status_code(), 403);
        assert_eq!(Response::text("hi").status_code(), 200);
        assert_eq!(Response::text("hi").redirect_location(), None);
    }
}

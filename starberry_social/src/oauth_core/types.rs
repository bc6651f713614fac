//! Core social-login primitives: credentials, tokens, identity records and errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use starberry_lib::append_query;
use tracing::warn;

use super::context::Response;

/// Authorization protocol generation spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// Three-legged, signed requests (RFC 5849).
    OAuth1,
    /// Authorization-code grant with bearer tokens (RFC 6749).
    OAuth2,
}

/// Application credentials registered with a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// OAuth1 consumer key pair.
    OAuth1 {
        consumer_key: String,
        consumer_secret: String,
    },
    /// OAuth2 client id and secret.
    OAuth2 {
        client_id: String,
        client_secret: String,
    },
}

impl Credentials {
    /// Protocol generation these credentials belong to.
    pub fn variant(&self) -> ProtocolVariant {
        match self {
            Credentials::OAuth1 { .. } => ProtocolVariant::OAuth1,
            Credentials::OAuth2 { .. } => ProtocolVariant::OAuth2,
        }
    }
}

/// Access token as kept in the session.
///
/// Serialized untagged, so an OAuth2 token is stored as a plain string and an
/// OAuth1 token as an object with both halves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Token {
    /// OAuth2 bearer token.
    Bearer(String),
    /// OAuth1 token with its secret.
    Signed {
        oauth_token: String,
        oauth_token_secret: String,
    },
}

impl Token {
    /// The opaque token string sent to the provider.
    pub fn access_token(&self) -> &str {
        match self {
            Token::Bearer(token) => token,
            Token::Signed { oauth_token, .. } => oauth_token,
        }
    }

    /// The OAuth1 token secret, if any.
    pub fn secret(&self) -> Option<&str> {
        match self {
            Token::Bearer(_) => None,
            Token::Signed { oauth_token_secret, .. } => Some(oauth_token_secret),
        }
    }
}

/// OAuth1 temporary credentials returned by the request-token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken {
    pub oauth_token: String,
    pub oauth_token_secret: String,
    /// Whether the provider echoed `oauth_callback_confirmed=true`.
    pub callback_confirmed: bool,
}

/// Parsed OAuth2 token endpoint response.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenResponse {
    /// The bearer token.
    pub access_token: String,
    /// Optional refresh token.
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, when the provider reports one.
    pub expires_in: Option<u64>,
    /// Token type, usually `bearer`.
    pub token_type: Option<String>,
    /// Granted scopes.
    pub scope: Option<String>,
    /// Every field the provider returned.
    pub raw: Map<String, Value>,
}

/// Canonical, provider-agnostic description of the authenticated user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub picture: Option<String>,
    pub link: Option<String>,
    pub locale: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub verified: Option<bool>,
    /// Provider fields with no canonical slot.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Error taxonomy for the social-login core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OAuthError {
    /// Missing or inconsistent settings; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The user declined consent, or the code/verifier is invalid or expired.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    /// The provider answered with something that is not the expected protocol shape.
    #[error("provider protocol error: {0}")]
    ProviderProtocol(String),
    /// The user-info endpoint failed at the transport or HTTP-status level.
    #[error("identity fetch failed: {0}")]
    IdentityFetch(String),
    /// The user-info payload could not be mapped to an identity record.
    #[error("identity payload could not be parsed: {0}")]
    IdentityParse(String),
    /// Network failure or timeout talking to the provider.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl OAuthError {
    /// Whether the caller may retry the whole flow.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OAuthError::ProviderUnavailable(_))
    }

    /// Stable machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::Configuration(_) => "configuration_error",
            OAuthError::AuthorizationDenied(_) => "access_denied",
            OAuthError::ProviderProtocol(_) => "provider_protocol_error",
            OAuthError::IdentityFetch(_) => "identity_fetch_error",
            OAuthError::IdentityParse(_) => "identity_parse_error",
            OAuthError::ProviderUnavailable(_) => "provider_unavailable",
        }
    }

    /// Convert this error into the response a browser should see.
    ///
    /// Protocol and identity failures send the user back through `endpoint_path` to
    /// re-authenticate. A denial goes back to the endpoint carrying `error=access_denied`, which
    /// the endpoint renders instead of starting a new flow.
    pub fn into_response(&self, endpoint_path: &str) -> Response {
        warn!(error = %self, error_code = self.code(), "OAuth error occurred");
        match self {
            OAuthError::AuthorizationDenied(_) => {
                Response::redirect(append_query(endpoint_path, [("error", self.code())]))
            }
            OAuthError::ProviderProtocol(_)
            | OAuthError::IdentityFetch(_)
            | OAuthError::IdentityParse(_) => Response::redirect(endpoint_path),
            OAuthError::ProviderUnavailable(_) => {
                Response::status(503, "Identity provider is unavailable, try again later")
            }
            OAuthError::Configuration(_) => Response::status(500, "Login is misconfigured"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_session_representation() {
        let bearer = Token::Bearer("tok1".into());
        assert_eq!(serde_json::to_value(&bearer).unwrap(), Value::String("tok1".into()));

        let signed: Token = serde_json::from_value(serde_json::json!({
            "oauth_token": "at",
            "oauth_token_secret": "ats"
        }))
        .unwrap();
        assert_eq!(signed.access_token(), "at");
        assert_eq!(signed.secret(), Some("ats"));
        assert_eq!(bearer.secret(), None);
    }

    #[test]
    fn test_error_into_response() {
        let cases = vec![
            (OAuthError::AuthorizationDenied("declined".into()), None, Some("/oauth?error=access_denied")),
            (OAuthError::ProviderProtocol("no token".into()), None, Some("/oauth")),
            (OAuthError::IdentityFetch("500".into()), None, Some("/oauth")),
            (OAuthError::IdentityParse("not json".into()), None, Some("/oauth")),
            (OAuthError::ProviderUnavailable("timeout".into()), Some(503), None),
            (OAuthError::Configuration("missing".into()), Some(500), None),
        ];
        for (err, status, location) in cases {
            let resp = err.into_response("/oauth");
            assert_eq!(resp.redirect_location(), location, "location for {:?}", err);
            if let Some(code) = status {
                assert_eq!(resp.status_code(), code, "status for {:?}", err);
            }
        }
    }

    #[test]
    fn test_only_unavailability_is_retryable() {
        assert!(OAuthError::ProviderUnavailable("x".into()).is_retryable());
        assert!(!OAuthError::AuthorizationDenied("x".into()).is_retryable());
        assert!(!OAuthError::IdentityParse("x".into()).is_retryable());
    }
}

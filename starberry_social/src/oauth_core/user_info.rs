//! Identity fetch: one authenticated GET against the provider's user-info endpoint, mapped into
//! an [`IdentityRecord`] by a provider-supplied pure function.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument};

use super::crypto::OAuth1Signer;
use super::http_client::{HttpMethod, HttpRequest, OAuthHttpClient};
use super::types::{IdentityRecord, OAuthError, Token};

/// Maps a decoded user-info payload to the canonical record.
pub type IdentityMapper = fn(&Value) -> Result<IdentityRecord, String>;

/// How an OAuth2 access token is presented to the user-info endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>`.
    Bearer,
    /// `<name>: <prefix> <token>`, e.g. `Authorization: token <token>`.
    Header { name: &'static str, prefix: &'static str },
    /// Token sent as a query parameter with the given name.
    Query(&'static str),
}

#[derive(Debug, Clone)]
enum ResourceAuth {
    OAuth2(AuthStyle),
    OAuth1(OAuth1Signer),
}

/// Fetches and normalizes the authenticated user's identity.
#[derive(Debug, Clone)]
pub struct IdentityFetcher {
    /// User-info endpoint.
    pub user_info_url: String,
    auth: ResourceAuth,
    mapper: IdentityMapper,
    timeout: Option<Duration>,
}

impl IdentityFetcher {
    pub fn oauth2(user_info_url: impl Into<String>, style: AuthStyle, mapper: IdentityMapper) -> Self {
        Self {
            user_info_url: user_info_url.into(),
            auth: ResourceAuth::OAuth2(style),
            mapper,
            timeout: None,
        }
    }

    pub fn oauth1(user_info_url: impl Into<String>, signer: OAuth1Signer, mapper: IdentityMapper) -> Self {
        Self {
            user_info_url: user_info_url.into(),
            auth: ResourceAuth::OAuth1(signer),
            mapper,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build_request(&self, token: &Token) -> Result<HttpRequest, OAuthError> {
        let request = match (&self.auth, token) {
            (ResourceAuth::OAuth2(style), Token::Bearer(access_token)) => match style {
                AuthStyle::Bearer => HttpRequest::get(self.user_info_url.clone())
                    .header("Authorization", format!("Bearer {}", access_token)),
                AuthStyle::Header { name, prefix } => HttpRequest::get(self.user_info_url.clone())
                    .header(*name, format!("{} {}", prefix, access_token)),
                AuthStyle::Query(param) => HttpRequest::get(starberry_lib::append_query(
                    &self.user_info_url,
                    [(*param, access_token.as_str())],
                )),
            },
            (ResourceAuth::OAuth1(signer), Token::Signed { oauth_token, oauth_token_secret }) => {
                let header = signer.authorization_header(
                    HttpMethod::GET,
                    &self.user_info_url,
                    &[],
                    Some((oauth_token.as_str(), oauth_token_secret.as_str())),
                    &[],
                )?;
                HttpRequest::get(self.user_info_url.clone()).header("Authorization", header)
            }
            _ => {
                return Err(OAuthError::IdentityFetch(
                    "session token does not match the provider protocol".into(),
                ))
            }
        };
        Ok(request.header("Accept", "application/json").timeout(self.timeout))
    }

    /// Fetches the identity belonging to `token`.
    ///
    /// HTTP failures are [`OAuthError::IdentityFetch`]; an undecodable or unmappable payload is
    /// [`OAuthError::IdentityParse`].
    #[instrument(skip(self, http_client, token), fields(url = %self.user_info_url), level = "debug")]
    pub async fn user_info<C: OAuthHttpClient + ?Sized>(
        &self,
        http_client: &C,
        token: &Token,
    ) -> Result<IdentityRecord, OAuthError> {
        let request = self.build_request(token)?;
        let response = http_client.execute(request).await?;
        if !response.is_success() {
            return Err(OAuthError::IdentityFetch(format!(
                "user info endpoint answered {}",
                response.status
            )));
        }
        let payload: Value = serde_json::from_slice(&response.body)
            .map_err(|e| OAuthError::IdentityParse(format!("user info is not JSON: {}", e)))?;
        let record = (self.mapper)(&payload).map_err(OAuthError::IdentityParse)?;
        debug!(has_id = record.id.is_some(), has_email = record.email.is_some(), "identity fetched");
        Ok(record)
    }
}

/// String at a JSON pointer; numbers are rendered, empty strings count as absent.
pub fn string_at(payload: &Value, pointer: &str) -> Option<String> {
    match payload.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Boolean at a JSON pointer.
pub fn bool_at(payload: &Value, pointer: &str) -> Option<bool> {
    payload.pointer(pointer).and_then(Value::as_bool)
}

/// Requires the payload to be a JSON object.
pub fn expect_object(payload: &Value) -> Result<&serde_json::Map<String, Value>, String> {
    payload
        .as_object()
        .ok_or_else(|| "user info payload is not an object".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth_core::http_client::{HttpResponse, InMemoryHttpClient};
    use serde_json::json;

    const URL: &str = "https://api.test/me";

    fn simple(payload: &Value) -> Result<IdentityRecord, String> {
        expect_object(payload)?;
        Ok(IdentityRecord {
            id: string_at(payload, "/id"),
            email: string_at(payload, "/email"),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_bearer_fetch_maps_payload() {
        let http = InMemoryHttpClient::new();
        http.insert_response(URL, HttpResponse::json(200, &json!({"id": 42, "email": "a@b.com"})));
        let fetcher = IdentityFetcher::oauth2(URL, AuthStyle::Bearer, simple);
        let user = fetcher.user_info(&http, &Token::Bearer("tok1".into())).await.unwrap();
        assert_eq!(user.id.as_deref(), Some("42"));
        assert_eq!(user.email.as_deref(), Some("a@b.com"));
        assert_eq!(http.requests()[0].header_value("authorization"), Some("Bearer tok1"));
    }

    #[tokio::test]
    async fn test_query_style_token() {
        let http = InMemoryHttpClient::new();
        http.insert_response(URL, HttpResponse::json(200, &json!({"id": "1"})));
        let fetcher = IdentityFetcher::oauth2(URL, AuthStyle::Query("access_token"), simple);
        fetcher.user_info(&http, &Token::Bearer("t".into())).await.unwrap();
        assert_eq!(http.requests()[0].url, "https://api.test/me?access_token=t");
    }

    #[tokio::test]
    async fn test_fetch_and_parse_failures_are_distinguished() {
        let http = InMemoryHttpClient::new();
        let fetcher = IdentityFetcher::oauth2(URL, AuthStyle::Bearer, simple);
        let token = Token::Bearer("t".into());

        http.insert_response(URL, HttpResponse::json(401, &json!({"message": "bad credentials"})));
        assert!(matches!(fetcher.user_info(&http, &token).await, Err(OAuthError::IdentityFetch(_))));

        http.insert_response(URL, HttpResponse { status: 200, headers: vec![], body: b"<html>".to_vec() });
        assert!(matches!(fetcher.user_info(&http, &token).await, Err(OAuthError::IdentityParse(_))));

        http.insert_response(URL, HttpResponse::json(200, &json!(["not", "an", "object"])));
        assert!(matches!(fetcher.user_info(&http, &token).await, Err(OAuthError::IdentityParse(_))));
    }

    #[tokio::test]
    async fn test_token_protocol_mismatch() {
        let http = InMemoryHttpClient::new();
        let fetcher = IdentityFetcher::oauth2(URL, AuthStyle::Bearer, simple);
        let signed = Token::Signed { oauth_token: "a".into(), oauth_token_secret: "b".into() };
        assert!(matches!(fetcher.user_info(&http, &signed).await, Err(OAuthError::IdentityFetch(_))));
        assert_eq!(http.requests().len(), 0);
    }

    #[test]
    fn test_missing_id_is_not_an_error() {
        let record = simple(&json!({"email": ""})).unwrap();
        assert_eq!(record.id, None);
        assert_eq!(record.email, None);
    }
}

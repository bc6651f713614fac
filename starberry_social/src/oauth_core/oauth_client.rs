use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};
use starberry_lib::{append_query, encode_pairs};
use tracing::{debug, instrument};

use super::http_client::{parse_token_body, HttpRequest, OAuthHttpClient};
use super::types::{OAuthError, TokenResponse};

/// Token endpoint error codes that mean the grant itself was refused.
const DENIAL_CODES: &[&str] = &["invalid_grant", "access_denied", "bad_verification_code"];

/// OAuth2 authorization-code client for one application against one provider.
#[derive(Clone)]
pub struct OAuth2Flow {
    /// Client identifier.
    pub client_id: String,
    client_secret: String,
    /// OAuth2 authorization endpoint URL.
    pub authorize_url: String,
    /// OAuth2 token endpoint URL.
    pub access_token_url: String,
    /// Field of the token response holding the access token.
    pub access_token_key: String,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for OAuth2Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Flow")
            .field("client_id", &self.client_id)
            .field("authorize_url", &self.authorize_url)
            .field("access_token_url", &self.access_token_url)
            .finish_non_exhaustive()
    }
}

impl OAuth2Flow {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        authorize_url: impl Into<String>,
        access_token_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authorize_url: authorize_url.into(),
            access_token_url: access_token_url.into(),
            access_token_key: "access_token".to_string(),
            timeout: None,
        }
    }

    pub fn with_access_token_key(mut self, key: impl Into<String>) -> Self {
        self.access_token_key = key.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Constructs the authorization URL. Pure: the same inputs give the same URL.
    pub fn get_authorize_url(&self, scope: &str, redirect_uri: &str, state: Option<&str>) -> String {
        let mut params = vec![
            ("response_type", "code"),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope),
        ];
        if let Some(state) = state {
            params.push(("state", state));
        }
        append_query(&self.authorize_url, params)
    }

    /// Exchanges an authorization code for an access token.
    #[instrument(skip(self, http_client, code), level = "debug")]
    pub async fn get_access_token<C: OAuthHttpClient + ?Sized>(
        &self,
        http_client: &C,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        self.token_request(http_client, encode_pairs(form)).await
    }

    /// Trades a refresh token for a new access token.
    #[instrument(skip(self, http_client, refresh_token), level = "debug")]
    pub async fn refresh_access_token<C: OAuthHttpClient + ?Sized>(
        &self,
        http_client: &C,
        refresh_token: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        self.token_request(http_client, encode_pairs(form)).await
    }

    async fn token_request<C: OAuthHttpClient + ?Sized>(
        &self,
        http_client: &C,
        body: String,
    ) -> Result<TokenResponse, OAuthError> {
        let request = HttpRequest::post_form(self.access_token_url.clone(), body)
            .header("Accept", "application/json")
            .timeout(self.timeout);
        let response = http_client.execute(request).await?;
        let fields = parse_token_body(&response);

        // Some providers report a refused grant with a 200 and an `error` field.
        if let Some(code) = fields.as_ref().and_then(|f| f.get("error")).and_then(Value::as_str) {
            if DENIAL_CODES.contains(&code) {
                return Err(OAuthError::AuthorizationDenied(format!("token endpoint: {}", code)));
            }
            return Err(OAuthError::ProviderProtocol(format!(
                "token endpoint answered {} with error {}",
                response.status, code
            )));
        }
        if !response.is_success() {
            return Err(OAuthError::ProviderProtocol(format!(
                "token endpoint answered {}",
                response.status
            )));
        }
        let fields = fields
            .ok_or_else(|| OAuthError::ProviderProtocol("unparseable token response".into()))?;
        let response = self.token_response(fields)?;
        debug!(expires_in = ?response.expires_in, has_refresh = response.refresh_token.is_some(), "access token obtained");
        Ok(response)
    }

    fn token_response(&self, fields: HashMap<String, Value>) -> Result<TokenResponse, OAuthError> {
        let raw: Map<String, Value> = fields.into_iter().collect();
        let text = |key: &str| raw.get(key).and_then(Value::as_str).map(str::to_string);
        let access_token = text(&self.access_token_key)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                OAuthError::ProviderProtocol(format!(
                    "token response lacks {}",
                    self.access_token_key
                ))
            })?;
        // Form-encoded responses carry numbers as strings.
        let expires_in = raw.get("expires_in").and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        });
        Ok(TokenResponse {
            access_token,
            refresh_token: text("refresh_token"),
            expires_in,
            token_type: text("token_type"),
            scope: text("scope"),
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth_core::http_client::{HttpResponse, InMemoryHttpClient};
    use serde_json::json;

    const TOKEN_URL: &str = "https://provider.test/token";

    fn flow() -> OAuth2Flow {
        OAuth2Flow::new("cid", "secret", "https://provider.test/authorize", TOKEN_URL)
    }

    #[test]
    fn test_authorize_url() {
        let url = flow().get_authorize_url("read_user email", "https://app.test/oauth", Some("st"));
        assert_eq!(
            url,
            "https://provider.test/authorize?response_type=code&client_id=cid&redirect_uri=https%3A%2F%2Fapp.test%2Foauth&scope=read_user%20email&state=st"
        );
        assert_eq!(url, flow().get_authorize_url("read_user email", "https://app.test/oauth", Some("st")));
        assert!(!flow().get_authorize_url("s", "r", None).contains("state="));
    }

    #[tokio::test]
    async fn test_exchange_posts_grant() {
        let http = InMemoryHttpClient::new();
        http.insert_response(
            TOKEN_URL,
            HttpResponse::json(200, &json!({"access_token": "tok1", "expires_in": 3600, "refresh_token": "r1"})),
        );
        let token = flow().get_access_token(&http, "abc123", "https://app.test/oauth").await.unwrap();
        assert_eq!(token.access_token, "tok1");
        assert_eq!(token.expires_in, Some(3600));
        assert_eq!(token.refresh_token.as_deref(), Some("r1"));

        let body = http.requests()[0].body_text().unwrap();
        assert!(body.contains("grant_type=authorization_code"));
        assert!(body.contains("code=abc123"));
        assert!(body.contains("client_secret=secret"));
    }

    #[tokio::test]
    async fn test_form_response_and_custom_key() {
        let http = InMemoryHttpClient::new();
        http.insert_response(TOKEN_URL, HttpResponse::form(200, "token=t9&expires_in=60"));
        let token = flow()
            .with_access_token_key("token")
            .get_access_token(&http, "c", "r")
            .await
            .unwrap();
        assert_eq!(token.access_token, "t9");
        assert_eq!(token.expires_in, Some(60));
    }

    #[tokio::test]
    async fn test_missing_token_field_is_protocol_error() {
        let http = InMemoryHttpClient::new();
        http.insert_response(TOKEN_URL, HttpResponse::json(200, &json!({"token_type": "bearer"})));
        let err = flow().get_access_token(&http, "c", "r").await.unwrap_err();
        assert!(matches!(err, OAuthError::ProviderProtocol(_)));

        http.insert_response(TOKEN_URL, HttpResponse::json(500, &json!({})));
        let err = flow().get_access_token(&http, "c", "r").await.unwrap_err();
        assert!(matches!(err, OAuthError::ProviderProtocol(_)));
    }

    #[tokio::test]
    async fn test_refused_grant_is_denied() {
        let http = InMemoryHttpClient::new();
        http.insert_response(TOKEN_URL, HttpResponse::json(400, &json!({"error": "invalid_grant"})));
        let err = flow().get_access_token(&http, "expired", "r").await.unwrap_err();
        assert!(matches!(err, OAuthError::AuthorizationDenied(_)));
    }

    #[tokio::test]
    async fn test_refresh() {
        let http = InMemoryHttpClient::new();
        http.insert_response(TOKEN_URL, HttpResponse::json(200, &json!({"access_token": "tok2"})));
        let token = flow().refresh_access_token(&http, "r1").await.unwrap();
        assert_eq!(token.access_token, "tok2");
        let body = http.requests()[0].body_text().unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=r1"));
    }
}

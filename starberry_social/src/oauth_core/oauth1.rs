//! Three-legged OAuth 1.0a flow: request token, authorize redirect, access token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use starberry_lib::append_query;
use tracing::{debug, instrument};

use super::crypto::{OAuth1Signer, SigningEntropy};
use super::http_client::{parse_token_body, HttpMethod, HttpRequest, HttpResponse, OAuthHttpClient};
use super::types::{OAuthError, RequestToken, Token};

/// OAuth1 client for one consumer against one provider.
#[derive(Clone, Debug)]
pub struct OAuth1Flow {
    signer: OAuth1Signer,
    /// Temporary credential endpoint.
    pub request_token_url: String,
    /// Resource owner authorization endpoint.
    pub authorize_url: String,
    /// Token credential endpoint.
    pub access_token_url: String,
    timeout: Option<Duration>,
}

impl OAuth1Flow {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        request_token_url: impl Into<String>,
        authorize_url: impl Into<String>,
        access_token_url: impl Into<String>,
        entropy: Arc<dyn SigningEntropy>,
    ) -> Self {
        Self {
            signer: OAuth1Signer::new(consumer_key, consumer_secret, entropy),
            request_token_url: request_token_url.into(),
            authorize_url: authorize_url.into(),
            access_token_url: access_token_url.into(),
            timeout: None,
        }
    }

    /// Caller-imposed timeout for every outbound call of this flow.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signer(&self) -> &OAuth1Signer {
        &self.signer
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// First leg: obtains temporary credentials bound to `callback_url`.
    #[instrument(skip(self, http_client), level = "debug")]
    pub async fn get_request_token<C: OAuthHttpClient + ?Sized>(
        &self,
        http_client: &C,
        callback_url: &str,
    ) -> Result<RequestToken, OAuthError> {
        let header = self.signer.authorization_header(
            HttpMethod::POST,
            &self.request_token_url,
            &[],
            None,
            &[("oauth_callback", callback_url)],
        )?;
        let request = HttpRequest::post_form(self.request_token_url.clone(), String::new())
            .header("Authorization", header)
            .timeout(self.timeout);
        let response = http_client.execute(request).await?;
        if !response.is_success() {
            return Err(OAuthError::ProviderProtocol(format!(
                "request token endpoint answered {}",
                response.status
            )));
        }
        let fields = token_fields(&response, "request token")?;
        let callback_confirmed = fields
            .get("oauth_callback_confirmed")
            .and_then(Value::as_str)
            .map(|v| v == "true")
            .unwrap_or(false);
        debug!(callback_confirmed, "obtained request token");
        Ok(RequestToken {
            oauth_token: required(&fields, "oauth_token", "request token")?,
            oauth_token_secret: required(&fields, "oauth_token_secret", "request token")?,
            callback_confirmed,
        })
    }

    /// Second leg: where to send the user to grant access. No I/O.
    pub fn get_authorize_url(&self, request_token: &str) -> String {
        append_query(&self.authorize_url, [("oauth_token", request_token)])
    }

    /// Third leg: trades the verifier for token credentials, signing with the request token
    /// secret.
    #[instrument(skip(self, http_client, verifier, request_token, request_token_secret), level = "debug")]
    pub async fn get_access_token<C: OAuthHttpClient + ?Sized>(
        &self,
        http_client: &C,
        verifier: &str,
        request_token: &str,
        request_token_secret: &str,
    ) -> Result<Token, OAuthError> {
        let header = self.signer.authorization_header(
            HttpMethod::POST,
            &self.access_token_url,
            &[],
            Some((request_token, request_token_secret)),
            &[("oauth_verifier", verifier)],
        )?;
        let request = HttpRequest::post_form(self.access_token_url.clone(), String::new())
            .header("Authorization", header)
            .timeout(self.timeout);
        let response = http_client.execute(request).await?;
        if response.is_client_error() {
            return Err(OAuthError::AuthorizationDenied(format!(
                "access token endpoint rejected the verifier with {}",
                response.status
            )));
        }
        if !response.is_success() {
            return Err(OAuthError::ProviderProtocol(format!(
                "access token endpoint answered {}",
                response.status
            )));
        }
        let fields = token_fields(&response, "access token")?;
        Ok(Token::Signed {
            oauth_token: required(&fields, "oauth_token", "access token")?,
            oauth_token_secret: required(&fields, "oauth_token_secret", "access token")?,
        })
    }
}

fn token_fields(response: &HttpResponse, what: &str) -> Result<HashMap<String, Value>, OAuthError> {
    parse_token_body(response)
        .ok_or_else(|| OAuthError::ProviderProtocol(format!("unparseable {} response", what)))
}

fn required(fields: &HashMap<String, Value>, key: &str, what: &str) -> Result<String, OAuthError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| OAuthError::ProviderProtocol(format!("{} response lacks {}", what, key)))
}

//! OAuth 1.0 request signing (HMAC-SHA1, RFC 5849 §3.4) using `ring`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::hmac;
use starberry_lib::{encode_url_owned, random_alphanumeric_string};
use url::Url;

use super::http_client::HttpMethod;
use super::types::OAuthError;

pub const SIGNATURE_METHOD: &str = "HMAC-SHA1";
pub const OAUTH_VERSION: &str = "1.0";

/// Source of the per-request nonce and timestamp.
pub trait SigningEntropy: Send + Sync + 'static {
    fn nonce(&self) -> String;
    /// Seconds since the Unix epoch.
    fn timestamp(&self) -> u64;
}

/// Random nonce and wall-clock timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEntropy;

impl SigningEntropy for SystemEntropy {
    fn nonce(&self) -> String {
        random_alphanumeric_string(32)
    }

    fn timestamp(&self) -> u64 {
        chrono::Utc::now().timestamp().max(0) as u64
    }
}

/// Fixed nonce and timestamp, for reproducible signatures.
#[derive(Debug, Clone)]
pub struct FixedEntropy {
    pub nonce: String,
    pub timestamp: u64,
}

impl SigningEntropy for FixedEntropy {
    fn nonce(&self) -> String {
        self.nonce.clone()
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// Splits a URL into its base string URI (`scheme://host[:port]/path`) and its decoded query
/// parameters. Default ports are dropped, scheme and host are lowercased.
pub fn normalize_url(url: &str) -> Result<(String, Vec<(String, String)>), OAuthError> {
    let parsed = Url::parse(url)
        .map_err(|e| OAuthError::Configuration(format!("invalid URL {}: {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| OAuthError::Configuration(format!("URL without host: {}", url)))?;
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();
    let base = format!("{}://{}{}{}", parsed.scheme(), host.to_lowercase(), port, parsed.path());
    let query = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok((base, query))
}

/// Builds the signature base string from the method, URL and every request parameter
/// (protocol, query and form body parameters alike).
pub fn signature_base_string(
    method: HttpMethod,
    url: &str,
    params: &[(String, String)],
) -> Result<String, OAuthError> {
    let (base_url, query) = normalize_url(url)?;
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .chain(query.iter())
        .filter(|(k, _)| k != "oauth_signature")
        .map(|(k, v)| (encode_url_owned(k), encode_url_owned(v)))
        .collect();
    encoded.sort();
    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    Ok(format!(
        "{}&{}&{}",
        method.as_str().to_uppercase(),
        encode_url_owned(&base_url),
        encode_url_owned(&normalized)
    ))
}

/// `encode(consumer_secret)&encode(token_secret)`; the token half is empty before a token exists.
pub fn signing_key(consumer_secret: &str, token_secret: Option<&str>) -> String {
    format!(
        "{}&{}",
        encode_url_owned(consumer_secret),
        encode_url_owned(token_secret.unwrap_or(""))
    )
}

/// HMAC-SHA1 of `data` under `key`, base64 encoded.
pub fn hmac_sha1_sign(key: &str, data: &str) -> String {
    let s_key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key.as_bytes());
    let tag = hmac::sign(&s_key, data.as_bytes());
    STANDARD.encode(tag.as_ref())
}

/// Signs a request. Pure: the same inputs always give the same signature.
pub fn sign(
    method: HttpMethod,
    url: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    token_secret: Option<&str>,
) -> Result<String, OAuthError> {
    let base = signature_base_string(method, url, params)?;
    Ok(hmac_sha1_sign(&signing_key(consumer_secret, token_secret), &base))
}

/// Signs outbound requests on behalf of one consumer.
#[derive(Clone)]
pub struct OAuth1Signer {
    consumer_key: String,
    consumer_secret: String,
    entropy: Arc<dyn SigningEntropy>,
}

impl std::fmt::Debug for OAuth1Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Signer")
            .field("consumer_key", &self.consumer_key)
            .finish_non_exhaustive()
    }
}

impl OAuth1Signer {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        entropy: Arc<dyn SigningEntropy>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            entropy,
        }
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    /// Protocol parameters for one request, without the signature.
    fn protocol_params(&self, token: Option<&str>, extra: &[(&str, &str)]) -> Vec<(String, String)> {
        let mut params = vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.clone()),
            ("oauth_nonce".to_string(), self.entropy.nonce()),
            ("oauth_signature_method".to_string(), SIGNATURE_METHOD.to_string()),
            ("oauth_timestamp".to_string(), self.entropy.timestamp().to_string()),
            ("oauth_version".to_string(), OAUTH_VERSION.to_string()),
        ];
        if let Some(token) = token {
            params.push(("oauth_token".to_string(), token.to_string()));
        }
        params.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        params
    }

    /// Signs a request and returns its `Authorization: OAuth ...` header value.
    ///
    /// `request_params` are the query and form body parameters sent alongside; `extra` holds
    /// additional protocol parameters such as `oauth_callback` or `oauth_verifier`.
    pub fn authorization_header(
        &self,
        method: HttpMethod,
        url: &str,
        request_params: &[(String, String)],
        token: Option<(&str, &str)>,
        extra: &[(&str, &str)],
    ) -> Result<String, OAuthError> {
        let mut protocol = self.protocol_params(token.map(|(t, _)| t), extra);
        let all: Vec<(String, String)> = protocol
            .iter()
            .chain(request_params.iter())
            .cloned()
            .collect();
        let signature = sign(method, url, &all, &self.consumer_secret, token.map(|(_, s)| s))?;
        protocol.push(("oauth_signature".to_string(), signature));
        let fields = protocol
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", encode_url_owned(k), encode_url_owned(v)))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!("OAuth {}", fields))
    }
}

/// Reads the protocol parameters back out of an `Authorization: OAuth ...` header.
pub fn parse_authorization_header(header: &str) -> Vec<(String, String)> {
    header
        .trim()
        .strip_prefix("OAuth ")
        .unwrap_or("")
        .split(',')
        .filter_map(|field| {
            let (k, v) = field.trim().split_once('=')?;
            Some((
                starberry_lib::decode_url_owned(k),
                starberry_lib::decode_url_owned(v.trim_matches('"')),
            ))
        })
        .collect()
}

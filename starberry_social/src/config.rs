//! Settings for the social login layer, loadable from TOML or JSON.
//!
//! Two shapes are accepted. The legacy single-provider shape names one provider class at the
//! top level:
//!
//! ```toml
//! provider = "gitlab"
//! redirect_uri = "http://127.0.0.1:8888/oauth"
//! scope = "read_user"
//! client_id = "..."
//! client_secret = "..."
//! ```
//!
//! The multi-provider shape adds a `providers` table. Each entry overrides the top-level values,
//! which act as fallbacks, and at most one entry is the default:
//!
//! ```toml
//! redirect_uri = "http://127.0.0.1:8888/oauth"
//! scope = "email"
//!
//! [providers.discord]
//! provider_class = "discord"
//! scope = "identify email"
//! default = true
//!
//! [providers.gitlab]
//! scope = "read_user"
//! ```
//!
//! An entry named `default` is an alias rather than a provider: its `provider` names the entry
//! to use as the default.
//!
//! ```toml
//! [providers.default]
//! provider = "discord"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::oauth_core::types::OAuthError;

pub const DEFAULT_ENDPOINT_PATH: &str = "/oauth";
pub const DEFAULT_AFTER_AUTH_REDIRECT: &str = "/";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
/// Reserved `providers` key that aliases the default entry.
pub const DEFAULT_ALIAS_KEY: &str = "default";

/// Top-level settings. Every per-provider field falls back to the value here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    /// Provider class of the legacy single-provider setup.
    pub provider: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    /// Callback path; `/oauth` when unset.
    pub endpoint_path: Option<String>,
    /// Regular expression the user's email must match from its first character.
    pub email_filter: Option<String>,
    /// Where to land after login when no original path was recorded; `/` when unset.
    pub after_auth_redirect: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    /// Timeout for each outbound provider call; 30 seconds when unset.
    pub request_timeout_secs: Option<u64>,
    /// Name of the default entry in `providers`, as an alternative to its `default` flag.
    pub default_provider: Option<String>,
    pub providers: BTreeMap<String, ProviderSettings>,
}

/// Per-provider overrides in multi-provider mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider class; the entry's name when unset.
    #[serde(alias = "provider")]
    pub provider_class: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub endpoint_path: Option<String>,
    pub email_filter: Option<String>,
    pub after_auth_redirect: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub request_timeout_secs: Option<u64>,
    /// Endpoint overrides, e.g. for a self-hosted GitLab.
    pub authorize_url: Option<String>,
    pub access_token_url: Option<String>,
    pub request_token_url: Option<String>,
    pub user_info_url: Option<String>,
    pub default: bool,
}

impl OAuthSettings {
    pub fn from_toml_str(input: &str) -> Result<Self, OAuthError> {
        toml::from_str(input)
            .map_err(|e| OAuthError::Configuration(format!("invalid TOML settings: {}", e)))
    }

    pub fn from_json_str(input: &str) -> Result<Self, OAuthError> {
        serde_json::from_str(input)
            .map_err(|e| OAuthError::Configuration(format!("invalid JSON settings: {}", e)))
    }

    /// Legacy single-provider settings.
    pub fn single(
        provider: impl Into<String>,
        redirect_uri: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            provider: Some(provider.into()),
            redirect_uri: Some(redirect_uri.into()),
            scope: Some(scope.into()),
            ..Self::default()
        }
    }

    /// Whether the multi-provider table is in use.
    pub fn is_multi_provider(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Entry named by the `default` alias in `providers`, if the alias is present.
    pub fn default_alias(&self) -> Option<Option<&str>> {
        self.providers
            .get(DEFAULT_ALIAS_KEY)
            .map(|alias| alias.provider_class.as_deref())
    }

    /// Provider entries with top-level fallbacks applied, keyed by provider name.
    ///
    /// The legacy shape yields a single entry named after its provider class.
    pub fn effective_providers(&self) -> BTreeMap<String, ProviderSettings> {
        if !self.is_multi_provider() {
            return match &self.provider {
                Some(class) => {
                    let mut entry = self.fallback(&ProviderSettings::default());
                    entry.provider_class = Some(class.clone());
                    BTreeMap::from([(class.clone(), entry)])
                }
                None => BTreeMap::new(),
            };
        }
        let alias = self.default_alias().flatten();
        self.providers
            .iter()
            .filter(|(name, _)| name.as_str() != DEFAULT_ALIAS_KEY)
            .map(|(name, entry)| {
                let mut merged = self.fallback(entry);
                merged.provider_class = entry.provider_class.clone().or_else(|| Some(name.clone()));
                merged.default = entry.default
                    || self.default_provider.as_deref() == Some(name.as_str())
                    || alias == Some(name.as_str());
                (name.clone(), merged)
            })
            .collect()
    }

    fn fallback(&self, entry: &ProviderSettings) -> ProviderSettings {
        let pick = |own: &Option<String>, top: &Option<String>| own.clone().or_else(|| top.clone());
        ProviderSettings {
            provider_class: entry.provider_class.clone(),
            redirect_uri: pick(&entry.redirect_uri, &self.redirect_uri),
            scope: pick(&entry.scope, &self.scope),
            endpoint_path: pick(&entry.endpoint_path, &self.endpoint_path),
            email_filter: pick(&entry.email_filter, &self.email_filter),
            after_auth_redirect: pick(&entry.after_auth_redirect, &self.after_auth_redirect),
            client_id: pick(&entry.client_id, &self.client_id),
            client_secret: pick(&entry.client_secret, &self.client_secret),
            consumer_key: pick(&entry.consumer_key, &self.consumer_key),
            consumer_secret: pick(&entry.consumer_secret, &self.consumer_secret),
            request_timeout_secs: entry.request_timeout_secs.or(self.request_timeout_secs),
            authorize_url: entry.authorize_url.clone(),
            access_token_url: entry.access_token_url.clone(),
            request_token_url: entry.request_token_url.clone(),
            user_info_url: entry.user_info_url.clone(),
            default: entry.default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_settings_from_toml() {
        let settings = OAuthSettings::from_toml_str(
            r#"
            provider = "gitlab"
            redirect_uri = "http://127.0.0.1:8888/oauth"
            scope = "read_user"
            client_id = "id"
            client_secret = "secret"
            "#,
        )
        .unwrap();
        let providers = settings.effective_providers();
        assert_eq!(providers.len(), 1);
        let gitlab = &providers["gitlab"];
        assert_eq!(gitlab.provider_class.as_deref(), Some("gitlab"));
        assert_eq!(gitlab.scope.as_deref(), Some("read_user"));
        assert_eq!(gitlab.client_id.as_deref(), Some("id"));
        assert_eq!(gitlab.endpoint_path, None);
    }

    #[test]
    fn test_multi_provider_fallback_and_default() {
        let settings = OAuthSettings::from_json_str(
            r#"{
                "redirect_uri": "http://127.0.0.1:8888/oauth",
                "scope": "email",
                "default_provider": "discord",
                "providers": {
                    "discord": {"provider": "discord", "scope": "identify email"},
                    "gitlab": {"client_id": "g"}
                }
            }"#,
        )
        .unwrap();
        let providers = settings.effective_providers();
        assert_eq!(providers["discord"].scope.as_deref(), Some("identify email"));
        assert!(providers["discord"].default);
        assert_eq!(providers["gitlab"].scope.as_deref(), Some("email"));
        assert_eq!(providers["gitlab"].provider_class.as_deref(), Some("gitlab"));
        assert_eq!(
            providers["gitlab"].redirect_uri.as_deref(),
            Some("http://127.0.0.1:8888/oauth")
        );
        assert!(!providers["gitlab"].default);
    }

    #[test]
    fn test_default_alias_entry_marks_the_default() {
        let settings = OAuthSettings::from_toml_str(
            r#"
            redirect_uri = "http://127.0.0.1:8888/oauth"

            [providers.discord]
            scope = "identify email"

            [providers.gitlab]
            scope = "read_user"

            [providers.default]
            provider = "discord"
            "#,
        )
        .unwrap();
        assert_eq!(settings.default_alias(), Some(Some("discord")));
        let providers = settings.effective_providers();
        assert_eq!(providers.keys().collect::<Vec<_>>(), vec!["discord", "gitlab"]);
        assert!(providers["discord"].default);
        assert!(!providers["gitlab"].default);
    }

    #[test]
    fn test_invalid_settings_are_configuration_errors() {
        let err = OAuthSettings::from_toml_str("scope = [").unwrap_err();
        assert!(matches!(err, OAuthError::Configuration(_)));
        assert!(OAuthSettings::default().effective_providers().is_empty());
    }
}

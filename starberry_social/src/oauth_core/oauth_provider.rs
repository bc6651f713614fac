//! Provider definitions and the registry that resolves a provider name to a ready-to-use,
//! read-only [`ProviderConfig`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, warn};

use super::crypto::{SigningEntropy, SystemEntropy};
use super::oauth1::OAuth1Flow;
use super::oauth_client::OAuth2Flow;
use super::user_info::{AuthStyle, IdentityFetcher, IdentityMapper};
use super::types::{Credentials, OAuthError, ProtocolVariant};
use crate::config::{
    OAuthSettings, ProviderSettings, DEFAULT_AFTER_AUTH_REDIRECT, DEFAULT_ALIAS_KEY,
    DEFAULT_ENDPOINT_PATH, DEFAULT_REQUEST_TIMEOUT_SECS,
};

/// What a provider class is: its protocol, endpoints and identity mapping.
#[derive(Debug, Clone)]
pub struct ProviderDefinition {
    pub class: String,
    pub variant: ProtocolVariant,
    pub authorize_url: String,
    pub access_token_url: String,
    /// OAuth1 only.
    pub request_token_url: Option<String>,
    pub user_info_url: String,
    /// Token response field holding the access token (OAuth2).
    pub access_token_key: String,
    pub auth_style: AuthStyle,
    pub parse_user: IdentityMapper,
}

impl ProviderDefinition {
    pub fn oauth2(
        class: impl Into<String>,
        authorize_url: impl Into<String>,
        access_token_url: impl Into<String>,
        user_info_url: impl Into<String>,
        parse_user: IdentityMapper,
    ) -> Self {
        Self {
            class: class.into(),
            variant: ProtocolVariant::OAuth2,
            authorize_url: authorize_url.into(),
            access_token_url: access_token_url.into(),
            request_token_url: None,
            user_info_url: user_info_url.into(),
            access_token_key: "access_token".into(),
            auth_style: AuthStyle::Bearer,
            parse_user,
        }
    }

    pub fn oauth1(
        class: impl Into<String>,
        request_token_url: impl Into<String>,
        authorize_url: impl Into<String>,
        access_token_url: impl Into<String>,
        user_info_url: impl Into<String>,
        parse_user: IdentityMapper,
    ) -> Self {
        Self {
            class: class.into(),
            variant: ProtocolVariant::OAuth1,
            authorize_url: authorize_url.into(),
            access_token_url: access_token_url.into(),
            request_token_url: Some(request_token_url.into()),
            user_info_url: user_info_url.into(),
            access_token_key: "oauth_token".into(),
            auth_style: AuthStyle::Bearer,
            parse_user,
        }
    }

    pub fn with_auth_style(mut self, style: AuthStyle) -> Self {
        self.auth_style = style;
        self
    }

    pub fn with_access_token_key(mut self, key: impl Into<String>) -> Self {
        self.access_token_key = key.into();
        self
    }

    /// Checks that the definition can drive its protocol.
    fn validate(&self) -> Result<(), OAuthError> {
        let mut urls = vec![
            ("authorize_url", self.authorize_url.as_str()),
            ("access_token_url", self.access_token_url.as_str()),
            ("user_info_url", self.user_info_url.as_str()),
        ];
        match (self.variant, &self.request_token_url) {
            (ProtocolVariant::OAuth1, Some(url)) => urls.push(("request_token_url", url.as_str())),
            (ProtocolVariant::OAuth1, None) => {
                return Err(OAuthError::Configuration(format!(
                    "OAuth1 provider class {} has no request_token_url",
                    self.class
                )))
            }
            (ProtocolVariant::OAuth2, _) => {}
        }
        for (field, value) in urls {
            url::Url::parse(value).map_err(|e| {
                OAuthError::Configuration(format!(
                    "provider class {} has an invalid {}: {}",
                    self.class, field, e
                ))
            })?;
        }
        Ok(())
    }
}

/// Startup registration table of provider classes.
#[derive(Debug, Clone, Default)]
pub struct ProviderCatalog {
    definitions: HashMap<String, ProviderDefinition>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every bundled provider.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for definition in crate::social::providers::builtin_definitions() {
            catalog.register(definition);
        }
        catalog
    }

    /// Adds or replaces a provider class.
    pub fn register(&mut self, definition: ProviderDefinition) -> &mut Self {
        self.definitions.insert(definition.class.to_lowercase(), definition);
        self
    }

    /// Looks up a class, case-insensitively.
    pub fn get(&self, class: &str) -> Option<&ProviderDefinition> {
        self.definitions.get(&class.to_lowercase())
    }

    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }
}

/// Protocol client of one configured provider.
#[derive(Debug, Clone)]
pub enum ProtocolFlow {
    OAuth1(OAuth1Flow),
    OAuth2(OAuth2Flow),
}

/// Fully resolved provider. Immutable once the registry is built.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub variant: ProtocolVariant,
    pub scope: String,
    pub redirect_uri: String,
    pub endpoint_path: String,
    pub email_filter: Option<Regex>,
    pub after_auth_redirect: String,
    pub request_timeout: Duration,
    credentials: Credentials,
    flow: ProtocolFlow,
    fetcher: IdentityFetcher,
}

impl ProviderConfig {
    fn build(
        name: &str,
        entry: &ProviderSettings,
        catalog: &ProviderCatalog,
        entropy: &Arc<dyn SigningEntropy>,
    ) -> Result<Self, OAuthError> {
        let class = entry.provider_class.as_deref().unwrap_or(name);
        let mut definition = catalog
            .get(class)
            .cloned()
            .ok_or_else(|| {
                OAuthError::Configuration(format!(
                    "provider {} uses unknown class {} (known: {})",
                    name,
                    class,
                    catalog.classes().join(", ")
                ))
            })?;
        if let Some(url) = &entry.authorize_url {
            definition.authorize_url = url.clone();
        }
        if let Some(url) = &entry.access_token_url {
            definition.access_token_url = url.clone();
        }
        if let Some(url) = &entry.request_token_url {
            definition.request_token_url = Some(url.clone());
        }
        if let Some(url) = &entry.user_info_url {
            definition.user_info_url = url.clone();
        }
        definition.validate()?;

        let missing = |field: &str| {
            OAuthError::Configuration(format!("provider {} is missing {}", name, field))
        };
        let scope = entry.scope.clone().ok_or_else(|| missing("scope"))?;
        let redirect_uri = entry.redirect_uri.clone().ok_or_else(|| missing("redirect_uri"))?;
        let endpoint_path = entry
            .endpoint_path
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT_PATH.to_string());
        if !endpoint_path.starts_with('/') {
            return Err(OAuthError::Configuration(format!(
                "provider {} endpoint_path must start with '/'",
                name
            )));
        }
        let email_filter = entry
            .email_filter
            .as_deref()
            .map(compile_email_filter)
            .transpose()?;
        let request_timeout = Duration::from_secs(
            entry.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );

        let credentials = match definition.variant {
            ProtocolVariant::OAuth2 => match (&entry.client_id, &entry.client_secret) {
                (Some(id), Some(secret)) => Credentials::OAuth2 {
                    client_id: id.clone(),
                    client_secret: secret.clone(),
                },
                _ => return Err(missing("client_id/client_secret")),
            },
            ProtocolVariant::OAuth1 => match (&entry.consumer_key, &entry.consumer_secret) {
                (Some(key), Some(secret)) => Credentials::OAuth1 {
                    consumer_key: key.clone(),
                    consumer_secret: secret.clone(),
                },
                _ => return Err(missing("consumer_key/consumer_secret")),
            },
        };

        let (flow, fetcher) = match &credentials {
            Credentials::OAuth2 { client_id, client_secret } => {
                let flow = OAuth2Flow::new(
                    client_id.clone(),
                    client_secret.clone(),
                    definition.authorize_url.clone(),
                    definition.access_token_url.clone(),
                )
                .with_access_token_key(definition.access_token_key.clone())
                .with_timeout(request_timeout);
                let fetcher = IdentityFetcher::oauth2(
                    definition.user_info_url.clone(),
                    definition.auth_style,
                    definition.parse_user,
                );
                (ProtocolFlow::OAuth2(flow), fetcher)
            }
            Credentials::OAuth1 { consumer_key, consumer_secret } => {
                let flow = OAuth1Flow::new(
                    consumer_key.clone(),
                    consumer_secret.clone(),
                    definition.request_token_url.clone().unwrap_or_default(),
                    definition.authorize_url.clone(),
                    definition.access_token_url.clone(),
                    Arc::clone(entropy),
                )
                .with_timeout(request_timeout);
                let fetcher = IdentityFetcher::oauth1(
                    definition.user_info_url.clone(),
                    flow.signer().clone(),
                    definition.parse_user,
                );
                (ProtocolFlow::OAuth1(flow), fetcher)
            }
        };

        Ok(Self {
            name: name.to_string(),
            variant: definition.variant,
            scope,
            redirect_uri,
            endpoint_path,
            email_filter,
            after_auth_redirect: entry
                .after_auth_redirect
                .clone()
                .unwrap_or_else(|| DEFAULT_AFTER_AUTH_REDIRECT.to_string()),
            request_timeout,
            credentials,
            flow,
            fetcher: fetcher.with_timeout(request_timeout),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn flow(&self) -> &ProtocolFlow {
        &self.flow
    }

    pub fn identity_fetcher(&self) -> &IdentityFetcher {
        &self.fetcher
    }
}

/// Compiles an email filter. The pattern must match from the first character of the email.
pub fn compile_email_filter(pattern: &str) -> Result<Regex, OAuthError> {
    Regex::new(&format!("^(?:{})", pattern))
        .map_err(|e| OAuthError::Configuration(format!("invalid email filter {:?}: {}", pattern, e)))
}

/// Whether `email` passes `filter`. Identities without an email are not filtered.
pub fn email_allowed(filter: &Regex, email: Option<&str>) -> bool {
    email.is_none_or(|e| filter.is_match(e))
}

/// Name to provider lookup, shared read-only by every request.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, ProviderConfig>,
    default: Option<String>,
}

impl ProviderRegistry {
    /// Builds the registry with wall-clock signing entropy.
    pub fn from_settings(settings: &OAuthSettings, catalog: &ProviderCatalog) -> Result<Self, OAuthError> {
        Self::from_settings_with_entropy(settings, catalog, Arc::new(SystemEntropy))
    }

    /// Builds and validates the registry. Every failure here is fatal at startup.
    pub fn from_settings_with_entropy(
        settings: &OAuthSettings,
        catalog: &ProviderCatalog,
        entropy: Arc<dyn SigningEntropy>,
    ) -> Result<Self, OAuthError> {
        let result = Self::build(settings, catalog, &entropy);
        if let Err(err) = &result {
            error!(error = %err, "social login configuration rejected");
        }
        result
    }

    fn build(
        settings: &OAuthSettings,
        catalog: &ProviderCatalog,
        entropy: &Arc<dyn SigningEntropy>,
    ) -> Result<Self, OAuthError> {
        let entries = settings.effective_providers();
        if entries.is_empty() {
            return Err(OAuthError::Configuration(
                "no OAuth provider configured: set `provider` or `providers`".into(),
            ));
        }
        if let Some(alias) = settings.default_alias() {
            match alias {
                Some(name) if entries.contains_key(name) => {}
                other => {
                    return Err(OAuthError::Configuration(format!(
                        "providers.{} must name a configured provider entry, got {:?}",
                        DEFAULT_ALIAS_KEY, other
                    )));
                }
            }
        }
        if let Some(name) = &settings.default_provider {
            if !entries.contains_key(name) {
                return Err(OAuthError::Configuration(format!(
                    "default_provider {} is not configured",
                    name
                )));
            }
        }
        let defaults: Vec<&String> = entries
            .iter()
            .filter(|(_, entry)| entry.default)
            .map(|(name, _)| name)
            .collect();
        if defaults.len() > 1 {
            return Err(OAuthError::Configuration(format!(
                "more than one default provider: {:?}",
                defaults
            )));
        }
        let default = defaults.first().map(|name| name.to_string());
        if default.is_none() && entries.len() > 1 {
            warn!(
                providers = ?entries.keys().collect::<Vec<_>>(),
                "several providers and no default: every guarded route must name its provider"
            );
        }

        let mut providers = BTreeMap::new();
        for (name, entry) in &entries {
            let config = ProviderConfig::build(name, entry, catalog, entropy)?;
            debug!(provider = %name, variant = ?config.variant, endpoint = %config.endpoint_path, "provider registered");
            providers.insert(name.clone(), config);
        }
        Ok(Self { providers, default })
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.values()
    }

    /// Name of the provider used when nothing else selects one: the marked default, or the
    /// only provider.
    pub fn default_name(&self) -> Option<&str> {
        match &self.default {
            Some(name) => Some(name.as_str()),
            None if self.providers.len() == 1 => self.providers.keys().next().map(String::as_str),
            None => None,
        }
    }

    /// Whether guards must name a provider because nothing else selects one.
    pub fn needs_route_provider(&self) -> bool {
        self.default_name().is_none()
    }

    pub fn is_default(&self, name: &str) -> bool {
        self.default_name() == Some(name)
    }

    /// Resolves the provider for a request: explicit choice, then the session's remembered
    /// provider, then the default.
    ///
    /// An unknown explicit name is an error; an unknown remembered name (stale session) is
    /// skipped.
    pub fn resolve(
        &self,
        explicit: Option<&str>,
        remembered: Option<&str>,
    ) -> Result<&ProviderConfig, OAuthError> {
        if let Some(name) = explicit {
            return self
                .get(name)
                .ok_or_else(|| OAuthError::Configuration(format!("unknown provider {}", name)));
        }
        if let Some(config) = remembered.and_then(|name| self.get(name)) {
            return Ok(config);
        }
        self.default_name()
            .and_then(|name| self.get(name))
            .ok_or_else(|| {
                OAuthError::Configuration(
                    "several providers configured, none selected and no default".into(),
                )
            })
    }

    /// Every distinct callback path, sorted.
    pub fn endpoint_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.providers.values().map(|p| p.endpoint_path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        paths
    }

    /// The provider owning `path` when exactly one provider uses it.
    pub fn provider_for_path(&self, path: &str) -> Option<&ProviderConfig> {
        let mut matching = self.providers.values().filter(|p| p.endpoint_path == path);
        match (matching.next(), matching.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_filter_is_prefix_anchored() {
        let filter = compile_email_filter("a@").unwrap();
        assert!(email_allowed(&filter, Some("a@b.com")));
        assert!(!email_allowed(&filter, Some("ba@b.com")));
        assert!(email_allowed(&filter, None));

        let alternation = compile_email_filter("x@|y@").unwrap();
        assert!(!email_allowed(&alternation, Some("zy@b.com")));
        assert!(compile_email_filter("(").is_err());
    }

    #[test]
    fn test_catalog_lookup_is_case_insensitive() {
        let catalog = ProviderCatalog::builtin();
        assert!(catalog.get("GitLab").is_some());
        assert!(catalog.get("twitter").is_some());
        assert!(catalog.get("myspace").is_none());
    }

    #[test]
    fn test_oauth1_definition_needs_request_token_url() {
        let mut definition = ProviderDefinition::oauth1(
            "custom",
            "https://p.test/rt",
            "https://p.test/auth",
            "https://p.test/at",
            "https://p.test/me",
            |_| Ok(Default::default()),
        );
        assert!(definition.validate().is_ok());
        definition.request_token_url = None;
        assert!(matches!(definition.validate(), Err(OAuthError::Configuration(_))));
    }
}

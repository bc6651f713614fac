use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use starberry_lib::random_alphanumeric_string;
use tracing::{debug, info, warn};

use super::context::{AuthContext, Response};
use super::crypto::SigningEntropy;
use super::http_client::OAuthHttpClient;
use super::oauth_provider::{
    compile_email_filter, email_allowed, ProtocolFlow, ProviderCatalog, ProviderConfig, ProviderRegistry,
};
use super::types::{OAuthError, Token};
use crate::config::{OAuthSettings, DEFAULT_ENDPOINT_PATH};

pub type BoxFuture = Pin<Box<dyn Future<Output = AuthContext> + Send + 'static>>;

/// Downstream continuation: the next middleware or the route handler.
pub type Next = Box<dyn Fn(AuthContext) -> BoxFuture + Send + Sync + 'static>;

/// A route handler, shareable across requests.
pub type Handler = Arc<dyn Fn(AuthContext) -> BoxFuture + Send + Sync + 'static>;

/// Middleware over [`AuthContext`].
pub trait AuthMiddleware: Send + Sync + 'static {
    fn handle(&self, ctx: AuthContext, next: Next) -> BoxFuture;
}

const CSRF_STATE_LEN: usize = 32;

/// Social login layer: owns the provider registry and the shared outbound HTTP client, serves
/// the callback endpoint(s) and hands out [`LoginRequired`] guards.
#[derive(Clone)]
pub struct OAuthLayer {
    registry: Arc<ProviderRegistry>,
    http_client: Arc<dyn OAuthHttpClient>,
}

impl OAuthLayer {
    /// Builds the layer. Any configuration problem is returned here, before serving traffic.
    pub fn new(
        settings: &OAuthSettings,
        catalog: &ProviderCatalog,
        http_client: Arc<dyn OAuthHttpClient>,
    ) -> Result<Self, OAuthError> {
        let registry = ProviderRegistry::from_settings(settings, catalog)?;
        Ok(Self::from_registry(registry, http_client))
    }

    /// Like [`OAuthLayer::new`] with injected OAuth1 nonce and timestamp source.
    pub fn with_entropy(
        settings: &OAuthSettings,
        catalog: &ProviderCatalog,
        http_client: Arc<dyn OAuthHttpClient>,
        entropy: Arc<dyn SigningEntropy>,
    ) -> Result<Self, OAuthError> {
        let registry = ProviderRegistry::from_settings_with_entropy(settings, catalog, entropy)?;
        Ok(Self::from_registry(registry, http_client))
    }

    pub fn from_registry(registry: ProviderRegistry, http_client: Arc<dyn OAuthHttpClient>) -> Self {
        Self { registry: Arc::new(registry), http_client }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Paths the surrounding router must send to this layer.
    pub fn endpoint_paths(&self) -> Vec<String> {
        self.registry.endpoint_paths().into_iter().map(str::to_string).collect()
    }

    /// Starts a guard bound to this layer.
    pub fn login_required(&self) -> LoginRequired {
        LoginRequired::new(self.clone())
    }

    /// Closes the outbound HTTP client. Call once at process shutdown.
    pub fn shutdown(&self) {
        info!("closing social login HTTP client");
        self.http_client.close();
    }

    /// Endpoint path used for error redirects when no provider could be resolved.
    fn fallback_endpoint(&self) -> String {
        self.registry
            .resolve(None, None)
            .map(|p| p.endpoint_path.clone())
            .unwrap_or_else(|_| DEFAULT_ENDPOINT_PATH.to_string())
    }

    /// Picks the provider a callback request belongs to: `provider` query parameter, then the
    /// provider owning this path, then the session.
    fn callback_provider(&self, ctx: &mut AuthContext) -> Result<ProviderConfig, Response> {
        if let Some(name) = ctx.query("provider").map(str::to_string) {
            return match self.registry.get(&name) {
                Some(provider) => {
                    ctx.auth_state().remember_provider(&provider.name);
                    Ok(provider.clone())
                }
                None => Err(Response::status(404, "Unknown identity provider")),
            };
        }
        if let Some(provider) = self.registry.provider_for_path(ctx.path()) {
            return Ok(provider.clone());
        }
        let remembered = ctx.auth_state().oauth_provider();
        self.registry
            .resolve(None, remembered.as_deref())
            .cloned()
            .map_err(|e| e.into_response(&self.fallback_endpoint()))
    }

    /// Callback endpoint. Without a code or verifier it starts the authorization leg; with one it
    /// exchanges it for a token and redirects to the page that asked for login.
    ///
    /// An `error` or `denied` parameter, from the provider or from a failed exchange, is rendered
    /// as a denial page. A failure while starting the authorization leg is answered directly, so
    /// the endpoint never redirects to itself without parameters.
    pub async fn handle_callback(&self, mut ctx: AuthContext) -> AuthContext {
        let provider = match self.callback_provider(&mut ctx) {
            Ok(provider) => provider,
            Err(response) => {
                ctx.response = response;
                return ctx;
            }
        };
        if ctx.query("error").is_some() || ctx.query("denied").is_some() {
            let mut state = ctx.auth_state();
            state.take_csrf_state();
            state.take_request_token();
            warn!(provider = %provider.name, error_code = "access_denied", "sign-in was not completed");
            ctx.response = denied_page(&provider.endpoint_path);
            return ctx;
        }
        let exchange_leg = ctx.query("code").is_some() || ctx.query("oauth_verifier").is_some();
        let result = match provider.flow() {
            ProtocolFlow::OAuth2(_) => self.oauth2_callback(&provider, &mut ctx).await,
            ProtocolFlow::OAuth1(_) => self.oauth1_callback(&provider, &mut ctx).await,
        };
        ctx.response = match result {
            Ok(response) => response,
            Err(err @ OAuthError::ProviderProtocol(_)) if !exchange_leg => {
                warn!(error = %err, error_code = err.code(), provider = %provider.name, "authorization leg failed");
                Response::status(502, "The identity provider returned an invalid response")
            }
            Err(err) => err.into_response(&provider.endpoint_path),
        };
        ctx
    }

    async fn oauth2_callback(
        &self,
        provider: &ProviderConfig,
        ctx: &mut AuthContext,
    ) -> Result<Response, OAuthError> {
        let ProtocolFlow::OAuth2(flow) = provider.flow() else {
            return Err(OAuthError::Configuration(format!("{} is not an OAuth2 provider", provider.name)));
        };
        let Some(code) = ctx.query("code").map(str::to_string) else {
            let state = random_alphanumeric_string(CSRF_STATE_LEN);
            ctx.auth_state().set_csrf_state(&state);
            debug!(provider = %provider.name, "redirecting to authorize URL");
            return Ok(Response::redirect(flow.get_authorize_url(
                &provider.scope,
                &provider.redirect_uri,
                Some(&state),
            )));
        };

        let returned_state = ctx.query("state").map(str::to_string);
        let expected_state = ctx.auth_state().take_csrf_state();
        if expected_state.is_none() || returned_state != expected_state {
            return Err(OAuthError::AuthorizationDenied("state parameter mismatch".into()));
        }

        let token = flow
            .get_access_token(self.http_client.as_ref(), &code, &provider.redirect_uri)
            .await?;
        Ok(self.complete_login(provider, ctx, Token::Bearer(token.access_token)))
    }

    async fn oauth1_callback(
        &self,
        provider: &ProviderConfig,
        ctx: &mut AuthContext,
    ) -> Result<Response, OAuthError> {
        let ProtocolFlow::OAuth1(flow) = provider.flow() else {
            return Err(OAuthError::Configuration(format!("{} is not an OAuth1 provider", provider.name)));
        };
        let Some(verifier) = ctx.query("oauth_verifier").map(str::to_string) else {
            let request_token = flow
                .get_request_token(self.http_client.as_ref(), &provider.redirect_uri)
                .await?;
            ctx.auth_state().set_request_token(&request_token);
            debug!(provider = %provider.name, "redirecting to authorize URL");
            return Ok(Response::redirect(flow.get_authorize_url(&request_token.oauth_token)));
        };

        let returned_token = ctx.query("oauth_token").map(str::to_string);
        let (request_token, request_token_secret) = ctx
            .auth_state()
            .take_request_token()
            .ok_or_else(|| OAuthError::AuthorizationDenied("no pending request token".into()))?;
        if returned_token.as_deref().is_some_and(|t| t != request_token) {
            return Err(OAuthError::AuthorizationDenied("oauth_token does not match the request token".into()));
        }

        let token = flow
            .get_access_token(self.http_client.as_ref(), &verifier, &request_token, &request_token_secret)
            .await?;
        Ok(self.complete_login(provider, ctx, token))
    }

    fn complete_login(&self, provider: &ProviderConfig, ctx: &mut AuthContext, token: Token) -> Response {
        let is_default = self.registry.is_default(&provider.name);
        let mut state = ctx.auth_state();
        state.set_token_for(&token, &provider.name);
        if is_default {
            state.forget_provider();
        } else {
            state.remember_provider(&provider.name);
        }
        let target = state
            .take_after_auth_redirect()
            .unwrap_or_else(|| provider.after_auth_redirect.clone());
        info!(provider = %provider.name, "login completed");
        Response::redirect(target)
    }
}

impl AuthMiddleware for OAuthLayer {
    fn handle(&self, ctx: AuthContext, next: Next) -> BoxFuture {
        let layer = self.clone();
        Box::pin(async move {
            let is_callback = layer.registry.endpoint_paths().contains(&ctx.path());
            if is_callback {
                layer.handle_callback(ctx).await
            } else {
                next(ctx).await
            }
        })
    }
}

/// Guard in front of a protected route.
///
/// Sends sessions without a token to the provider's callback endpoint, fetches the identity
/// once per session and caches it, and enforces the email filter. Per-route settings win over
/// the provider's.
#[derive(Clone)]
pub struct LoginRequired {
    layer: OAuthLayer,
    add_user_info: bool,
    email_filter: Option<Regex>,
    provider: Option<String>,
}

impl LoginRequired {
    pub fn new(layer: OAuthLayer) -> Self {
        Self { layer, add_user_info: true, email_filter: None, provider: None }
    }

    /// Whether the handler receives the identity in [`AuthContext::user`]. Defaults to true.
    pub fn add_user_info(mut self, add: bool) -> Self {
        self.add_user_info = add;
        self
    }

    /// Route-level email filter, matched from the first character of the email.
    pub fn email_filter(mut self, pattern: &str) -> Result<Self, OAuthError> {
        self.email_filter = Some(compile_email_filter(pattern)?);
        Ok(self)
    }

    /// Route-level provider. Fails for a provider that is not configured.
    pub fn provider(mut self, name: &str) -> Result<Self, OAuthError> {
        if self.layer.registry.get(name).is_none() {
            return Err(OAuthError::Configuration(format!("unknown provider {}", name)));
        }
        self.provider = Some(name.to_string());
        Ok(self)
    }

    /// Wraps `handler` so it only runs for authenticated sessions.
    pub fn wrap(self, handler: Handler) -> Handler {
        let guard = Arc::new(self);
        Arc::new(move |ctx: AuthContext| {
            let guard = Arc::clone(&guard);
            let handler = Arc::clone(&handler);
            Box::pin(async move { guard.check(ctx, move |ctx| handler(ctx)).await }) as BoxFuture
        })
    }

    /// Sends the session through the login flow, remembering where it was headed.
    fn start_login(&self, ctx: &mut AuthContext, provider: &ProviderConfig) {
        let target = ctx.target();
        let mut state = ctx.auth_state();
        state.set_after_auth_redirect(&target);
        if self.provider.is_some() {
            state.remember_provider(&provider.name);
        }
        ctx.response = Response::redirect(provider.endpoint_path.clone());
    }

    /// Runs the guard; `next` is invoked only when the request may proceed.
    pub async fn check<F>(&self, mut ctx: AuthContext, next: F) -> AuthContext
    where
        F: FnOnce(AuthContext) -> BoxFuture,
    {
        let registry = &self.layer.registry;
        // The stored token belongs to the provider recorded at exchange time, or to the default
        // for tokens stored without an owner. An unbound route follows the token's owner.
        let (token_owner, remembered) = {
            let state = ctx.auth_state();
            let owner = state
                .has_token()
                .then(|| state.token_provider().or_else(|| registry.default_name().map(str::to_string)))
                .flatten();
            (owner, state.oauth_provider())
        };
        let selected = token_owner.as_deref().or(remembered.as_deref());
        let provider = match registry.resolve(self.provider.as_deref(), selected) {
            Ok(provider) => provider.clone(),
            Err(err) => {
                ctx.response = err.into_response(&self.layer.fallback_endpoint());
                return ctx;
            }
        };

        let token = ctx
            .auth_state()
            .token()
            .filter(|_| token_owner.as_deref() == Some(provider.name.as_str()));
        let Some(token) = token else {
            debug!(provider = %provider.name, path = %ctx.path(), "no token, starting login");
            self.start_login(&mut ctx, &provider);
            return ctx;
        };

        let filter = self.email_filter.as_ref().or(provider.email_filter.as_ref());
        if !self.add_user_info && filter.is_none() {
            return next(ctx).await;
        }

        let cached = ctx.auth_state().user_info();
        let user = match cached {
            Some(cached) => cached,
            None => {
                let fetched = provider
                    .identity_fetcher()
                    .user_info(self.layer.http_client.as_ref(), &token)
                    .await;
                match fetched {
                    Ok(user) => {
                        if filter.is_none_or(|f| email_allowed(f, user.email.as_deref())) {
                            ctx.auth_state().cache_user_info(&user);
                        }
                        user
                    }
                    Err(err @ (OAuthError::IdentityFetch(_) | OAuthError::IdentityParse(_))) => {
                        warn!(error = %err, error_code = err.code(), provider = %provider.name, "identity unavailable, forcing re-authentication");
                        self.start_login(&mut ctx, &provider);
                        return ctx;
                    }
                    Err(err) => {
                        ctx.response = err.into_response(&provider.endpoint_path);
                        return ctx;
                    }
                }
            }
        };

        if let Some(filter) = filter {
            if !email_allowed(filter, user.email.as_deref()) {
                debug!(provider = %provider.name, "email rejected by filter");
                self.start_login(&mut ctx, &provider);
                return ctx;
            }
        }

        if self.add_user_info {
            ctx.user = Some(user);
        }
        next(ctx).await
    }
}

impl AuthMiddleware for LoginRequired {
    fn handle(&self, ctx: AuthContext, next: Next) -> BoxFuture {
        let guard = self.clone();
        Box::pin(async move { guard.check(ctx, next).await })
    }
}

/// Page shown when the user declined consent or the exchange was refused.
fn denied_page(endpoint_path: &str) -> Response {
    let body = format!(
        "<!DOCTYPE html><html><body><p>Sign-in was not completed.</p><p><a href=\"{}\">Try again</a></p></body></html>",
        endpoint_path
    );
    Response::Content {
        code: 403,
        content_type: "text/html; charset=utf-8".into(),
        body: body.into_bytes(),
    }
}

/// Composes `guard` in front of `handler`.
pub fn login_required(guard: LoginRequired, handler: Handler) -> Handler {
    guard.wrap(handler)
}

/// Adapts an async function into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(AuthContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AuthContext> + Send + 'static,
{
    Arc::new(move |ctx: AuthContext| Box::pin(f(ctx)) as BoxFuture)
}

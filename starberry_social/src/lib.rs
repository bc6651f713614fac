pub mod oauth_core;
pub mod config;
pub mod social;

pub use config::{OAuthSettings, ProviderSettings};
pub use oauth_core::context::{AuthContext, Response};
pub use oauth_core::crypto::{FixedEntropy, OAuth1Signer, SigningEntropy, SystemEntropy};
pub use oauth_core::http_client::{
    HttpClientError, HttpMethod, HttpRequest, HttpResponse, InMemoryHttpClient, OAuthHttpClient, RedirectPolicy,
};
#[cfg(feature = "reqwest-client")]
pub use oauth_core::http_client::ReqwestHttpClient;
pub use oauth_core::middleware::{
    handler_fn, login_required, AuthMiddleware, BoxFuture, Handler, LoginRequired, Next, OAuthLayer,
};
pub use oauth_core::oauth1::OAuth1Flow;
pub use oauth_core::oauth_client::OAuth2Flow;
pub use oauth_core::oauth_provider::{
    ProtocolFlow, ProviderCatalog, ProviderConfig, ProviderDefinition, ProviderRegistry,
};
pub use oauth_core::session::{InMemorySessionStore, Session, SessionAuthState, SessionError, SessionStore};
pub use oauth_core::types::{
    Credentials, IdentityRecord, OAuthError, ProtocolVariant, RequestToken, Token, TokenResponse,
};
pub use oauth_core::user_info::{AuthStyle, IdentityFetcher, IdentityMapper};

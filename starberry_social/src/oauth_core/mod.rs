pub mod types;
pub mod context;
pub mod session;
pub mod http_client;
pub mod crypto;
pub mod oauth1;
pub mod oauth_client;
pub mod user_info;
pub mod oauth_provider;
pub mod middleware;

//! Single-provider login wired into a toy request loop.
//!
//! Provider traffic is answered by an in-memory client so the demo runs offline.

use std::error::Error;
use std::sync::Arc;

use serde_json::json;
use starberry_social::{
    handler_fn, AuthContext, AuthMiddleware, Handler, HttpResponse, InMemoryHttpClient, InMemorySessionStore,
    OAuthLayer, OAuthSettings, ProviderCatalog, Response, SessionStore,
};

struct App {
    layer: OAuthLayer,
    index: Handler,
    store: InMemorySessionStore,
}

impl App {
    /// Runs one request through the session store, the login endpoint and the protected route.
    async fn get(&self, session_id: Option<&str>, target: &str) -> Result<(String, Response), Box<dyn Error>> {
        let (id, session) = self.store.read(session_id).await?;
        let index = Arc::clone(&self.index);
        let ctx = self
            .layer
            .handle(AuthContext::new(target, session), Box::new(move |ctx: AuthContext| index(ctx)))
            .await;
        let (session, response) = ctx.into_parts();
        self.store.write(&id, session).await?;
        Ok((id, response))
    }
}

fn provider_stub() -> InMemoryHttpClient {
    let http = InMemoryHttpClient::new();
    http.insert_response("https://gitlab.com/oauth/token", HttpResponse::json(200, &json!({"access_token": "demo-token"})));
    http.insert_response(
        "https://gitlab.com/api/v4/user",
        HttpResponse::json(200, &json!({"id": 1, "username": "demo", "name": "Demo User", "email": "demo@example.com"})),
    );
    http
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut settings = OAuthSettings::single("gitlab", "http://127.0.0.1:8888/oauth", "read_user");
    settings.client_id = Some("gitlab-client-id".into());
    settings.client_secret = Some("gitlab-client-secret".into());
    settings.email_filter = Some(".*@example.com".into());

    let layer = OAuthLayer::new(&settings, &ProviderCatalog::builtin(), Arc::new(provider_stub()))?;
    let index = layer.login_required().wrap(handler_fn(|mut ctx: AuthContext| async move {
        let name = ctx.user.as_ref().and_then(|u| u.first_name.clone()).unwrap_or_default();
        ctx.response = Response::html(format!("<h1>Hello {}</h1>", name));
        ctx
    }));
    let app = App { layer: layer.clone(), index, store: InMemorySessionStore::new() };

    let (sid, response) = app.get(None, "/").await?;
    println!("GET / -> {:?}", response);

    let (sid, response) = app.get(Some(&sid), "/oauth").await?;
    let authorize = response.redirect_location().unwrap_or_default().to_string();
    println!("GET /oauth -> {}", authorize);

    // The browser comes back from the provider with a code and the state it was given.
    let state = starberry_lib::parse_pairs(authorize.split_once('?').map(|(_, q)| q).unwrap_or(""))
        .into_iter()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v)
        .unwrap_or_default();
    let (sid, response) = app.get(Some(&sid), &format!("/oauth?code=demo-code&state={}", state)).await?;
    println!("GET /oauth?code=.. -> {:?}", response);

    let (_, response) = app.get(Some(&sid), "/").await?;
    println!("GET / -> {:?}", response);

    layer.shutdown();
    Ok(())
}

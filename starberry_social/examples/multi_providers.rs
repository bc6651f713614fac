//! Several providers behind one login endpoint, selected per route.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use serde_json::json;
use starberry_social::{
    handler_fn, AuthContext, AuthMiddleware, BoxFuture, Handler, HttpResponse, InMemoryHttpClient, InMemorySessionStore,
    OAuthLayer, OAuthSettings, ProviderCatalog, Response, SessionStore,
};

const SETTINGS: &str = r#"
redirect_uri = "http://127.0.0.1:8888/oauth"
scope = "email"

[providers.gitlab]
scope = "read_user"
client_id = "gitlab-client-id"
client_secret = "gitlab-client-secret"
default = true

[providers.discord]
scope = "identify email"
client_id = "discord-client-id"
client_secret = "discord-client-secret"
"#;

fn greet(provider: &'static str) -> Handler {
    handler_fn(move |mut ctx: AuthContext| async move {
        let who = ctx.user.as_ref().and_then(|u| u.username.clone()).unwrap_or_default();
        ctx.response = Response::text(format!("{} says hi to {}", provider, who));
        ctx
    })
}

struct App {
    layer: OAuthLayer,
    routes: HashMap<&'static str, Handler>,
    store: InMemorySessionStore,
}

impl App {
    async fn get(&self, session_id: Option<&str>, target: &str) -> Result<(String, Response), Box<dyn Error>> {
        let (id, session) = self.store.read(session_id).await?;
        let ctx = AuthContext::new(target, session);
        let route = self.routes.get(ctx.path()).cloned();
        let ctx = self
            .layer
            .handle(
                ctx,
                Box::new(move |mut ctx: AuthContext| match &route {
                    Some(handler) => handler(ctx),
                    None => Box::pin(async move {
                        ctx.response = Response::status(404, "not found");
                        ctx
                    }) as BoxFuture,
                }),
            )
            .await;
        let (session, response) = ctx.into_parts();
        self.store.write(&id, session).await?;
        Ok((id, response))
    }

    /// Follows a login from the protected route through the provider and back.
    async fn login(&self, target: &str) -> Result<String, Box<dyn Error>> {
        let (sid, response) = self.get(None, target).await?;
        println!("GET {} -> {:?}", target, response);
        let (sid, response) = self.get(Some(&sid), "/oauth").await?;
        let authorize = response.redirect_location().unwrap_or_default().to_string();
        println!("GET /oauth -> {}", authorize);
        let state = starberry_lib::parse_pairs(authorize.split_once('?').map(|(_, q)| q).unwrap_or(""))
            .into_iter()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v)
            .unwrap_or_default();
        let (sid, response) = self.get(Some(&sid), &format!("/oauth?code=demo&state={}", state)).await?;
        println!("GET /oauth?code=.. -> {:?}", response);
        let (sid, response) = self.get(Some(&sid), target).await?;
        println!("GET {} -> {:?}", target, response);
        Ok(sid)
    }
}

fn provider_stub() -> InMemoryHttpClient {
    let http = InMemoryHttpClient::new();
    http.insert_response("https://gitlab.com/oauth/token", HttpResponse::json(200, &json!({"access_token": "gl"})));
    http.insert_response(
        "https://gitlab.com/api/v4/user",
        HttpResponse::json(200, &json!({"id": 1, "username": "gl-user", "email": "gl@example.com"})),
    );
    http.insert_response("https://discord.com/api/oauth2/token", HttpResponse::json(200, &json!({"access_token": "dc"})));
    http.insert_response(
        "https://discord.com/api/users/@me",
        HttpResponse::json(200, &json!({"id": "2", "username": "dc-user", "email": "dc@example.com"})),
    );
    http
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let settings = OAuthSettings::from_toml_str(SETTINGS)?;
    let layer = OAuthLayer::new(&settings, &ProviderCatalog::builtin(), Arc::new(provider_stub()))?;

    let mut routes: HashMap<&'static str, Handler> = HashMap::new();
    routes.insert("/gitlab", layer.login_required().wrap(greet("gitlab")));
    routes.insert("/discord", layer.login_required().provider("discord")?.wrap(greet("discord")));
    let app = App { layer: layer.clone(), routes, store: InMemorySessionStore::new() };

    app.login("/gitlab").await?;
    app.login("/discord").await?;

    layer.shutdown();
    Ok(())
}

use std::sync::Arc;

use serde_json::json;
use starberry_lib::parse_pairs;
use starberry_social::oauth_core::crypto::{parse_authorization_header, sign};
use starberry_social::{
    AuthContext, FixedEntropy, HttpClientError, HttpMethod, HttpResponse, InMemoryHttpClient, OAuth1Flow,
    OAuthLayer, OAuthSettings, ProviderCatalog, Response, Session, Token,
};

const TWITTER_REQUEST_TOKEN: &str = "https://api.twitter.com/oauth/request_token";
const TWITTER_ACCESS_TOKEN: &str = "https://api.twitter.com/oauth/access_token";
const GITLAB_TOKEN: &str = "https://gitlab.com/oauth/token";

fn query_of(location: &str) -> Vec<(String, String)> {
    parse_pairs(location.split_once('?').map(|(_, q)| q).unwrap_or(""))
}

fn query_value(location: &str, key: &str) -> Option<String> {
    query_of(location).into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

fn gitlab_layer(http: &InMemoryHttpClient) -> OAuthLayer {
    let mut settings = OAuthSettings::single("gitlab", "http://127.0.0.1:8888/oauth", "read_user");
    settings.client_id = Some("gitlab-id".into());
    settings.client_secret = Some("gitlab-secret".into());
    OAuthLayer::new(&settings, &ProviderCatalog::builtin(), Arc::new(http.clone())).unwrap()
}

fn twitter_layer(http: &InMemoryHttpClient) -> OAuthLayer {
    let mut settings = OAuthSettings::single("twitter", "http://127.0.0.1:8888/oauth", "");
    settings.consumer_key = Some("ck".into());
    settings.consumer_secret = Some("cs".into());
    OAuthLayer::with_entropy(
        &settings,
        &ProviderCatalog::builtin(),
        Arc::new(http.clone()),
        Arc::new(FixedEntropy { nonce: "nonce1".into(), timestamp: 1_191_242_096 }),
    )
    .unwrap()
}

async fn call(layer: &OAuthLayer, target: &str, session: Session) -> (Session, Response) {
    layer.handle_callback(AuthContext::new(target, session)).await.into_parts()
}

#[tokio::test]
async fn test_oauth1_three_legged_flow() {
    let http = InMemoryHttpClient::new();
    http.insert_response(
        TWITTER_REQUEST_TOKEN,
        HttpResponse::form(200, "oauth_token=rt&oauth_token_secret=rts&oauth_callback_confirmed=true"),
    );
    http.insert_response(TWITTER_ACCESS_TOKEN, HttpResponse::form(200, "oauth_token=at&oauth_token_secret=ats"));
    let flow = OAuth1Flow::new(
        "ck",
        "cs",
        TWITTER_REQUEST_TOKEN,
        "https://api.twitter.com/oauth/authenticate",
        TWITTER_ACCESS_TOKEN,
        Arc::new(FixedEntropy { nonce: "nonce1".into(), timestamp: 1_191_242_096 }),
    );

    let request_token = flow.get_request_token(&http, "http://127.0.0.1:8888/oauth").await.unwrap();
    assert_eq!(request_token.oauth_token, "rt");
    assert_eq!(request_token.oauth_token_secret, "rts");

    let authorize_url = flow.get_authorize_url(&request_token.oauth_token);
    assert_eq!(query_value(&authorize_url, "oauth_token").as_deref(), Some("rt"));

    let token = flow.get_access_token(&http, "v1", "rt", "rts").await.unwrap();
    assert_eq!(token.access_token(), "at");
    assert_ne!(token.access_token(), "rt");
    assert_eq!(token.secret(), Some("ats"));

    // The access token request is signed with the request token secret.
    let request = &http.requests()[1];
    let fields = parse_authorization_header(request.header_value("Authorization").unwrap());
    let field = |name: &str| fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone());
    assert_eq!(field("oauth_verifier").as_deref(), Some("v1"));
    assert_eq!(field("oauth_token").as_deref(), Some("rt"));
    let unsigned: Vec<(String, String)> = fields.iter().filter(|(k, _)| k != "oauth_signature").cloned().collect();
    let with_rts = sign(HttpMethod::POST, TWITTER_ACCESS_TOKEN, &unsigned, "cs", Some("rts")).unwrap();
    let without = sign(HttpMethod::POST, TWITTER_ACCESS_TOKEN, &unsigned, "cs", None).unwrap();
    assert_eq!(field("oauth_signature"), Some(with_rts));
    assert_ne!(field("oauth_signature"), Some(without));
}

#[tokio::test]
async fn test_oauth2_code_exchange_through_callback() {
    let http = InMemoryHttpClient::new();
    http.insert_response(GITLAB_TOKEN, HttpResponse::json(200, &json!({"access_token": "tok1"})));
    let layer = gitlab_layer(&http);

    let mut session = Session::new();
    session.insert("after_auth_redirect", json!("/profile"));

    // First leg: no code, redirect to the provider with a fresh state.
    let (session, response) = call(&layer, "/oauth", session).await;
    let location = response.redirect_location().unwrap().to_string();
    assert!(location.starts_with("https://gitlab.com/oauth/authorize?"));
    assert_eq!(query_value(&location, "client_id").as_deref(), Some("gitlab-id"));
    assert_eq!(query_value(&location, "scope").as_deref(), Some("read_user"));
    let state = query_value(&location, "state").unwrap();
    assert_eq!(http.requests().len(), 0);

    // Second leg: the provider calls back with the code.
    let (mut session, response) = call(&layer, &format!("/oauth?code=abc123&state={}", state), session).await;
    assert_eq!(response.redirect_location(), Some("/profile"));
    let auth = starberry_social::SessionAuthState::new(&mut session);
    assert_eq!(auth.token(), Some(Token::Bearer("tok1".into())));
    assert_eq!(auth.after_auth_redirect(), None);
    assert_eq!(auth.oauth_provider(), None);

    let body = http.requests()[0].body_text().unwrap();
    assert!(body.contains("code=abc123"));
}

#[tokio::test]
async fn test_oauth2_callback_without_recorded_path_uses_default_redirect() {
    let http = InMemoryHttpClient::new();
    http.insert_response(GITLAB_TOKEN, HttpResponse::json(200, &json!({"access_token": "tok1"})));
    let layer = gitlab_layer(&http);

    let (session, response) = call(&layer, "/oauth", Session::new()).await;
    let state = query_value(response.redirect_location().unwrap(), "state").unwrap();
    let (_, response) = call(&layer, &format!("/oauth?code=c&state={}", state), session).await;
    assert_eq!(response.redirect_location(), Some("/"));
}

#[tokio::test]
async fn test_oauth2_state_is_single_use() {
    let http = InMemoryHttpClient::new();
    http.insert_response(GITLAB_TOKEN, HttpResponse::json(200, &json!({"access_token": "tok1"})));
    let layer = gitlab_layer(&http);

    let (session, response) = call(&layer, "/oauth", Session::new()).await;
    let state = query_value(response.redirect_location().unwrap(), "state").unwrap();

    let (session, response) = call(&layer, "/oauth?code=c&state=forged", session).await;
    assert_eq!(response.redirect_location(), Some("/oauth?error=access_denied"));

    // The pending state was consumed by the failed attempt.
    let (session, response) = call(&layer, &format!("/oauth?code=c&state={}", state), session).await;
    assert_eq!(response.redirect_location(), Some("/oauth?error=access_denied"));
    assert_eq!(http.requests().len(), 0);

    // The marked endpoint shows the denial instead of starting another flow.
    let (session, response) = call(&layer, "/oauth?error=access_denied", session).await;
    assert_eq!(response.status_code(), 403);
    assert!(response.redirect_location().is_none());
    assert!(!session.contains("oauth_state"));
}

#[tokio::test]
async fn test_oauth2_provider_error_is_denied() {
    let http = InMemoryHttpClient::new();
    let layer = gitlab_layer(&http);
    let (session, _) = call(&layer, "/oauth", Session::new()).await;
    assert!(session.contains("oauth_state"));

    let (session, response) = call(&layer, "/oauth?error=access_denied&state=x", session).await;
    assert_eq!(response.status_code(), 403);
    match &response {
        Response::Content { body, .. } => assert!(String::from_utf8_lossy(body).contains("href=\"/oauth\"")),
        other => panic!("expected a denial page, got {:?}", other),
    }
    assert!(!session.contains("token"));
    assert!(!session.contains("oauth_state"));
    assert_eq!(http.requests().len(), 0);
}

#[tokio::test]
async fn test_refused_code_redirects_to_marked_endpoint() {
    let http = InMemoryHttpClient::new();
    http.insert_response(GITLAB_TOKEN, HttpResponse::json(400, &json!({"error": "invalid_grant"})));
    let layer = gitlab_layer(&http);

    let (session, response) = call(&layer, "/oauth", Session::new()).await;
    let state = query_value(response.redirect_location().unwrap(), "state").unwrap();
    let (_, response) = call(&layer, &format!("/oauth?code=expired&state={}", state), session).await;
    assert_eq!(response.redirect_location(), Some("/oauth?error=access_denied"));
}

#[tokio::test]
async fn test_oauth2_token_endpoint_failures() {
    let http = InMemoryHttpClient::new();
    let layer = gitlab_layer(&http);

    // Missing token field: back to the endpoint, which starts a fresh authorization.
    http.insert_response(GITLAB_TOKEN, HttpResponse::json(200, &json!({"token_type": "bearer"})));
    let (session, response) = call(&layer, "/oauth", Session::new()).await;
    let state = query_value(response.redirect_location().unwrap(), "state").unwrap();
    let (session, response) = call(&layer, &format!("/oauth?code=c&state={}", state), session).await;
    assert_eq!(response.redirect_location(), Some("/oauth"));
    let (_, response) = call(&layer, "/oauth", session).await;
    assert!(response.redirect_location().unwrap().starts_with("https://gitlab.com/oauth/authorize?"));
    assert_eq!(http.request_count(GITLAB_TOKEN), 1);

    // Timeout: retryable unavailability.
    http.insert_error(GITLAB_TOKEN, HttpClientError::Timeout);
    let (session, response) = call(&layer, "/oauth", Session::new()).await;
    let state = query_value(response.redirect_location().unwrap(), "state").unwrap();
    let (session, response) = call(&layer, &format!("/oauth?code=c&state={}", state), session).await;
    assert_eq!(response.status_code(), 503);
    assert!(!session.contains("token"));
}

#[tokio::test]
async fn test_oauth1_callback_round_trip() {
    let http = InMemoryHttpClient::new();
    http.insert_response(
        TWITTER_REQUEST_TOKEN,
        HttpResponse::form(200, "oauth_token=rt&oauth_token_secret=rts&oauth_callback_confirmed=true"),
    );
    http.insert_response(TWITTER_ACCESS_TOKEN, HttpResponse::form(200, "oauth_token=at&oauth_token_secret=ats"));
    let layer = twitter_layer(&http);

    let (session, response) = call(&layer, "/oauth", Session::new()).await;
    assert_eq!(
        response.redirect_location(),
        Some("https://api.twitter.com/oauth/authenticate?oauth_token=rt")
    );
    assert!(session.contains("oauth_request_token"));

    let (mut session, response) = call(&layer, "/oauth?oauth_token=rt&oauth_verifier=v1", session).await;
    assert_eq!(response.redirect_location(), Some("/"));
    assert!(!session.contains("oauth_request_token"));
    let auth = starberry_social::SessionAuthState::new(&mut session);
    assert_eq!(
        auth.token(),
        Some(Token::Signed { oauth_token: "at".into(), oauth_token_secret: "ats".into() })
    );
}

#[tokio::test]
async fn test_oauth1_callback_rejects_foreign_request_token() {
    let http = InMemoryHttpClient::new();
    http.insert_response(
        TWITTER_REQUEST_TOKEN,
        HttpResponse::form(200, "oauth_token=rt&oauth_token_secret=rts"),
    );
    let layer = twitter_layer(&http);

    let (session, _) = call(&layer, "/oauth", Session::new()).await;
    let (_, response) = call(&layer, "/oauth?oauth_token=other&oauth_verifier=v1", session).await;
    assert_eq!(response.redirect_location(), Some("/oauth?error=access_denied"));
    assert_eq!(http.request_count(TWITTER_ACCESS_TOKEN), 0);

    // No pending request token at all.
    let (_, response) = call(&layer, "/oauth?oauth_token=rt&oauth_verifier=v1", Session::new()).await;
    assert_eq!(response.redirect_location(), Some("/oauth?error=access_denied"));

    // The user declined on the provider's page.
    let (session, _) = call(&layer, "/oauth", Session::new()).await;
    let (session, response) = call(&layer, "/oauth?denied=rt", session).await;
    assert_eq!(response.status_code(), 403);
    assert!(response.redirect_location().is_none());
    assert!(!session.contains("oauth_request_token"));
}

#[tokio::test]
async fn test_oauth1_request_token_failure_is_answered_directly() {
    let http = InMemoryHttpClient::new();
    http.insert_response(TWITTER_REQUEST_TOKEN, HttpResponse::form(500, ""));
    let layer = twitter_layer(&http);
    let (_, response) = call(&layer, "/oauth", Session::new()).await;
    assert_eq!(response.status_code(), 502);
    assert!(response.redirect_location().is_none());
    assert_eq!(http.request_count(TWITTER_REQUEST_TOKEN), 1);

    // A body without the token fields is the same failure.
    http.insert_response(TWITTER_REQUEST_TOKEN, HttpResponse::form(200, "oauth_callback_confirmed=true"));
    let (_, response) = call(&layer, "/oauth", Session::new()).await;
    assert_eq!(response.status_code(), 502);
    assert_eq!(http.request_count(TWITTER_REQUEST_TOKEN), 2);
}

#[tokio::test]
async fn test_shutdown_closes_http_client() {
    let http = InMemoryHttpClient::new();
    let layer = gitlab_layer(&http);
    layer.shutdown();
    assert!(http.is_closed());
}

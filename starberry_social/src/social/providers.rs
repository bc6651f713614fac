//! Bundled provider classes: endpoints plus the mapping from each provider's user-info payload
//! to an [`IdentityRecord`].

use serde_json::{Map, Value};

use crate::oauth_core::oauth_provider::ProviderDefinition;
use crate::oauth_core::types::IdentityRecord;
use crate::oauth_core::user_info::{bool_at, expect_object, string_at, AuthStyle};

/// Every bundled provider class.
pub fn builtin_definitions() -> Vec<ProviderDefinition> {
    vec![google(), github(), gitlab(), discord(), facebook(), twitter(), bitbucket()]
}

pub fn google() -> ProviderDefinition {
    ProviderDefinition::oauth2(
        "google",
        "https://accounts.google.com/o/oauth2/auth",
        "https://accounts.google.com/o/oauth2/token",
        "https://www.googleapis.com/oauth2/v3/userinfo",
        parse_google,
    )
}

pub fn github() -> ProviderDefinition {
    ProviderDefinition::oauth2(
        "github",
        "https://github.com/login/oauth/authorize",
        "https://github.com/login/oauth/access_token",
        "https://api.github.com/user",
        parse_github,
    )
    .with_auth_style(AuthStyle::Header { name: "Authorization", prefix: "token" })
}

pub fn gitlab() -> ProviderDefinition {
    ProviderDefinition::oauth2(
        "gitlab",
        "https://gitlab.com/oauth/authorize",
        "https://gitlab.com/oauth/token",
        "https://gitlab.com/api/v4/user",
        parse_gitlab,
    )
}

pub fn discord() -> ProviderDefinition {
    ProviderDefinition::oauth2(
        "discord",
        "https://discord.com/api/oauth2/authorize",
        "https://discord.com/api/oauth2/token",
        "https://discord.com/api/users/@me",
        parse_discord,
    )
}

pub fn facebook() -> ProviderDefinition {
    ProviderDefinition::oauth2(
        "facebook",
        "https://www.facebook.com/dialog/oauth",
        "https://graph.facebook.com/oauth/access_token",
        "https://graph.facebook.com/me?fields=id,email,first_name,last_name,name,link,locale,verified",
        parse_facebook,
    )
    .with_auth_style(AuthStyle::Query("access_token"))
}

pub fn twitter() -> ProviderDefinition {
    ProviderDefinition::oauth1(
        "twitter",
        "https://api.twitter.com/oauth/request_token",
        "https://api.twitter.com/oauth/authenticate",
        "https://api.twitter.com/oauth/access_token",
        "https://api.twitter.com/1.1/account/verify_credentials.json?include_email=true",
        parse_twitter,
    )
}

pub fn bitbucket() -> ProviderDefinition {
    ProviderDefinition::oauth2(
        "bitbucket",
        "https://bitbucket.org/site/oauth2/authorize",
        "https://bitbucket.org/site/oauth2/access_token",
        "https://api.bitbucket.org/2.0/user",
        parse_bitbucket,
    )
}

/// Copies the fields no canonical slot took.
fn leftovers(payload: &Value, taken: &[&str]) -> Map<String, Value> {
    payload
        .as_object()
        .map(|object| {
            object
                .iter()
                .filter(|(k, _)| !taken.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

/// Splits "First Last" on the first space.
fn split_name(full: Option<String>) -> (Option<String>, Option<String>) {
    match full {
        Some(full) => match full.split_once(' ') {
            Some((first, last)) => (Some(first.to_string()), Some(last.to_string())),
            None => (Some(full), None),
        },
        None => (None, None),
    }
}

/// Handles both the OpenID `userinfo` shape and the older people API shape.
pub fn parse_google(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let account_email = payload
        .get("emails")
        .and_then(Value::as_array)
        .and_then(|emails| {
            emails
                .iter()
                .find(|e| e.get("type").and_then(Value::as_str) == Some("account"))
        })
        .and_then(|e| string_at(e, "/value"));
    Ok(IdentityRecord {
        id: string_at(payload, "/sub").or_else(|| string_at(payload, "/id")),
        email: string_at(payload, "/email").or(account_email),
        username: string_at(payload, "/nickname"),
        first_name: string_at(payload, "/given_name").or_else(|| string_at(payload, "/name/givenName")),
        last_name: string_at(payload, "/family_name").or_else(|| string_at(payload, "/name/familyName")),
        picture: string_at(payload, "/picture").or_else(|| string_at(payload, "/image/url")),
        link: string_at(payload, "/profile").or_else(|| string_at(payload, "/url")),
        locale: string_at(payload, "/locale").or_else(|| string_at(payload, "/language")),
        verified: bool_at(payload, "/email_verified"),
        extra: leftovers(
            payload,
            &[
                "sub", "id", "email", "emails", "nickname", "given_name", "family_name", "name",
                "picture", "image", "profile", "url", "locale", "language", "email_verified",
            ],
        ),
        ..Default::default()
    })
}

pub fn parse_github(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let (first_name, last_name) = split_name(string_at(payload, "/name"));
    Ok(IdentityRecord {
        id: string_at(payload, "/id"),
        email: string_at(payload, "/email"),
        username: string_at(payload, "/login"),
        first_name,
        last_name,
        picture: string_at(payload, "/avatar_url"),
        link: string_at(payload, "/html_url"),
        city: string_at(payload, "/location"),
        extra: leftovers(payload, &["id", "email", "login", "name", "avatar_url", "html_url", "location"]),
        ..Default::default()
    })
}

pub fn parse_gitlab(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let (first_name, last_name) = split_name(string_at(payload, "/name"));
    Ok(IdentityRecord {
        id: string_at(payload, "/id"),
        email: string_at(payload, "/email"),
        username: string_at(payload, "/username"),
        first_name,
        last_name,
        picture: string_at(payload, "/avatar_url"),
        link: string_at(payload, "/web_url"),
        city: string_at(payload, "/location"),
        verified: string_at(payload, "/confirmed_at").map(|_| true),
        extra: leftovers(
            payload,
            &["id", "email", "username", "name", "avatar_url", "web_url", "location", "confirmed_at"],
        ),
        ..Default::default()
    })
}

pub fn parse_discord(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let id = string_at(payload, "/id");
    let picture = match (&id, string_at(payload, "/avatar")) {
        (Some(id), Some(avatar)) => Some(format!("https://cdn.discordapp.com/avatars/{}/{}.png", id, avatar)),
        _ => None,
    };
    Ok(IdentityRecord {
        email: string_at(payload, "/email"),
        username: string_at(payload, "/username"),
        first_name: string_at(payload, "/global_name"),
        picture,
        locale: string_at(payload, "/locale"),
        verified: bool_at(payload, "/verified"),
        extra: leftovers(
            payload,
            &["id", "email", "username", "global_name", "avatar", "locale", "verified"],
        ),
        id,
        ..Default::default()
    })
}

pub fn parse_facebook(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let id = string_at(payload, "/id");
    let picture = id
        .as_ref()
        .map(|id| format!("https://graph.facebook.com/{}/picture?type=large", id));
    Ok(IdentityRecord {
        email: string_at(payload, "/email"),
        username: string_at(payload, "/name"),
        first_name: string_at(payload, "/first_name"),
        last_name: string_at(payload, "/last_name"),
        picture,
        link: string_at(payload, "/link"),
        locale: string_at(payload, "/locale"),
        city: string_at(payload, "/location/name"),
        verified: bool_at(payload, "/verified"),
        extra: leftovers(
            payload,
            &["id", "email", "name", "first_name", "last_name", "link", "locale", "location", "verified"],
        ),
        id,
        ..Default::default()
    })
}

pub fn parse_twitter(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let username = string_at(payload, "/screen_name");
    let (first_name, last_name) = split_name(string_at(payload, "/name"));
    Ok(IdentityRecord {
        id: string_at(payload, "/id_str").or_else(|| string_at(payload, "/id")),
        email: string_at(payload, "/email"),
        link: username.as_ref().map(|u| format!("https://twitter.com/{}", u)),
        username,
        first_name,
        last_name,
        picture: string_at(payload, "/profile_image_url_https"),
        locale: string_at(payload, "/lang"),
        city: string_at(payload, "/location"),
        verified: bool_at(payload, "/verified"),
        extra: leftovers(
            payload,
            &[
                "id", "id_str", "email", "screen_name", "name", "profile_image_url_https", "lang",
                "location", "verified",
            ],
        ),
        ..Default::default()
    })
}

pub fn parse_bitbucket(payload: &Value) -> Result<IdentityRecord, String> {
    expect_object(payload)?;
    let (first_name, last_name) = split_name(string_at(payload, "/display_name"));
    Ok(IdentityRecord {
        id: string_at(payload, "/uuid").or_else(|| string_at(payload, "/account_id")),
        username: string_at(payload, "/username").or_else(|| string_at(payload, "/nickname")),
        first_name,
        last_name,
        picture: string_at(payload, "/links/avatar/href"),
        link: string_at(payload, "/links/html/href"),
        city: string_at(payload, "/location"),
        extra: leftovers(
            payload,
            &["uuid", "account_id", "username", "nickname", "display_name", "links", "location"],
        ),
        ..Default::default()
    })
}

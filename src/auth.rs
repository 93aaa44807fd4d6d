//!
//! src/auth.rs
//!
//! Spotify authorization-code flow with a local token cache, so repeated
//! runs only need the browser once
//!

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SpotifyCredentials;
use crate::fetch::SpotifyClient;
use crate::sink::write_atomic;
use crate::StoryError;

/// Tokens this close to expiry are refreshed
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    expires_in: i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    #[serde(default)]
    pub scope: Option<String>
}

impl CachedToken {
    fn from_response(resp: TokenResponse, previous_refresh: Option<String>, now: i64) -> Self {
        Self {
            access_token: resp.access_token,
            // refresh grants may omit the refresh token; keep the old one
            refresh_token: resp.refresh_token.or(previous_refresh),
            expires_at: now + resp.expires_in,
            scope: resp.scope
        }
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        self.expires_at - EXPIRY_SKEW_SECS > now
    }
}

pub struct TokenCache {
    path: PathBuf
}

impl TokenCache {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Unreadable caches are treated as empty and re-authorized
    pub fn load(&self) -> Option<CachedToken> {
        let raw = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice::<CachedToken>(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "auth.cache.unreadable");
                None
            }
        }
    }

    pub fn store(&self, token: &CachedToken) -> Result<(), StoryError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(token)?)
    }
}

/// Pulls the authorization code out of the url the browser was sent to
pub fn parse_redirect(redirected: &str, expected_state: &str) -> Result<String, StoryError> {
    let url = Url::parse(redirected.trim())
        .map_err(|e| StoryError::Auth(format!("redirect url invalid: {e}")))?;

    let mut code = None;
    let mut state = None;
    for (k, v) in url.query_pairs() {
        match k.as_ref() {
            "error" => return Err(StoryError::Auth(format!("authorization denied: {v}"))),
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return Err(StoryError::Auth("state mismatch in redirect".to_string()));
    }
    code.filter(|c| !c.is_empty())
        .ok_or_else(|| StoryError::Auth("redirect has no code".to_string()))
}

async fn exchange(request: reqwest::RequestBuilder) -> Result<TokenResponse, StoryError> {
    let resp = request.send().await
        .map_err(|e| StoryError::Auth(format!("token endpoint: {e}")))?;
    let status = resp.status();
    let body = resp.text().await
        .map_err(|e| StoryError::Auth(format!("token body: {e}")))?;
    if !status.is_success() {
        return Err(StoryError::Auth(format!("token endpoint returned {status}: {body}")));
    }
    serde_json::from_str(&body)
        .map_err(|e| StoryError::Auth(format!("token response: {e}")))
}

async fn prompt_redirect(authorize_url: &Url) -> Result<String, StoryError> {
    println!("Open this URL in a browser and authorize access:\n\n    {authorize_url}\n");
    println!("Paste the URL you were redirected to:");

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    stdin.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(StoryError::Auth("no redirect url entered".to_string()));
    }
    Ok(line)
}

///
/// Returns a bearer token, from cache, by refresh, or interactively
///
pub async fn authorize(
    client: &SpotifyClient,
    creds: &SpotifyCredentials,
    cache: &TokenCache
) -> Result<String, StoryError> {
    let now = chrono::Utc::now().timestamp();

    if let Some(cached) = cache.load() {
        if cached.is_fresh(now) {
            debug!(expires_at = cached.expires_at, "auth.cache.hit");
            return Ok(cached.access_token);
        }
        if let Some(refresh) = cached.refresh_token.clone() {
            match exchange(client.refresh_request(creds, &refresh)).await {
                Ok(resp) => {
                    let token = CachedToken::from_response(resp, Some(refresh), now);
                    cache.store(&token)?;
                    info!(expires_at = token.expires_at, "auth.refreshed");
                    return Ok(token.access_token);
                },
                Err(e) => warn!(error = %e, "auth.refresh.failed")
            }
        }
    }

    let state = uuid::Uuid::new_v4().simple().to_string();
    let url = client.authorize_url(creds, &state);
    let redirected = prompt_redirect(&url).await?;
    let code = parse_redirect(&redirected, &state)?;

    let resp = exchange(client.token_request(creds, &code)).await?;
    let token = CachedToken::from_response(resp, None, now);
    cache.store(&token)?;
    info!(expires_at = token.expires_at, "auth.authorized");
    Ok(token.access_token)
}

//!
//! src/fetch.rs
//!
//! Defines methods for hitting spotify and graph endpoints and
//! returning unparsed responses
//!

use async_trait::async_trait;
use reqwest::{Client, header, redirect, RequestBuilder};
use url::Url;

use crate::config::{HttpConfig, SpotifyApiConfig, SpotifyCredentials};
use crate::publish::{GraphTransport, RawResponse};
use crate::StoryError;

/// Client building functionality
fn client_helper(http: &HttpConfig) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(http.timeout)
        .connect_timeout(http.connect_timeout)
        .pool_max_idle_per_host(http.pool_max_idle_per_host)
        .pool_idle_timeout(Some(http.pool_idle_timeout))
        .redirect(redirect::Policy::limited(http.max_redirects as usize))
}

fn client_with_headers(http: &HttpConfig, headers: header::HeaderMap) ->
    Result<Client, StoryError> {
    client_helper(http)
        .default_headers(headers)
        .build()
        .map_err(|e| StoryError::Http(format!("build client: {e}")))
}

pub fn base_client(http: &HttpConfig) -> Result<Client, StoryError> {
    let mut h = header::HeaderMap::new();
    h.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
    client_with_headers(http, h)
}

/// Client without a json accept header, for binary downloads and uploads
pub fn raw_client(http: &HttpConfig) -> Result<Client, StoryError> {
    client_with_headers(http, header::HeaderMap::new())
}

#[derive(Clone, Debug)]
pub struct SpotifyClient {
    pub http: Client,
    pub raw: Client,
    pub cfg: SpotifyApiConfig
}

impl SpotifyClient {
    pub fn new(http_config: &HttpConfig, cfg: &SpotifyApiConfig) ->
        Result<Self, StoryError> {

        Ok( Self {
            http: base_client(http_config)?,
            raw: raw_client(http_config)?,
            cfg: cfg.clone()
        })
    }

    /// GET /authorize?client_id=&response_type=code&redirect_uri=&scope=&state=
    pub fn authorize_url(&self, creds: &SpotifyCredentials, state: &str) -> Url {
        let mut url = self.cfg.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &creds.spotipy_client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &creds.redirect_uri)
            .append_pair("scope", &self.cfg.scope)
            .append_pair("state", state);
        url
    }

    /// POST /api/token grant_type=authorization_code
    pub fn token_request(&self, creds: &SpotifyCredentials, code: &str) -> RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&creds.spotipy_client_id, Some(&creds.spotipy_client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", creds.redirect_uri.as_str())
            ])
    }

    /// POST /api/token grant_type=refresh_token
    pub fn refresh_request(&self, creds: &SpotifyCredentials, refresh_token: &str) ->
        RequestBuilder {
        self.http
            .post(self.cfg.token_url.clone())
            .basic_auth(&creds.spotipy_client_id, Some(&creds.spotipy_client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token)
            ])
    }

    /// GET /v1/me/top/tracks?limit=&time_range=
    pub fn top_tracks(&self, bearer: &str, limit: u32, time_range: &str) ->
        Result<RequestBuilder, StoryError> {
        let url = self.cfg.api_base.join("me/top/tracks")?;
        Ok(self.http.get(url).bearer_auth(bearer).query(&[
            ("limit", limit.to_string().as_str()),
            ("time_range", time_range)
        ]))
    }

    /// GET {cover url}, body is the image bytes
    pub fn download(&self, url: &str) -> RequestBuilder {
        self.raw.get(url)
    }
}

/// Graph api transport backed by reqwest
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    pub http: Client
}

impl ReqwestTransport {
    pub fn new(http_config: &HttpConfig) -> Result<Self, StoryError> {
        Ok( Self { http: base_client(http_config)? } )
    }
}

#[async_trait]
impl GraphTransport for ReqwestTransport {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) ->
        Result<RawResponse, StoryError> {
        let resp = self.http.post(url).form(form).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) ->
        Result<RawResponse, StoryError> {
        let resp = self.http.get(url).query(query).send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(RawResponse { status, body })
    }
}

//!
//! src/config.rs
//!
//! Loads environment configuration and validates the two credential
//! documents (graph/storage credentials and spotify oauth credentials)
//!

use serde::Deserialize;
use url::Url;
use std::{fmt, path::{Path, PathBuf}, time};
use crate::StoryError;

/// Constants for HTTP Config
pub const HTTP_TIMEOUT: u64 = 30000;
pub const HTTP_CONNECT_TIMEOUT: u64 = 5000;
pub const HTTP_POOL_MAX_IDLE: usize = 4;
pub const HTTP_POOL_IDLE_TIMEOUT: u64 = 90000;
pub const HTTP_MAX_REDIRECTS: u8 = 4;

pub const RETRY_MAX_ATTEMPTS: u8 = 4;
pub const RETRY_INITIAL_DELAY: u64 = 1000;
pub const RETRY_FACTOR: u32 = 2;
pub const RETRY_JITTER: bool = false;
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Constants for the publish protocol
pub const PUBLISH_SETTLE_DELAY: u64 = 1000;
pub const PUBLISH_POLL_INTERVAL: u64 = 1000;
pub const PUBLISH_READY_TIMEOUT: u64 = 30000;
pub const PRESIGN_TTL_SECS: u64 = 300;

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.instagram.com";
pub const DEFAULT_GRAPH_VERSION: &str = "v19.0";
pub const DEFAULT_STORAGE_KEY: &str = "stories/story.jpeg";

/// Wrapper over env::var that treats blank values as unset
fn env_or(s: &str, default: &str) -> String {
    match std::env::var(s) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string()
    }
}

fn env_to_u64(s: &str, default: u64) -> u64 {
    std::env::var(s)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_flag(s: &str, default: bool) -> bool {
    match std::env::var(s) {
        Ok(v) => parse_flag(&v).unwrap_or(default),
        Err(_) => default
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None
    }
}

/// Ensures that url is https
fn ensure_https(url: &Url) -> Result<(), String> {
    if url.scheme() == "https" {
        Ok(())
    } else {
        Err(format!("URL must be https: {url}"))
    }
}

fn ensure_host(url: &Url, expected_host: &str) -> Result<(), String> {
    match url.host_str() {
        Some(h) if h.eq_ignore_ascii_case(expected_host) => Ok(()),
        Some(h) => Err(
            format!("Unexpected host for {url} (got {h}, expected {expected_host})")
        ),
        None => Err(format!("URL missing host: {url}"))
    }
}

fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let mut path = url.path().to_string();
        path.push('/');
        url.set_path(&path);
    }
}

///
/// Local filesystem layout
///
#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub credentials: PathBuf,
    pub spotify_credentials: PathBuf,
    pub token_cache: PathBuf,
    pub images_dir: PathBuf,
    pub output: PathBuf,
    pub run_state: PathBuf,
    pub fonts_dir: PathBuf
}

fn build_paths() -> PathsConfig {
    PathsConfig {
        credentials: env_or("STORY_CREDENTIALS", "credentials.json").into(),
        spotify_credentials: env_or(
            "SPOTIFY_CREDENTIALS", "spotify_credentials.json"
        ).into(),
        token_cache: env_or("SPOTIFY_TOKEN_CACHE", ".spotify_cache").into(),
        images_dir: env_or("STORY_IMAGES_DIR", "images").into(),
        output: env_or("STORY_OUTPUT", "images/story.jpeg").into(),
        run_state: env_or("STORY_RUN_STATE", ".story_state.json").into(),
        fonts_dir: env_or("STORY_FONTS_DIR", "fonts").into()
    }
}

///
/// Per invocation switches
///
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub stage_only: bool,   // halt after staging, print creation id
    pub resume: bool,       // publish a previously staged creation id
    pub presign_ttl: time::Duration,
    pub strict_fonts: bool  // missing font file is fatal instead of substituted
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stage_only: false,
            resume: false,
            presign_ttl: time::Duration::from_secs(PRESIGN_TTL_SECS),
            strict_fonts: false
        }
    }
}

fn build_run() -> RunConfig {
    RunConfig {
        stage_only: env_flag("STORY_STAGE_ONLY", false),
        resume: env_flag("STORY_RESUME", false),
        presign_ttl: time::Duration::from_secs(
            env_to_u64("STORY_PRESIGN_TTL", PRESIGN_TTL_SECS)
        ),
        strict_fonts: env_flag("STORY_STRICT_FONTS", false)
    }
}

/// Configuration that Spotify expects when hitting endpoints
#[derive(Debug, Clone)]
pub struct SpotifyApiConfig {
    pub authorize_url: Url,
    pub token_url: Url,
    pub api_base: Url,
    pub scope: String
}

fn build_spotify() -> Result<SpotifyApiConfig, StoryError> {
    let authorize_url = env_or(
        "SPOTIFY_AUTHORIZE_URL", "https://accounts.spotify.com/authorize"
    );
    let token_url = env_or(
        "SPOTIFY_TOKEN_URL", "https://accounts.spotify.com/api/token"
    );
    let api_base = env_or("SPOTIFY_API_BASE", "https://api.spotify.com/v1/");

    let authorize_url = Url::parse(&authorize_url)
        .map_err(|_| StoryError::Config("SPOTIFY_AUTHORIZE_URL invalid".to_string()))?;
    let token_url = Url::parse(&token_url)
        .map_err(|_| StoryError::Config("SPOTIFY_TOKEN_URL invalid".to_string()))?;
    let mut api_base = Url::parse(&api_base)
        .map_err(|_| StoryError::Config("SPOTIFY_API_BASE invalid".to_string()))?;

    // ensure valid https and hostname for all urls
    for url in [&authorize_url, &token_url, &api_base] {
        ensure_https(url).map_err(StoryError::Config)?;
    }
    ensure_host(&authorize_url, "accounts.spotify.com").map_err(StoryError::Config)?;
    ensure_host(&token_url, "accounts.spotify.com").map_err(StoryError::Config)?;
    ensure_host(&api_base, "api.spotify.com").map_err(StoryError::Config)?;
    ensure_trailing_slash(&mut api_base);

    Ok( SpotifyApiConfig {
        authorize_url,
        token_url,
        api_base,
        scope: "user-top-read".to_string()
    })
}

///
/// Configuration for Http timeouts, retries, etc.
///
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub initial_delay: time::Duration,
    pub factor: u32,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            initial_delay: time::Duration::from_millis(RETRY_INITIAL_DELAY),
            factor: RETRY_FACTOR,
            jitter: RETRY_JITTER,
            retryable_statuses: RETRYABLE_STATUSES.to_vec()
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: time::Duration,
    pub connect_timeout: time::Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: time::Duration,
    pub max_redirects: u8,
    pub retry: RetryConfig
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_millis(HTTP_TIMEOUT),
            connect_timeout: time::Duration::from_millis(HTTP_CONNECT_TIMEOUT),
            pool_max_idle_per_host: HTTP_POOL_MAX_IDLE,
            pool_idle_timeout: time::Duration::from_millis(HTTP_POOL_IDLE_TIMEOUT),
            max_redirects: HTTP_MAX_REDIRECTS,
            retry: RetryConfig::default()
        }
    }
}

///
/// Timing of the stage -> publish handoff
///
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub settle_delay: time::Duration,  // wait before first readiness probe
    pub poll_interval: time::Duration,
    pub ready_timeout: time::Duration
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            settle_delay: time::Duration::from_millis(PUBLISH_SETTLE_DELAY),
            poll_interval: time::Duration::from_millis(PUBLISH_POLL_INTERVAL),
            ready_timeout: time::Duration::from_millis(PUBLISH_READY_TIMEOUT)
        }
    }
}

fn build_publish() -> PublishConfig {
    PublishConfig {
        ready_timeout: time::Duration::from_millis(
            env_to_u64("STORY_READY_TIMEOUT_MS", PUBLISH_READY_TIMEOUT)
        ),
        ..PublishConfig::default()
    }
}

///
/// Configuration for Logger
///

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter_directives: String,
    pub format: LogFormat,
    pub with_ansi: bool,
    pub include_file_line: bool,
    pub include_target: bool
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter_directives: "info,story_reel=debug,reqwest=warn".to_string(),
            format: LogFormat::Json,
            with_ansi: true,
            include_file_line: true,
            include_target: true
        }
    }
}

fn build_logging() -> LoggingConfig {
    let format = match env_or("STORY_LOG_FORMAT", "json").to_ascii_lowercase().as_str() {
        "pretty" | "text" => LogFormat::Pretty,
        _ => LogFormat::Json
    };
    LoggingConfig { format, ..LoggingConfig::default() }
}

///
/// Credentials document for the graph api and object storage
///

#[derive(Debug, Clone, Deserialize)]
pub struct InstagramCredentials {
    pub user_id: String,
    pub access_token: String
}

#[derive(Clone, Deserialize)]
pub struct AwsCredentials {
    pub region: String,
    pub bucket: String,
    #[serde(default = "default_storage_key")]
    pub key: String,
    pub access_key_id: String,
    pub secret_access_key: String
}

// keep secrets out of debug output
impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaConfig {
    #[serde(default = "default_graph_base")]
    pub graph_base: String,
    #[serde(default = "default_graph_version")]
    pub graph_version: String
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            graph_base: default_graph_base(),
            graph_version: default_graph_version()
        }
    }
}

fn default_storage_key() -> String { DEFAULT_STORAGE_KEY.to_string() }
fn default_graph_base() -> String { DEFAULT_GRAPH_BASE.to_string() }
fn default_graph_version() -> String { DEFAULT_GRAPH_VERSION.to_string() }

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub instagram: InstagramCredentials,
    #[serde(default)]
    pub aws: Option<AwsCredentials>,
    #[serde(default)]
    pub meta: Option<MetaConfig>,
    #[serde(default)]
    pub public_image_url: Option<String>
}

impl Credentials {
    pub fn from_json(raw: &str) -> Result<Self, StoryError> {
        let creds: Credentials = serde_json::from_str(raw)
            .map_err(|e| StoryError::Config(format!("credentials schema: {e}")))?;
        creds.validate()?;
        Ok(creds)
    }

    /// Blank strings count as unset
    pub fn public_image_url(&self) -> Option<&str> {
        self.public_image_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// {graph_base}/{graph_version} without trailing slash
    pub fn graph_base(&self) -> String {
        let meta = self.meta.clone().unwrap_or_default();
        format!("{}/{}", meta.graph_base.trim_end_matches('/'), meta.graph_version)
    }

    /// Collects every problem with the document into one error
    pub fn validate(&self) -> Result<(), StoryError> {
        let mut problems: Vec<String> = Vec::new();
        let mut require = |name: &str, value: &str| {
            if value.trim().is_empty() {
                problems.push(format!("{name} is empty"));
            }
        };

        require("instagram.user_id", &self.instagram.user_id);
        require("instagram.access_token", &self.instagram.access_token);

        if let Some(aws) = &self.aws {
            require("aws.region", &aws.region);
            require("aws.bucket", &aws.bucket);
            require("aws.key", &aws.key);
            require("aws.access_key_id", &aws.access_key_id);
            require("aws.secret_access_key", &aws.secret_access_key);
        }

        if let Some(meta) = &self.meta {
            match Url::parse(&meta.graph_base) {
                Ok(url) => if let Err(e) = ensure_https(&url) {
                    problems.push(format!("meta.graph_base: {e}"));
                },
                Err(e) => problems.push(format!("meta.graph_base invalid: {e}"))
            }
            if meta.graph_version.trim().is_empty() {
                problems.push("meta.graph_version is empty".to_string());
            }
        }

        match self.public_image_url() {
            Some(raw) => match Url::parse(raw) {
                Ok(url) => if let Err(e) = ensure_https(&url) {
                    problems.push(format!("public_image_url: {e}"));
                },
                Err(e) => problems.push(format!("public_image_url invalid: {e}"))
            },
            None if self.aws.is_none() => problems.push(
                "aws block is required when public_image_url is unset".to_string()
            ),
            None => {}
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(StoryError::Config(format!(
                "invalid credentials: {}", problems.join("; ")
            )))
        }
    }
}

///
/// Spotify oauth client credentials
///
#[derive(Clone, Deserialize)]
pub struct SpotifyCredentials {
    pub spotipy_client_id: String,
    pub spotipy_client_secret: String,
    pub redirect_uri: String
}

impl fmt::Debug for SpotifyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpotifyCredentials")
            .field("spotipy_client_id", &self.spotipy_client_id)
            .field("spotipy_client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl SpotifyCredentials {
    pub fn from_json(raw: &str) -> Result<Self, StoryError> {
        let creds: SpotifyCredentials = serde_json::from_str(raw)
            .map_err(|e| StoryError::Config(format!("spotify credentials schema: {e}")))?;

        let mut problems: Vec<String> = Vec::new();
        if creds.spotipy_client_id.trim().is_empty() {
            problems.push("spotipy_client_id is empty".to_string());
        }
        if creds.spotipy_client_secret.trim().is_empty() {
            problems.push("spotipy_client_secret is empty".to_string());
        }
        if let Err(e) = Url::parse(&creds.redirect_uri) {
            problems.push(format!("redirect_uri invalid: {e}"));
        }

        if problems.is_empty() {
            Ok(creds)
        } else {
            Err(StoryError::Config(format!(
                "invalid spotify credentials: {}", problems.join("; ")
            )))
        }
    }
}

fn read_document(path: &Path) -> Result<String, StoryError> {
    if !path.is_file() {
        return Err(StoryError::Config(
            format!("credentials file not found: {}", path.display())
        ));
    }
    Ok(std::fs::read_to_string(path)?)
}

pub fn load_credentials(path: &Path) -> Result<Credentials, StoryError> {
    Credentials::from_json(&read_document(path)?)
}

pub fn load_spotify_credentials(path: &Path) -> Result<SpotifyCredentials, StoryError> {
    SpotifyCredentials::from_json(&read_document(path)?)
}

///
/// AppConfig which holds everything the pipeline stages need
///
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub run: RunConfig,
    pub spotify: SpotifyApiConfig,
    pub http: HttpConfig,
    pub publish: PublishConfig,
    pub logging: LoggingConfig
}

///
/// Return all environment variables to caller at program start.
///
pub fn load_config() -> Result<AppConfig, StoryError> {
    dotenvy::dotenv().ok();

    let paths   = build_paths();
    let run     = build_run();
    let spotify = build_spotify()?;
    let http    = HttpConfig::default();
    let publish = build_publish();
    let logging = build_logging();

    Ok( AppConfig { paths, run, spotify, http, publish, logging } )
}

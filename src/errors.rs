//!
//! src/errors.rs
//!
//! Defines enums and methods of error conversion
//! for errors the story pipeline uses
//!
//!

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoryError {
    #[error("config error: {0}")]
    Config(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("image error: {0}")]
    Image(String),
    #[error("font error: {0}")]
    Font(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error)
}

impl StoryError {
    /// Transport failures and throttling/gateway statuses are worth another try
    pub fn is_transient(&self, retryable_statuses: &[u16]) -> bool {
        match self {
            StoryError::Http(_) => true,
            StoryError::Api { status, .. } => retryable_statuses.contains(status),
            _ => false
        }
    }
}

impl From<reqwest::Error> for StoryError {
    fn from(e: reqwest::Error) -> Self { StoryError::Http(e.to_string()) }
}

impl From<serde_json::Error> for StoryError {
    fn from(e: serde_json::Error) -> Self { StoryError::Parse(e.to_string()) }
}

impl From<image::ImageError> for StoryError {
    fn from(e: image::ImageError) -> Self { StoryError::Image(e.to_string()) }
}

impl From<url::ParseError> for StoryError {
    fn from(e: url::ParseError) -> Self { StoryError::Config(format!("bad url: {e}")) }
}

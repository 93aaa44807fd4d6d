use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Local cover art for one track, or the marker left by a failed download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverArt {
    Local(PathBuf),
    Missing
}

// Position in the ordered list decides the row on the canvas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub title: String,
    pub artist: String,
    pub cover: CoverArt
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Start,
    UrlResolved,
    Staged,
    Published,
    Aborted
}

impl PublishState {
    pub fn as_str(self) -> &'static str {
        match self {
            PublishState::Start       => "start",
            PublishState::UrlResolved => "url_resolved",
            PublishState::Staged      => "staged",
            PublishState::Published   => "published",
            PublishState::Aborted     => "aborted"
        }
    }
}

/// Staged container that has not been published yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishSession {
    pub creation_id: String,
    pub image_url: String,
    pub staged_at: chrono::DateTime<chrono::Utc>
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Staged { creation_id: String },
    Published { creation_id: String, payload: serde_json::Value }
}

//!
//! src/source.rs
//!
//! Track source: the caller's most played tracks for the short term
//! window, with cover art downloaded next to the story output
//!

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::errors::StoryError;
use crate::fetch::SpotifyClient;
use crate::layout::MAX_ROWS;
use crate::sink::DiskSink;
use crate::types::{CoverArt, TrackRecord};

pub const TOP_TRACKS_LIMIT: u32 = 5;
pub const TIME_RANGE: &str = "short_term";

#[derive(Debug, Deserialize)]
struct TopTracksPage {
    #[serde(default)]
    items: Vec<ApiTrack>
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    album: ApiAlbum
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    name: String
}

#[derive(Debug, Deserialize)]
struct ApiAlbum {
    #[serde(default)]
    images: Vec<ApiImage>
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    url: String,
    #[serde(default)]
    width: Option<u32>
}

/// Track metadata before its cover is materialized
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingTrack {
    title: String,
    artist: String,
    cover_url: Option<String>
}

/// Widest image wins; the first one is kept on ties or missing widths
fn largest_image(images: &[ApiImage]) -> Option<&ApiImage> {
    images.iter().fold(None, |best: Option<&ApiImage>, img| match best {
        Some(b) if img.width.unwrap_or(0) <= b.width.unwrap_or(0) => Some(b),
        _ => Some(img)
    })
}

fn select_tracks(page: TopTracksPage) -> Vec<PendingTrack> {
    page.items
        .into_iter()
        .take(MAX_ROWS)
        .map(|track| PendingTrack {
            cover_url: largest_image(&track.album.images).map(|i| i.url.clone()),
            artist: track.artists
                .into_iter()
                .next()
                .map(|a| a.name)
                .unwrap_or_else(|| "Unknown Artist".to_string()),
            title: track.name
        })
        .collect()
}

pub struct TrackSource {
    client: SpotifyClient,
    sink: DiskSink
}

impl TrackSource {
    pub fn new(client: SpotifyClient, sink: DiskSink) -> Self {
        Self { client, sink }
    }

    ///
    /// Fetches up to five top tracks in api order. A cover that cannot be
    /// downloaded leaves its record with CoverArt::Missing.
    ///
    pub async fn fetch(&self, bearer: &str) -> Result<Vec<TrackRecord>, StoryError> {
        let resp = self.client
            .top_tracks(bearer, TOP_TRACKS_LIMIT, TIME_RANGE)?
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(StoryError::Api { status: status.as_u16(), body });
        }

        let page: TopTracksPage = serde_json::from_str(&body)?;
        let pending = select_tracks(page);
        info!(count = pending.len(), time_range = TIME_RANGE, "source.top_tracks");

        let mut records = Vec::with_capacity(pending.len());
        for (index, track) in pending.into_iter().enumerate() {
            let cover = match &track.cover_url {
                Some(url) => match self.download(url, index).await {
                    Ok(cover) => cover,
                    Err(e) => {
                        warn!(url = %url, error = %e, "source.download.failed");
                        self.discard_stale(index);
                        CoverArt::Missing
                    }
                },
                None => {
                    warn!(title = %track.title, "source.download.no_image");
                    self.discard_stale(index);
                    CoverArt::Missing
                }
            };
            records.push(TrackRecord { title: track.title, artist: track.artist, cover });
        }
        Ok(records)
    }

    async fn download(&self, url: &str, index: usize) -> Result<CoverArt, StoryError> {
        let resp = self.client.download(url).send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoryError::Api { status: status.as_u16(), body });
        }
        let bytes = resp.bytes().await?;
        let path = self.sink.write_bytes(&DiskSink::cover_name(index), &bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "source.download.saved");
        Ok(CoverArt::Local(path))
    }

    /// A cover left over from an earlier run must not stand in for this one
    fn discard_stale(&self, index: usize) {
        let path = self.sink.root().join(DiskSink::cover_name(index));
        if std::fs::remove_file(&path).is_ok() {
            debug!(path = %path.display(), "source.download.stale_removed");
        }
    }
}

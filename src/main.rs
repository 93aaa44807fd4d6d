//!
//! src/main.rs
//!
//! Entry point: pulls the caller's top tracks, composes the story image
//! and publishes it as an Instagram story. Every stage runs in order on a
//! single thread; any failure ends the run with a non-zero exit.
//!

mod config;
mod errors;
mod logging;
mod types;

mod auth;
mod fetch;
mod persistent;
mod retry;
mod sink;
mod source;

mod compose;
mod layout;
mod publish;
mod storage;

use std::path::Path;

use tracing::info;

use crate::compose::{Composer, Fonts};
use crate::config::{AppConfig, Credentials, HttpConfig};
use crate::errors::StoryError;
use crate::fetch::ReqwestTransport;
use crate::persistent::RunStateStore;
use crate::publish::{GraphClient, GraphTransport, ImageSource, StoryPublisher};
use crate::storage::{ObjectStore, S3Target};
use crate::types::{PublishOutcome, TrackRecord};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StoryError> {
    let cfgs = config::load_config()?;
    let _guard = logging::init_logging(&cfgs.logging)?;

    info!(
        service = "story-reel",
        version = %env!("CARGO_PKG_VERSION"),
        stage_only = cfgs.run.stage_only,
        resume = cfgs.run.resume,
        "starting"
    );

    // bad credentials should fail before any network traffic
    let creds = config::load_credentials(&cfgs.paths.credentials)?;
    let mut publisher = build_publisher(&cfgs, &creds)?;

    let outcome = if cfgs.run.resume {
        publisher.resume().await?
    } else {
        run(&cfgs, &mut publisher).await?
    };
    info!(state = publisher.state().as_str(), "finished");
    report(&outcome);
    Ok(())
}

fn build_publisher(cfgs: &AppConfig, creds: &Credentials) ->
    Result<StoryPublisher<ReqwestTransport>, StoryError> {
    Ok( StoryPublisher::new(
        graph_client(ReqwestTransport::new(&cfgs.http)?, creds, &cfgs.http),
        image_source(creds, &cfgs.http)?,
        RunStateStore::new(&cfgs.paths.run_state),
        cfgs.publish.clone(),
        cfgs.run.presign_ttl
    ))
}

fn graph_client<T: GraphTransport>(transport: T, creds: &Credentials, http: &HttpConfig) ->
    GraphClient<T> {
    GraphClient::new(
        transport,
        &creds.graph_base(),
        &creds.instagram.user_id,
        &creds.instagram.access_token,
        http.retry.clone()
    )
}

/// A direct public url always wins; storage is only set up without one
fn image_source(creds: &Credentials, http: &HttpConfig) -> Result<ImageSource, StoryError> {
    match (creds.public_image_url(), &creds.aws) {
        (Some(url), _) => Ok(ImageSource::Direct(url.to_string())),
        (None, Some(aws)) => Ok(ImageSource::Storage(ObjectStore::new(
            fetch::raw_client(http)?,
            S3Target::from_credentials(aws)
        ))),
        (None, None) => Err(StoryError::Config(
            "either public_image_url or an aws block is required".to_string()
        ))
    }
}

async fn run(cfgs: &AppConfig, publisher: &mut StoryPublisher<ReqwestTransport>) ->
    Result<PublishOutcome, StoryError> {
    let spotify_creds = config::load_spotify_credentials(&cfgs.paths.spotify_credentials)?;
    let spotify = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;
    let cache = auth::TokenCache::new(&cfgs.paths.token_cache);
    let bearer = auth::authorize(&spotify, &spotify_creds, &cache).await?;

    let tracks = source::TrackSource::new(spotify, sink::DiskSink::new(&cfgs.paths.images_dir))
        .fetch(&bearer)
        .await?;

    let composer = Composer::new(Fonts::load(&cfgs.paths.fonts_dir, cfgs.run.strict_fonts)?);
    compose_and_publish(&tracks, &composer, &cfgs.paths.output, publisher, cfgs.run.stage_only)
        .await
}

/// Compose then publish; the image must be on disk before any publish call
async fn compose_and_publish<T: GraphTransport>(
    tracks: &[TrackRecord],
    composer: &Composer,
    output: &Path,
    publisher: &mut StoryPublisher<T>,
    stage_only: bool
) -> Result<PublishOutcome, StoryError> {
    let image = composer.compose(tracks, output)?;
    publisher.run(&image, stage_only).await
}

fn report(outcome: &PublishOutcome) {
    match outcome {
        PublishOutcome::Staged { creation_id } => {
            println!("Stage-only mode. Save creation_id: {creation_id}");
            println!("Publish it later with STORY_RESUME=1");
        },
        PublishOutcome::Published { payload, .. } => {
            println!("Published: {payload}");
        }
    }
}

/// Unit Tests
/// Spotify testbench and a full offline run
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use image::{Rgb, RgbImage};

    use super::*;
    use crate::config::{PublishConfig, RetryConfig};
    use crate::publish::testing::{ok, ScriptedTransport};
    use crate::types::{CoverArt, PublishState};

    fn live() -> bool {
        std::env::var("LIVE_HTTP").ok().as_deref() == Some("1")
    }

    #[tokio::test]
    async fn spotify_top_tracks_testbench() -> Result<(), StoryError> {
        dotenvy::dotenv().ok();

        if !live() {
            eprintln!("Set LIVE_HTTP=1 to run");
            return Ok(())
        }

        let cfgs = config::load_config()?;
        let creds = config::load_spotify_credentials(&cfgs.paths.spotify_credentials)?;
        let spotify = fetch::SpotifyClient::new(&cfgs.http, &cfgs.spotify)?;
        let bearer = auth::authorize(
            &spotify, &creds, &auth::TokenCache::new(&cfgs.paths.token_cache)
        ).await?;

        let dir = tempfile::tempdir()?;
        let tracks = source::TrackSource::new(spotify, sink::DiskSink::new(dir.path()))
            .fetch(&bearer)
            .await?;
        assert!(tracks.len() <= layout::MAX_ROWS);
        for t in &tracks {
            println!("{} - {} ({:?})", t.title, t.artist, t.cover);
        }
        Ok(())
    }

    fn cover(dir: &Path, name: &str, rgb: [u8; 3]) -> CoverArt {
        let path = dir.join(name);
        RgbImage::from_pixel(64, 48, Rgb(rgb)).save(&path).unwrap();
        CoverArt::Local(path)
    }

    #[tokio::test(start_paused = true)]
    async fn offline_run_composes_then_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let tracks = vec![
            TrackRecord {
                title: "Breathe Deeper".into(),
                artist: "Tame Impala".into(),
                cover: cover(dir.path(), "image-01.jpg", [200, 30, 30])
            },
            TrackRecord {
                title: "Everything In Its Right Place".into(),
                artist: "Radiohead".into(),
                cover: cover(dir.path(), "image-02.jpg", [30, 200, 30])
            },
            TrackRecord {
                title: "Nights".into(),
                artist: "Frank Ocean".into(),
                cover: CoverArt::Missing
            },
        ];

        // both a direct url and a storage block: the direct url must win
        let creds = Credentials::from_json(r#"{
            "instagram": { "user_id": "17841400000000000", "access_token": "EAAG123" },
            "aws": {
                "region": "us-east-2",
                "bucket": "story-bucket",
                "access_key_id": "AKIAEXAMPLE",
                "secret_access_key": "secret"
            },
            "public_image_url": "https://cdn.example.com/story.jpeg"
        }"#).unwrap();
        let http = HttpConfig::default();
        let source = image_source(&creds, &http).unwrap();
        assert!(matches!(&source, ImageSource::Direct(url) if url == "https://cdn.example.com/story.jpeg"));

        let transport = Arc::new(ScriptedTransport::with_posts(vec![
            ok(r#"{"id":"17900000000000001"}"#),
            ok(r#"{"id":"17900000000000002"}"#),
        ]));
        let state_path = dir.path().join("state.json");
        let mut publisher = StoryPublisher::new(
            graph_client(Arc::clone(&transport), &creds, &http),
            source,
            RunStateStore::new(&state_path),
            PublishConfig::default(),
            std::time::Duration::from_secs(300)
        );

        let output = dir.path().join("story.jpeg");
        let composer = Composer::new(Fonts::builtin());
        let outcome = compose_and_publish(&tracks, &composer, &output, &mut publisher, false)
            .await
            .unwrap();

        assert!(output.is_file());
        let written = image::open(&output).unwrap();
        assert_eq!((written.width(), written.height()), (layout::CANVAS_W, layout::CANVAS_H));

        assert_eq!(publisher.state(), PublishState::Published);
        assert!(matches!(
            outcome,
            PublishOutcome::Published { ref creation_id, .. } if creation_id == "17900000000000001"
        ));
        assert!(!state_path.exists());

        // only the two graph calls went out; nothing was sent to the bucket
        let posts = transport.posts_made();
        assert_eq!(posts.len(), 2);
        assert!(posts.iter().all(|p| p.url.starts_with("https://graph.instagram.com/v19.0/")));
        assert!(posts.iter().all(|p| !p.url.contains("amazonaws.com")));
        assert!(posts[0].url.ends_with("/17841400000000000/media"));
        assert_eq!(posts[0].param("image_url"), Some("https://cdn.example.com/story.jpeg"));
        assert_eq!(posts[0].param("media_type"), Some("STORIES"));
        assert!(posts[1].url.ends_with("/media_publish"));
        assert_eq!(posts[1].param("creation_id"), Some("17900000000000001"));
    }

    #[tokio::test(start_paused = true)]
    async fn compose_failure_skips_publish() {
        let dir = tempfile::tempdir().unwrap();
        let tracks = vec![TrackRecord {
            title: "A".into(),
            artist: "B".into(),
            cover: CoverArt::Local(dir.path().join("does-not-exist.jpg"))
        }];

        let transport = Arc::new(ScriptedTransport::default());
        let mut publisher = StoryPublisher::new(
            GraphClient::new(
                Arc::clone(&transport), "https://graph.instagram.com/v19.0", "1", "t",
                RetryConfig::default()
            ),
            ImageSource::Direct("https://cdn.example.com/story.jpeg".into()),
            RunStateStore::new(dir.path().join("state.json")),
            PublishConfig::default(),
            std::time::Duration::from_secs(300)
        );

        let output = dir.path().join("story.jpeg");
        let result = compose_and_publish(
            &tracks, &Composer::new(Fonts::builtin()), &output, &mut publisher, false
        ).await;

        assert!(result.is_err());
        assert!(transport.posts_made().is_empty());
        assert_eq!(publisher.state(), PublishState::Start);
    }

    #[test]
    fn storage_is_used_only_without_a_direct_url() {
        let creds = Credentials::from_json(r#"{
            "instagram": { "user_id": "1", "access_token": "t" },
            "aws": {
                "region": "us-east-2",
                "bucket": "story-bucket",
                "access_key_id": "AKIAEXAMPLE",
                "secret_access_key": "secret"
            },
            "public_image_url": null
        }"#).unwrap();
        let source = image_source(&creds, &HttpConfig::default()).unwrap();
        assert!(matches!(source, ImageSource::Storage(_)));
    }
}

//!
//! src/publish.rs
//!
//! Story publisher: resolves a public url for the composed image, stages a
//! STORIES container on the graph api, waits for it to be fetched, then
//! publishes it
//!
//!   start -> url_resolved -> staged -> published   (aborted on any error)
//!

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{PublishConfig, RetryConfig};
use crate::errors::StoryError;
use crate::persistent::RunStateStore;
use crate::retry::retry_with_backoff;
use crate::storage::ObjectStore;
use crate::types::{PublishOutcome, PublishSession, PublishState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String
}

/// Seam between the publish protocol and the wire
#[async_trait]
pub trait GraphTransport: Send + Sync {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) ->
        Result<RawResponse, StoryError>;
    async fn get(&self, url: &str, query: &[(&str, &str)]) ->
        Result<RawResponse, StoryError>;
}

fn expect_ok(resp: RawResponse) -> Result<RawResponse, StoryError> {
    if resp.status == 200 {
        Ok(resp)
    } else {
        Err(StoryError::Api { status: resp.status, body: resp.body })
    }
}

fn parse_body(body: &str, call: &str) -> Result<serde_json::Value, StoryError> {
    serde_json::from_str(body)
        .map_err(|e| StoryError::Parse(format!("{call} response is not json ({e}): {body}")))
}

/// Graph api endpoints for one user
pub struct GraphClient<T: GraphTransport> {
    transport: T,
    base: String,
    user_id: String,
    access_token: String,
    retry: RetryConfig
}

impl<T: GraphTransport> GraphClient<T> {
    pub fn new(
        transport: T,
        base: &str,
        user_id: &str,
        access_token: &str,
        retry: RetryConfig
    ) -> Self {
        Self {
            transport,
            base: base.trim_end_matches('/').to_string(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
            retry
        }
    }

    async fn post_checked(&self, url: &str, form: &[(&str, &str)]) ->
        Result<RawResponse, StoryError> {
        expect_ok(self.transport.post_form(url, form).await?)
    }

    /// POST /{user_id}/media media_type=STORIES; returns the creation id
    pub async fn stage(&self, image_url: &str) -> Result<String, StoryError> {
        let url = format!("{}/{}/media", self.base, self.user_id);
        let form = [
            ("image_url", image_url),
            ("media_type", "STORIES"),
            ("access_token", self.access_token.as_str()),
        ];
        info!("publish.stage");
        let resp = retry_with_backoff(&self.retry, "stage", || {
            self.post_checked(&url, &form)
        }).await?;

        let payload = parse_body(&resp.body, "stage")?;
        let creation_id = match &payload["id"] {
            serde_json::Value::String(id) if !id.is_empty() => id.clone(),
            serde_json::Value::Number(id) => id.to_string(),
            _ => return Err(StoryError::Parse(
                format!("stage response missing 'id': {}", resp.body)
            ))
        };
        info!(creation_id = %creation_id, "publish.staged");
        Ok(creation_id)
    }

    /// POST /{user_id}/media_publish; returns the confirmation payload
    pub async fn publish(&self, creation_id: &str) -> Result<serde_json::Value, StoryError> {
        let url = format!("{}/{}/media_publish", self.base, self.user_id);
        let form = [
            ("creation_id", creation_id),
            ("access_token", self.access_token.as_str()),
        ];
        info!(creation_id, "publish.publish");
        let resp = retry_with_backoff(&self.retry, "publish", || {
            self.post_checked(&url, &form)
        }).await?;
        parse_body(&resp.body, "publish")
    }

    /// GET /{creation_id}?fields=status_code
    pub async fn status(&self, creation_id: &str) -> Result<String, StoryError> {
        let url = format!("{}/{}", self.base, creation_id);
        let resp = expect_ok(self.transport.get(&url, &[
            ("fields", "status_code"),
            ("access_token", self.access_token.as_str()),
        ]).await?)?;
        let payload = parse_body(&resp.body, "status")?;
        payload["status_code"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoryError::Parse(format!("status response: {}", resp.body)))
    }
}

/// Where the platform fetches the image from
pub enum ImageSource {
    Direct(String),
    Storage(ObjectStore)
}

impl ImageSource {
    async fn resolve(&self, image_path: &Path, ttl: Duration) -> Result<String, StoryError> {
        match self {
            ImageSource::Direct(url) => {
                debug!(url = %url, "publish.url.direct");
                Ok(url.clone())
            },
            ImageSource::Storage(store) => {
                store.upload(image_path).await?;
                store.presign_get(ttl)
            }
        }
    }
}

pub struct StoryPublisher<T: GraphTransport> {
    graph: GraphClient<T>,
    source: ImageSource,
    store: RunStateStore,
    cfg: PublishConfig,
    presign_ttl: Duration,
    state: PublishState
}

impl<T: GraphTransport> StoryPublisher<T> {
    pub fn new(
        graph: GraphClient<T>,
        source: ImageSource,
        store: RunStateStore,
        cfg: PublishConfig,
        presign_ttl: Duration
    ) -> Self {
        Self { graph, source, store, cfg, presign_ttl, state: PublishState::Start }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    fn transition(&mut self, next: PublishState) {
        info!(from = self.state.as_str(), to = next.as_str(), "publish.state");
        self.state = next;
    }

    fn abort(&mut self, e: StoryError) -> StoryError {
        error!(state = self.state.as_str(), error = %e, "publish.aborted");
        self.transition(PublishState::Aborted);
        e
    }

    ///
    /// Resolve url, stage, and unless `stage_only`, wait and publish. The
    /// staged session is kept on disk until publish succeeds.
    ///
    pub async fn run(&mut self, image_path: &Path, stage_only: bool) ->
        Result<PublishOutcome, StoryError> {
        match self.drive(image_path, stage_only).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(e))
        }
    }

    /// Publish a session staged by an earlier run
    pub async fn resume(&mut self) -> Result<PublishOutcome, StoryError> {
        let session = match self.store.load() {
            Ok(Some(session)) => session,
            Ok(None) => return Err(self.abort(StoryError::NotFound(format!(
                "no staged session in {}", self.store.path().display()
            )))),
            Err(e) => return Err(self.abort(e))
        };
        info!(
            creation_id = %session.creation_id,
            staged_at = %session.staged_at,
            "publish.resume"
        );
        self.transition(PublishState::Staged);
        match self.finish(&session.creation_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.abort(e))
        }
    }

    async fn drive(&mut self, image_path: &Path, stage_only: bool) ->
        Result<PublishOutcome, StoryError> {
        if !image_path.is_file() {
            return Err(StoryError::NotFound(
                format!("image not found: {}", image_path.display())
            ));
        }
        if let ImageSource::Storage(_) = self.source {
            if self.presign_ttl <= self.cfg.settle_delay {
                return Err(StoryError::Config(format!(
                    "presigned url ttl {}s does not outlast the fetch delay",
                    self.presign_ttl.as_secs()
                )));
            }
        }

        let image_url = self.source.resolve(image_path, self.presign_ttl).await?;
        self.transition(PublishState::UrlResolved);

        let creation_id = self.graph.stage(&image_url).await?;
        self.transition(PublishState::Staged);
        self.store.save(&PublishSession {
            creation_id: creation_id.clone(),
            image_url,
            staged_at: chrono::Utc::now()
        })?;

        if stage_only {
            info!(creation_id = %creation_id, "publish.stage_only");
            return Ok(PublishOutcome::Staged { creation_id });
        }
        self.finish(&creation_id).await
    }

    async fn finish(&mut self, creation_id: &str) -> Result<PublishOutcome, StoryError> {
        self.wait_until_ready(creation_id).await?;
        let payload = self.graph.publish(creation_id).await?;
        // already published: a leftover state file is only worth a warning
        if let Err(e) = self.store.clear() {
            warn!(
                creation_id,
                path = %self.store.path().display(),
                error = %e,
                "state.clear.failed"
            );
        }
        self.transition(PublishState::Published);
        Ok(PublishOutcome::Published { creation_id: creation_id.to_string(), payload })
    }

    ///
    /// Fixed settle delay, then poll the container until FINISHED. A probe
    /// that fails outright is logged and publish goes ahead regardless.
    ///
    async fn wait_until_ready(&self, creation_id: &str) -> Result<(), StoryError> {
        sleep(self.cfg.settle_delay).await;
        let deadline = Instant::now() + self.cfg.ready_timeout;
        loop {
            match self.graph.status(creation_id).await {
                Ok(code) if code == "FINISHED" || code == "PUBLISHED" => {
                    debug!(creation_id, status = %code, "publish.ready");
                    return Ok(());
                },
                Ok(code) if code == "ERROR" || code == "EXPIRED" => {
                    return Err(StoryError::Rejected(
                        format!("container {creation_id} status {code}")
                    ));
                },
                Ok(code) => {
                    if Instant::now() >= deadline {
                        return Err(StoryError::Timeout(format!(
                            "container {creation_id} still {code} after {}s",
                            self.cfg.ready_timeout.as_secs()
                        )));
                    }
                    debug!(creation_id, status = %code, "publish.waiting");
                    sleep(self.cfg.poll_interval).await;
                },
                Err(e) => {
                    warn!(creation_id, error = %e, "publish.status.unknown");
                    return Ok(());
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::*;
    use super::*;

    const BASE: &str = "https://graph.instagram.com/v19.0";

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        publisher: StoryPublisher<Arc<ScriptedTransport>>,
        image: std::path::PathBuf,
        state_path: std::path::PathBuf,
        _dir: tempfile::TempDir
    }

    fn fixture(transport: ScriptedTransport) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("story.jpeg");
        std::fs::write(&image, b"jpeg bytes").unwrap();
        let state_path = dir.path().join(".story_state.json");

        let transport = Arc::new(transport);
        let graph = GraphClient::new(
            transport.clone(), BASE, "17841400000000000", "EAAG-token", RetryConfig::default()
        );
        let publisher = StoryPublisher::new(
            graph,
            ImageSource::Direct("https://cdn.example.com/story.jpeg".into()),
            RunStateStore::new(&state_path),
            PublishConfig::default(),
            Duration::from_secs(300)
        );
        Fixture { transport, publisher, image, state_path, _dir: dir }
    }

    #[tokio::test(start_paused = true)]
    async fn stages_then_publishes() {
        let mut f = fixture(ScriptedTransport::with_posts(vec![
            ok(r#"{"id":"17900000000000001"}"#),
            ok(r#"{"id":"17900000000000099"}"#),
        ]));

        let outcome = f.publisher.run(&f.image, false).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Published {
            creation_id: "17900000000000001".into(),
            payload: serde_json::json!({"id": "17900000000000099"})
        });
        assert_eq!(f.publisher.state(), PublishState::Published);
        assert!(!f.state_path.exists());

        let posts = f.transport.posts_made();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].url, format!("{BASE}/17841400000000000/media"));
        assert_eq!(posts[0].param("media_type"), Some("STORIES"));
        assert_eq!(posts[0].param("image_url"), Some("https://cdn.example.com/story.jpeg"));
        assert_eq!(posts[0].param("access_token"), Some("EAAG-token"));
        assert_eq!(posts[1].url, format!("{BASE}/17841400000000000/media_publish"));
        assert_eq!(posts[1].param("creation_id"), Some("17900000000000001"));
        // settle delay before publish
        assert!(posts[1].at - posts[0].at >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_retries_transient_statuses() {
        let mut f = fixture(ScriptedTransport::with_posts(vec![
            status(429),
            status(503),
            ok(r#"{"id":"42"}"#),
            ok(r#"{"id":"43"}"#),
        ]));
        f.publisher.run(&f.image, false).await.unwrap();

        let posts = f.transport.posts_made();
        assert_eq!(posts.len(), 4);
        assert_eq!(posts[1].at - posts[0].at, Duration::from_secs(1));
        assert_eq!(posts[2].at - posts[1].at, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abort() {
        let mut f = fixture(ScriptedTransport::with_posts(vec![
            status(500), status(502), status(503), status(504),
        ]));
        let err = f.publisher.run(&f.image, false).await.unwrap_err();
        assert!(matches!(err, StoryError::Api { status: 504, .. }));
        assert_eq!(f.publisher.state(), PublishState::Aborted);
        assert_eq!(f.transport.posts_made().len(), 4);
        assert!(!f.state_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_surfaces_body() {
        let mut f = fixture(ScriptedTransport::with_posts(vec![Ok(RawResponse {
            status: 400,
            body: r#"{"error":{"message":"Invalid image_url"}}"#.into()
        })]));
        let err = f.publisher.run(&f.image, false).await.unwrap_err();
        assert!(err.to_string().contains("Invalid image_url"));
        assert_eq!(f.transport.posts_made().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_without_id_is_parse_error() {
        let mut f = fixture(ScriptedTransport::with_posts(vec![ok(r#"{"success":true}"#)]));
        let err = f.publisher.run(&f.image, false).await.unwrap_err();
        assert!(matches!(err, StoryError::Parse(_)));
        assert_eq!(f.publisher.state(), PublishState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_only_persists_session_for_resume() {
        let mut f = fixture(ScriptedTransport::with_posts(vec![
            ok(r#"{"id":"777"}"#),
            ok(r#"{"id":"888"}"#),
        ]));
        let outcome = f.publisher.run(&f.image, true).await.unwrap();
        assert_eq!(outcome, PublishOutcome::Staged { creation_id: "777".into() });
        assert_eq!(f.publisher.state(), PublishState::Staged);
        assert_eq!(f.transport.posts_made().len(), 1);

        let saved = RunStateStore::new(&f.state_path).load().unwrap().unwrap();
        assert_eq!(saved.creation_id, "777");

        let outcome = f.publisher.resume().await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { ref creation_id, .. } if creation_id == "777"));
        let posts = f.transport.posts_made();
        assert_eq!(posts.len(), 2);
        assert!(posts[1].url.ends_with("/media_publish"));
        assert!(!f.state_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_session_is_not_found() {
        let mut f = fixture(ScriptedTransport::default());
        let err = f.publisher.resume().await.unwrap_err();
        assert!(matches!(err, StoryError::NotFound(_)));
        assert!(f.transport.posts_made().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_finished() {
        let transport = ScriptedTransport::with_posts(vec![ok(r#"{"id":"5"}"#), ok(r#"{"id":"6"}"#)])
            .with_gets(vec![
                ok(r#"{"status_code":"IN_PROGRESS"}"#),
                ok(r#"{"status_code":"IN_PROGRESS"}"#),
            ]);
        let mut f = fixture(transport);
        f.publisher.run(&f.image, false).await.unwrap();

        let gets = f.transport.get_calls.lock().unwrap().clone();
        assert_eq!(gets.len(), 3);
        assert_eq!(gets[0].url, format!("{BASE}/5"));
        assert_eq!(gets[0].param("fields"), Some("status_code"));
        assert_eq!(gets[1].at - gets[0].at, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn errored_container_is_rejected() {
        let transport = ScriptedTransport::with_posts(vec![ok(r#"{"id":"5"}"#)])
            .with_gets(vec![ok(r#"{"status_code":"ERROR"}"#)]);
        let mut f = fixture(transport);
        let err = f.publisher.run(&f.image, false).await.unwrap_err();
        assert!(matches!(err, StoryError::Rejected(_)));
        // staged id survives for inspection
        assert!(f.state_path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_times_out() {
        let gets = (0..64).map(|_| ok(r#"{"status_code":"IN_PROGRESS"}"#)).collect();
        let transport = ScriptedTransport::with_posts(vec![ok(r#"{"id":"5"}"#)]).with_gets(gets);
        let mut f = fixture(transport);
        let err = f.publisher.run(&f.image, false).await.unwrap_err();
        assert!(matches!(err, StoryError::Timeout(_)));
        assert_eq!(f.transport.posts_made().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_still_publishes() {
        let transport = ScriptedTransport::with_posts(vec![ok(r#"{"id":"5"}"#), ok(r#"{"id":"6"}"#)])
            .with_gets(vec![status(400)]);
        let mut f = fixture(transport);
        let outcome = f.publisher.run(&f.image, false).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_image_aborts_before_network() {
        let mut f = fixture(ScriptedTransport::default());
        let err = f.publisher.run(Path::new("/nonexistent/story.jpeg"), false).await.unwrap_err();
        assert!(matches!(err, StoryError::NotFound(_)));
        assert!(f.transport.posts_made().is_empty());
        assert_eq!(f.publisher.state(), PublishState::Aborted);
    }

    /// Turns the run-state file into a non-empty directory once publish is sent
    struct BlocksStateRemoval {
        inner: ScriptedTransport,
        state_path: std::path::PathBuf
    }

    #[async_trait]
    impl GraphTransport for BlocksStateRemoval {
        async fn post_form(&self, url: &str, form: &[(&str, &str)]) ->
            Result<RawResponse, StoryError> {
            if url.ends_with("/media_publish") {
                std::fs::remove_file(&self.state_path).unwrap();
                std::fs::create_dir(&self.state_path).unwrap();
                std::fs::write(self.state_path.join("keep"), b"x").unwrap();
            }
            self.inner.post_form(url, form).await
        }

        async fn get(&self, url: &str, query: &[(&str, &str)]) ->
            Result<RawResponse, StoryError> {
            self.inner.get(url, query).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_state_cleanup_keeps_publish_successful() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("story.jpeg");
        std::fs::write(&image, b"jpeg bytes").unwrap();
        let state_path = dir.path().join(".story_state.json");

        let transport = BlocksStateRemoval {
            inner: ScriptedTransport::with_posts(vec![ok(r#"{"id":"5"}"#), ok(r#"{"id":"6"}"#)]),
            state_path: state_path.clone()
        };
        let graph = GraphClient::new(transport, BASE, "1", "t", RetryConfig::default());
        let mut publisher = StoryPublisher::new(
            graph,
            ImageSource::Direct("https://cdn.example.com/story.jpeg".into()),
            RunStateStore::new(&state_path),
            PublishConfig::default(),
            Duration::from_secs(300)
        );

        let outcome = publisher.run(&image, false).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        assert_eq!(publisher.state(), PublishState::Published);
    }
}

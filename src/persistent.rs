//! src/persistent.rs
//!
//! Persists the staged-but-unpublished session so an interrupted run
//! can resume at publish instead of staging a second container
//!

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::StoryError;
use crate::sink::write_atomic;
use crate::types::PublishSession;

pub struct RunStateStore {
    path: PathBuf
}

impl RunStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<PublishSession>, StoryError> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read(&self.path)?;
        let session: PublishSession = serde_json::from_slice(&raw)
            .map_err(|e| StoryError::Parse(
                format!("run state {}: {e}", self.path.display())
            ))?;
        debug!(creation_id = %session.creation_id, "state.load");
        Ok(Some(session))
    }

    pub fn save(&self, session: &PublishSession) -> Result<(), StoryError> {
        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.path, &bytes)?;
        info!(
            creation_id = %session.creation_id,
            path = %self.path.display(),
            "state.saved"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoryError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "state.cleared");
                Ok(())
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into())
        }
    }
}

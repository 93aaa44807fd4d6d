//!
//! src/sink.rs
//!
//! Atomic writes of pipeline artifacts (cover art, composed story,
//! token cache, run state) into a root directory
//!

use std::{fs, io::Write, path::{Path, PathBuf}};

use crate::errors::StoryError;

pub struct DiskSink {
    root: PathBuf
}

impl DiskSink {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Numbered cover file name in api order, 1-based: image-01.jpg
    pub fn cover_name(index: usize) -> String {
        format!("image-{:02}.jpg", index + 1)
    }

    /// Writes bytes under root/key, replacing whatever was there
    pub fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, StoryError> {
        let path = self.root.join(Self::sanitize_key(key));
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

/// tempfile in the destination directory, then rename over the target
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoryError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from(".")
    };

    fs::create_dir_all(&parent).map_err(|e|
        StoryError::Io(std::io::Error::new(
            e.kind(), format!("create dir {}: {e}", parent.display())
        )))?;

    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    temp.persist(path).map_err(|e|
        StoryError::Io(std::io::Error::new(
            e.error.kind(), format!("persist {}: {}", path.display(), e.error)
        )))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cover_names_are_numbered_from_one() {
        assert_eq!(DiskSink::cover_name(0), "image-01.jpg");
        assert_eq!(DiskSink::cover_name(4), "image-05.jpg");
    }

    #[test]
    fn keys_are_sanitized() {
        assert_eq!(DiskSink::sanitize_key("../etc/passwd"), ".._etc_passwd");
        assert_eq!(DiskSink::sanitize_key("image-01.jpg"), "image-01.jpg");
    }

    #[test]
    fn write_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskSink::new(dir.path().join("images"));

        let first = sink.write_bytes("image-01.jpg", b"first").unwrap();
        let second = sink.write_bytes("image-01.jpg", b"second").unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"second");
        assert_eq!(fs::read_dir(sink.root()).unwrap().count(), 1);
    }
}

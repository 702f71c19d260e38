use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid artifact locator: {0}")]
    InvalidLocator(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub url: String,
    pub sha256: String,
    pub size_bytes: i64,
}

/// Durable home for generated and staged image bytes.
pub trait ArtifactStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredArtifact, StorageError>;
}

/// Filesystem-backed store returning file:// URLs. The key namespace is flat
/// relative paths under the base dir; traversal segments are rejected.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    base_dir: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn from_env(repo_root: &Path) -> Self {
        let raw = std::env::var("ATELIER_ARTIFACTS_DIR")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| String::from("var/artifacts"));
        let candidate = PathBuf::from(raw);
        let base = if candidate.is_absolute() {
            candidate
        } else {
            repo_root.join(candidate)
        };
        Self::new(base)
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<StoredArtifact, StorageError> {
        let relative = sanitize_key(key)?;
        let target = self.base_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target.as_path(), bytes)?;

        let absolute = target.canonicalize().unwrap_or(target);
        let url = Url::from_file_path(absolute.as_path())
            .map_err(|()| StorageError::InvalidLocator(absolute.display().to_string()))?;

        Ok(StoredArtifact {
            url: url.to_string(),
            sha256: sha256_hex(bytes),
            size_bytes: bytes.len() as i64,
        })
    }
}

fn sanitize_key(key: &str) -> Result<PathBuf, StorageError> {
    let trimmed = key.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(StorageError::InvalidKey(String::from("empty key")));
    }
    let mut out = PathBuf::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(StorageError::InvalidKey(String::from(key)));
        }
        out.push(segment);
    }
    Ok(out)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Reads bytes back from a file:// URL or plain path locator.
pub fn read_local_artifact(locator: &str) -> Result<Vec<u8>, StorageError> {
    let path = if let Ok(url) = Url::parse(locator) {
        if url.scheme() == "file" {
            url.to_file_path()
                .map_err(|()| StorageError::InvalidLocator(String::from(locator)))?
        } else if url.scheme().len() > 1 {
            return Err(StorageError::InvalidLocator(format!(
                "unsupported scheme '{}' in {locator}",
                url.scheme()
            )));
        } else {
            // Single-letter schemes are Windows drive prefixes, treat as path.
            PathBuf::from(locator)
        }
    } else {
        PathBuf::from(locator)
    };
    Ok(std::fs::read(path)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Error)]
#[error("invalid image data: {0}")]
pub struct ImageInspectError(String);

/// Decodes just enough of the artifact to establish its dimensions.
pub fn inspect_image_bytes(bytes: &[u8]) -> Result<ImageMetadata, ImageInspectError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|error| ImageInspectError(error.to_string()))?;
    Ok(ImageMetadata {
        width: i64::from(decoded.width()),
        height: i64::from(decoded.height()),
    })
}

use std::{
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

const TEMP_PREFIX: &str = ".upload.";
const TEMP_SUFFIX: &str = ".part";

#[derive(Debug, Error)]
pub(crate) enum StoreError {
    #[error("invalid upload file name {0:?}")]
    InvalidName(String),
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Upload sink that doubles as the root of the `/files` static tree.
pub(crate) struct FileStore {
    root: PathBuf,
    next_temp_id: AtomicU64,
}

impl FileStore {
    /// Creates the directory if needed.
    pub(crate) async fn open(root: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io {
                path: root.clone(),
                source,
            })?;

        Ok(Self {
            root,
            next_temp_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `bytes` under `name`, replacing any previous file of that name.
    ///
    /// Content is written to a hidden sibling and renamed into place, so the
    /// static file server never observes a partially written upload.
    pub(crate) async fn store(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let name = validate_file_name(name)?;
        let destination = self.root.join(name);
        let temp_id = self.next_temp_id.fetch_add(1, Ordering::Relaxed);
        let temp = self.root.join(format!(
            "{TEMP_PREFIX}{}.{temp_id}{TEMP_SUFFIX}",
            std::process::id()
        ));

        if let Err(source) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::Io { path: temp, source });
        }

        if let Err(source) = tokio::fs::rename(&temp, &destination).await {
            if let Err(error) = tokio::fs::remove_file(&temp).await {
                warn!(path = %temp.display(), %error, "failed to remove temporary upload");
            }
            return Err(StoreError::Io {
                path: destination,
                source,
            });
        }

        debug!(path = %destination.display(), bytes = bytes.len(), "upload stored");
        Ok(destination)
    }

    /// Names in the store root, sorted, directories suffixed with `/`.
    /// Uploads still being written are left out.
    pub(crate) async fn list(&self) -> Result<Vec<String>, StoreError> {
        let io_error = |source| StoreError::Io {
            path: self.root.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(io_error)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let mut name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if entry.file_type().await.map_err(io_error)?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Accepts a single plain path component; anything that could address a
/// location outside the store is refused.
pub(crate) fn validate_file_name(name: &str) -> Result<&str, StoreError> {
    let invalid = || StoreError::InvalidName(name.to_string());

    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return Err(invalid());
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(component)), None) if component == name => Ok(name),
        _ => Err(invalid()),
    }
}

/// URL of a stored file as served by this agent on the loopback interface.
pub(crate) fn local_file_url(port: u16, name: &str) -> Option<String> {
    let mut url = Url::parse("http://127.0.0.1/files/").ok()?;
    url.set_port(Some(port)).ok()?;
    url.path_segments_mut().ok()?.pop_if_empty().push(name);
    Some(url.to_string())
}

/// Absolute `/files/...` path for `name`, percent-encoded.
pub(crate) fn file_href(name: &str) -> Option<String> {
    let mut url = Url::parse("http://localhost/files/").ok()?;
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        match name.strip_suffix('/') {
            Some(dir) => segments.push(dir).push(""),
            None => segments.push(name),
        };
    }
    Some(url.path().to_string())
}

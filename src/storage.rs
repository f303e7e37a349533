//! File storage for uploaded and generated images

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Directory-backed image store.
///
/// Every image is written once under a fresh UUID and never modified or expired.
pub struct ImageStore {
    storage_path: PathBuf,
    url_prefix: String,
}

impl ImageStore {
    /// Create a new store rooted at `storage_path`, served under `url_prefix`
    pub fn new(storage_path: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Ensure the storage directory exists
    pub async fn ensure_storage_dir(&self) -> Result<()> {
        if !self.storage_path.exists() {
            fs::create_dir_all(&self.storage_path).await?;
            debug!(path = ?self.storage_path, "Created storage directory");
        }
        Ok(())
    }

    /// Persist `data` under a new identifier and return the identifier
    pub async fn store(&self, data: &[u8]) -> Result<String> {
        self.ensure_storage_dir().await?;

        let id = Uuid::new_v4().to_string();
        let file_path = self.storage_path.join(file_name(&id));
        fs::write(&file_path, data).await?;

        debug!(path = ?file_path, size = data.len(), "Saved image file");
        Ok(id)
    }

    /// Read the bytes stored under `id`
    pub async fn retrieve(&self, id: &str) -> Result<Vec<u8>> {
        let file_path = self.path_for(id).ok_or_else(not_found)?;

        match fs::read(&file_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Path of the file for `id`, or `None` if `id` is not a store identifier
    pub fn path_for(&self, id: &str) -> Option<PathBuf> {
        let id = Uuid::parse_str(id).ok()?;
        Some(self.storage_path.join(file_name(&id.to_string())))
    }

    /// URL path the image stored under `id` is served at
    pub fn url_for(&self, id: &str) -> String {
        format!("{}/{}", self.url_prefix, file_name(id))
    }

    pub fn root(&self) -> &Path {
        &self.storage_path
    }
}

fn file_name(id: &str) -> String {
    format!("{}.png", id)
}

fn not_found() -> AppError {
    AppError::NotFound("Uploaded file not found on disk.".to_string())
}

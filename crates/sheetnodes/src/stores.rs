use async_trait::async_trait;
use sheetcore::services::{FileStore, FileStoreError};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;

/// Files under a root directory on local disk
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` under the root, refusing anything that escapes it.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileStoreError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(FileStoreError::Rejected(format!("invalid path: {}", path)));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(path: &str, e: std::io::Error) -> FileStoreError {
    match e.kind() {
        ErrorKind::NotFound => FileStoreError::NotFound(path.to_string()),
        ErrorKind::PermissionDenied => FileStoreError::Rejected(format!("{}: {}", path, e)),
        _ => FileStoreError::Unavailable(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), FileStoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| io_error(path, e))?;
        tracing::debug!(path = %target.display(), "file written");
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|e| io_error(path, e))
    }
}

/// Files held in memory
#[derive(Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<(), FileStoreError> {
        self.files.write().await.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| FileStoreError::NotFound(path.to_string()))
    }
}

// src/store.rs

use crate::capability::ContentStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;

/// `ContentStore` over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsContentStore;

#[async_trait]
impl ContentStore for FsContentStore {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn delete_if_exists(&self, path: &Path) -> std::io::Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to fetch `{bucket}/{object}`: {source}")]
    Download {
        bucket: String,
        object: String,
        source: std::io::Error,
    },

    #[error("failed to store `{bucket}/{object}`: {source}")]
    Upload {
        bucket: String,
        object: String,
        source: std::io::Error,
    },
}

// Transfer boundary to remote object storage. Objects are addressed by
// bucket and object name; payloads only ever move between the store and
// local files.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<(), StorageError>;

    async fn upload(&self, bucket: &str, object: &str, src: &Path) -> Result<(), StorageError>;
}

// Filesystem-backed store: object `bucket/name` lives at `<root>/bucket/name`.
// Stands in for a cloud bucket service in local deployments and tests.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsStorage { root: root.into() }
    }

    fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(bucket).join(object)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<(), StorageError> {
        let src = self.object_path(bucket, object);
        let failed = |source| StorageError::Download {
            bucket: bucket.to_string(),
            object: object.to_string(),
            source: source,
        };
        let bytes = tokio::fs::copy(&src, dest).await.map_err(failed)?;
        debug!("Fetched `{}/{}` ({} bytes).", bucket, object, bytes);
        Ok(())
    }

    async fn upload(&self, bucket: &str, object: &str, src: &Path) -> Result<(), StorageError> {
        let dest = self.object_path(bucket, object);
        let failed = |source| StorageError::Upload {
            bucket: bucket.to_string(),
            object: object.to_string(),
            source: source,
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(failed)?;
        }
        let bytes = tokio::fs::copy(src, &dest).await.map_err(failed)?;
        debug!("Stored `{}/{}` ({} bytes).", bucket, object, bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let store_root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(store_root.path());

        let src = scratch.path().join("in.txt");
        tokio::fs::write(&src, b"payload").await.unwrap();
        storage
            .upload("bucket1", "dir/out.txt", &src)
            .await
            .unwrap();
        assert!(store_root.path().join("bucket1/dir/out.txt").is_file());

        let dest = scratch.path().join("back.txt");
        storage
            .download("bucket1", "dir/out.txt", &dest)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn download_of_missing_object_fails() {
        let store_root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(store_root.path());

        let err = storage
            .download("bucket1", "nope.txt", &scratch.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Download { .. }));
        assert!(err.to_string().contains("bucket1/nope.txt"));
    }
}

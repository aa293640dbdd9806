//! A remote store backed by a local directory.
//!
//! Mostly useful for testing, or for sharing a cache on a network file system. Metadata is kept
//! in a JSON sidecar file next to the object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::{self, AsyncWrite, AsyncWriteExt};

use super::{ObjectMetadata, RemoteStore, UploadOptions, UploadSource};
use crate::caching::{CacheContents, CacheError};

const ATTRS_SUFFIX: &str = ".attrs";

#[derive(Debug, Clone)]
pub struct FilesystemRemote {
    path: PathBuf,
}

impl FilesystemRemote {
    pub fn new(path: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.path.join(key)
    }

    fn attrs_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{key}{ATTRS_SUFFIX}"))
    }

    /// Atomically replaces the file at `abspath` with the contents of `source`.
    async fn write_atomic(&self, abspath: &Path, source: &UploadSource) -> CacheContents {
        let parent_dir = abspath.parent().ok_or(CacheError::InternalError)?;
        let temp_dir = parent_dir.join(".tmp");
        fs::create_dir_all(&temp_dir)
            .await
            .map_err(|e| CacheError::io("creating remote directory", e))?;

        let temp_file = NamedTempFile::new_in(&temp_dir)
            .map_err(|e| CacheError::io("creating remote temporary file", e))?;
        if let UploadSource::File(path) = source {
            let dup_file = temp_file
                .reopen()
                .map_err(|e| CacheError::io("opening remote temporary file", e))?;
            let mut dest = File::from_std(dup_file);
            let mut src = File::open(path)
                .await
                .map_err(|e| CacheError::io("opening upload source", e))?;
            io::copy(&mut src, &mut dest)
                .await
                .map_err(|e| CacheError::UploadError(e.to_string()))?;
            dest.flush()
                .await
                .map_err(|e| CacheError::UploadError(e.to_string()))?;
        }

        temp_file
            .persist(abspath)
            .map_err(|e| CacheError::UploadError(e.error.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FilesystemRemote {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        options: UploadOptions,
    ) -> CacheContents {
        let abspath = self.object_path(key);
        tracing::debug!("Storing object at {}", abspath.display());

        // The attributes go first, so an object never becomes visible without them.
        let attrs = serde_json::to_vec(&options.metadata).map_err(|e| {
            tracing::error!(error = &e as &dyn std::error::Error, "Failed to encode metadata");
            CacheError::InternalError
        })?;
        let attrs_path = self.attrs_path(key);
        if let Some(parent) = attrs_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io("creating remote directory", e))?;
        }
        fs::write(&attrs_path, attrs)
            .await
            .map_err(|e| CacheError::UploadError(e.to_string()))?;

        self.write_atomic(&abspath, &source).await
    }

    async fn download(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CacheContents<u64> {
        let abspath = self.object_path(key);
        tracing::debug!("Fetching object from {}", abspath.display());
        let mut file = match File::open(&abspath).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(CacheError::download_error(&e)),
        };
        io::copy(&mut file, destination)
            .await
            .map_err(|e| CacheError::download_error(&e))
    }

    async fn metadata(&self, key: &str) -> CacheContents<ObjectMetadata> {
        match fs::metadata(self.object_path(key)).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(e) => return Err(CacheError::download_error(&e)),
        }

        match fs::read(self.attrs_path(key)).await {
            Ok(attrs) => serde_json::from_slice(&attrs)
                .map_err(|e| CacheError::DownloadError(format!("invalid metadata: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ObjectMetadata::new()),
            Err(e) => Err(CacheError::download_error(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::OUTPUT_ID_METADATA;
    use crate::test;

    #[tokio::test]
    async fn test_missing_object() {
        test::setup();
        let dir = test::tempdir();
        let remote = FilesystemRemote::new(dir.path().to_owned()).unwrap();

        let mut buf = Vec::new();
        assert_eq!(
            remote.download("output/00", &mut buf).await,
            Err(CacheError::NotFound)
        );
        assert_eq!(
            remote.metadata("action/00").await,
            Err(CacheError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_upload_file() {
        test::setup();
        let dir = test::tempdir();
        let remote = FilesystemRemote::new(dir.path().join("bucket")).unwrap();

        let source = dir.path().join("source");
        std::fs::write(&source, b"hello world").unwrap();
        remote
            .upload(
                "prefix/output/ab",
                UploadSource::File(source),
                UploadOptions::output(),
            )
            .await
            .unwrap();

        let mut buf = Vec::new();
        let size = remote.download("prefix/output/ab", &mut buf).await.unwrap();
        assert_eq!(size, 11);
        assert_eq!(buf, b"hello world");
        assert!(remote.metadata("prefix/output/ab").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_action() {
        test::setup();
        let dir = test::tempdir();
        let remote = FilesystemRemote::new(dir.path().to_owned()).unwrap();

        remote
            .upload("action/01", UploadSource::Empty, UploadOptions::action("cd"))
            .await
            .unwrap();
        // Overwriting is fine.
        remote
            .upload("action/01", UploadSource::Empty, UploadOptions::action("ef"))
            .await
            .unwrap();

        let metadata = remote.metadata("action/01").await.unwrap();
        assert_eq!(metadata[OUTPUT_ID_METADATA], "ef");

        let mut buf = Vec::new();
        assert_eq!(remote.download("action/01", &mut buf).await, Ok(0));
    }
}

//! The remote tier of the cache.
//!
//! The remote tier is any object store implementing [`RemoteStore`]. It holds two kinds of
//! objects, laid out by [`RemoteLayout`]:
//!
//! - `action/<action>`: a zero-length object whose `output_id` metadata names the output.
//! - `output/<output>`: the raw output bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use url::Url;

use crate::caching::{ACTION_DIR, CacheContents, OUTPUT_DIR};
use crate::config::RemoteConfig;

mod filesystem;
mod gcs;
mod s3;

pub use filesystem::FilesystemRemote;
pub use gcs::GcsRemote;
pub use s3::S3Remote;

/// The metadata key on action objects that carries the hex encoded `OutputID`.
pub const OUTPUT_ID_METADATA: &str = "output_id";

/// Metadata attached to a remote object.
pub type ObjectMetadata = BTreeMap<String, String>;

/// The body of an upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// A zero-length object.
    Empty,
    /// The contents of a local file, streamed from disk.
    File(PathBuf),
}

/// Options attached to an upload.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub content_type: &'static str,
    pub metadata: ObjectMetadata,
}

impl UploadOptions {
    /// Options for an output blob.
    pub fn output() -> Self {
        Self {
            content_type: "application/octet-stream",
            metadata: ObjectMetadata::new(),
        }
    }

    /// Options for the zero-length object mapping an action to `output_id`.
    pub fn action(output_id: &str) -> Self {
        let mut metadata = ObjectMetadata::new();
        metadata.insert(OUTPUT_ID_METADATA.to_owned(), output_id.to_owned());
        Self {
            content_type: "text/plain",
            metadata,
        }
    }
}

/// An object store backing the remote tier.
///
/// Implementations must report a missing key as [`CacheError::NotFound`] and never use that
/// variant for any other failure, since the cache treats it as a miss.
///
/// [`CacheError::NotFound`]: crate::caching::CacheError::NotFound
#[async_trait]
pub trait RemoteStore: fmt::Debug + Send + Sync + 'static {
    /// A short name of the backend, used for logs and metrics.
    fn name(&self) -> &'static str;

    /// Stores `source` at `key`, replacing any existing object.
    async fn upload(&self, key: &str, source: UploadSource, options: UploadOptions)
    -> CacheContents;

    /// Streams the object at `key` into `destination`, returning the number of bytes written.
    async fn download(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CacheContents<u64>;

    /// Fetches the metadata of the object at `key`.
    async fn metadata(&self, key: &str) -> CacheContents<ObjectMetadata>;
}

/// Maps cache identifiers to remote object keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteLayout {
    prefix: String,
}

impl RemoteLayout {
    /// Creates a layout prepending `prefix` verbatim to every key.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn action_key(&self, action_id: &str) -> String {
        format!("{}{ACTION_DIR}/{action_id}", self.prefix)
    }

    pub fn output_key(&self, output_id: &str) -> String {
        format!("{}{OUTPUT_DIR}/{output_id}", self.prefix)
    }
}

/// Opens the remote store named by `url`.
///
/// Supported are `file:///path/to/dir`, `s3://bucket` and `gs://bucket`. S3 URLs accept
/// `region` and `endpoint` query parameters.
pub async fn open(url: &str, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>> {
    let url = Url::parse(url).with_context(|| format!("invalid bucket URL `{url}`"))?;

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("invalid file URL `{url}`"))?;
            let remote = FilesystemRemote::new(path).context("failed to open file bucket")?;
            Ok(Arc::new(remote))
        }
        "s3" => {
            let bucket = bucket_name(&url)?;
            let mut s3_config = config.s3.clone();
            for (key, value) in url.query_pairs() {
                match key.as_ref() {
                    "region" => s3_config.region = Some(value.into_owned()),
                    "endpoint" => s3_config.endpoint = Some(value.into_owned()),
                    other => tracing::warn!("Ignoring unknown S3 URL parameter `{other}`"),
                }
            }
            Ok(Arc::new(S3Remote::new(bucket, &s3_config).await))
        }
        "gs" => {
            let bucket = bucket_name(&url)?;
            let remote = GcsRemote::new(bucket, &config.gcs)
                .await
                .context("failed to set up GCS client")?;
            Ok(Arc::new(remote))
        }
        scheme => bail!("unsupported bucket URL scheme `{scheme}`"),
    }
}

fn bucket_name(url: &Url) -> Result<String> {
    let bucket = url
        .host_str()
        .filter(|bucket| !bucket.is_empty())
        .with_context(|| format!("missing bucket name in `{url}`"))?;
    Ok(bucket.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_without_prefix() {
        let layout = RemoteLayout::default();
        assert_eq!(layout.action_key("ab01"), "action/ab01");
        assert_eq!(layout.output_key("cd02"), "output/cd02");
    }

    #[test]
    fn test_layout_prefix_is_verbatim() {
        let layout = RemoteLayout::new("team/");
        assert_eq!(layout.action_key("ab01"), "team/action/ab01");

        let layout = RemoteLayout::new("team-");
        assert_eq!(layout.output_key("cd02"), "team-output/cd02");
    }

    #[test]
    fn test_action_options() {
        let options = UploadOptions::action("cd02");
        assert_eq!(options.metadata[OUTPUT_ID_METADATA], "cd02");
        assert_eq!(options.content_type, "text/plain");
        assert!(UploadOptions::output().metadata.is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_scheme() {
        let err = open("azblob://bucket", &RemoteConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported bucket URL scheme `azblob`");
        assert!(open("not a url", &RemoteConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_open_gcs_bucket() {
        let config = RemoteConfig {
            gcs: crate::config::GcsConfig {
                anonymous: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let remote = open("gs://build-cache", &config).await.unwrap();
        assert_eq!(remote.name(), "gcs");

        let err = open("gs:///", &config).await.unwrap_err();
        assert!(err.to_string().starts_with("missing bucket name"));
    }

    #[tokio::test]
    async fn test_open_file_bucket() {
        let dir = crate::test::tempdir();
        let url = Url::from_directory_path(dir.path()).unwrap();
        let remote = open(url.as_str(), &RemoteConfig::default()).await.unwrap();
        assert_eq!(remote.name(), "filesystem");
    }
}

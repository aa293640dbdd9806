//! Support to store cache objects in Google Cloud Storage buckets.
//!
//! Objects are accessed through the XML API, which carries custom metadata as `x-goog-meta-*`
//! headers on uploads, downloads and `HEAD` requests alike.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use tokio::io::AsyncWrite;
use tokio_util::io::{ReaderStream, StreamReader};
use url::Url;

use super::{ObjectMetadata, RemoteStore, UploadOptions, UploadSource};
use crate::caching::{CacheContents, CacheError};
use crate::config::GcsConfig;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const METADATA_HEADER_PREFIX: &str = "x-goog-meta-";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote store implementation for GCS buckets.
pub struct GcsRemote {
    client: Client,
    endpoint: Url,
    bucket: String,
    /// `None` sends requests without credentials.
    auth: Option<Arc<dyn TokenProvider>>,
}

impl fmt::Debug for GcsRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsRemote")
            .field("endpoint", &self.endpoint.as_str())
            .field("bucket", &self.bucket)
            .field("auth", &self.auth.as_ref().map(|_| "<TokenProvider>"))
            .finish()
    }
}

impl GcsRemote {
    /// Creates a client for `bucket`.
    ///
    /// Without a configured service account, credentials are discovered the usual way: the
    /// `GOOGLE_APPLICATION_CREDENTIALS` file, the metadata server, or the `gcloud` CLI.
    pub async fn new(bucket: String, config: &GcsConfig) -> Result<Self> {
        let auth: Option<Arc<dyn TokenProvider>> = if config.anonymous {
            None
        } else if let Some(path) = &config.service_account_path {
            let account = CustomServiceAccount::from_file(path).with_context(|| {
                format!("failed to load service account {}", path.display())
            })?;
            let account: Arc<dyn TokenProvider> = Arc::new(account);
            Some(account)
        } else {
            Some(
                gcp_auth::provider()
                    .await
                    .context("failed to find GCP credentials")?,
            )
        };

        let endpoint = config.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        let endpoint =
            Url::parse(endpoint).with_context(|| format!("invalid GCS endpoint `{endpoint}`"))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            bucket,
            auth,
        })
    }

    /// Returns the URL of the object at `key`.
    fn object_url(&self, key: &str) -> CacheContents<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| CacheError::InternalError)?
            .pop_if_empty()
            .push(&self.bucket)
            .extend(key.split('/'));
        Ok(url)
    }

    /// Adds a bearer token to `request`, unless the store is anonymous.
    async fn authorize(&self, request: RequestBuilder) -> CacheContents<RequestBuilder> {
        let Some(auth) = &self.auth else {
            return Ok(request);
        };

        let token = tokio::time::timeout(TOKEN_TIMEOUT, auth.token(SCOPES))
            .await
            .map_err(|_| CacheError::Timeout)?
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to get GCS token"
                );
                CacheError::PermissionDenied(err.to_string())
            })?;
        Ok(request.bearer_auth(token.as_str()))
    }

    /// Sends `request` and checks the status of its response.
    async fn send(
        &self,
        request: RequestBuilder,
        other: fn(String) -> CacheError,
    ) -> CacheContents<Response> {
        let request = self.authorize(request).await?;
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                CacheError::Timeout
            } else {
                other(err.to_string())
            }
        })?;

        let status = response.status();
        match status {
            _ if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => {
                // A missing bucket is a misconfiguration rather than a miss.
                let body = response.text().await.unwrap_or_default();
                if body.contains("NoSuchBucket") {
                    Err(other(format!("bucket {} does not exist", self.bucket)))
                } else {
                    Err(CacheError::NotFound)
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CacheError::PermissionDenied(
                format!("{status} for bucket {}", self.bucket),
            )),
            _ => Err(other(format!("error response from GCS: {status}"))),
        }
    }
}

/// Collects the custom metadata carried in `x-goog-meta-*` headers.
fn metadata_from_headers(headers: &HeaderMap) -> ObjectMetadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(METADATA_HEADER_PREFIX)?;
            Some((key.to_owned(), value.to_str().ok()?.to_owned()))
        })
        .collect()
}

#[async_trait]
impl RemoteStore for GcsRemote {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        options: UploadOptions,
    ) -> CacheContents {
        tracing::debug!("Storing to gcs: {} (in {})", key, self.bucket);

        let (body, length) = match source {
            UploadSource::Empty => (Body::from(Vec::<u8>::new()), 0),
            UploadSource::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| CacheError::UploadError(e.to_string()))?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|e| CacheError::UploadError(e.to_string()))?
                    .len();
                (Body::wrap_stream(ReaderStream::new(file)), length)
            }
        };

        let mut request = self
            .client
            .put(self.object_url(key)?)
            .header(CONTENT_TYPE, options.content_type)
            .header(CONTENT_LENGTH, length);
        for (name, value) in &options.metadata {
            request = request.header(format!("{METADATA_HEADER_PREFIX}{name}"), value);
        }

        self.send(request.body(body), CacheError::UploadError).await?;
        Ok(())
    }

    async fn download(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CacheContents<u64> {
        tracing::debug!("Fetching from gcs: {} (from {})", key, self.bucket);

        let request = self.client.get(self.object_url(key)?);
        let response = self.send(request, CacheError::DownloadError).await?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut stream = StreamReader::new(stream);
        tokio::io::copy(&mut stream, destination)
            .await
            .map_err(|e| CacheError::download_error(&e))
    }

    async fn metadata(&self, key: &str) -> CacheContents<ObjectMetadata> {
        let request = self.client.head(self.object_url(key)?);
        let response = self.send(request, CacheError::DownloadError).await?;
        Ok(metadata_from_headers(response.headers()))
    }
}

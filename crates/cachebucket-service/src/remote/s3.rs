//! Support to store cache objects in S3 buckets.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::AsyncWrite;

use super::{ObjectMetadata, RemoteStore, UploadOptions, UploadSource};
use crate::caching::{CacheContents, CacheError};
use crate::config::S3Config;

/// Remote store implementation for S3 and S3 compatible buckets.
pub struct S3Remote {
    client: Client,
    bucket: String,
}

impl fmt::Debug for S3Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Remote")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Remote {
    /// Creates a client for `bucket`.
    ///
    /// Credentials and, unless configured, the region come from the usual AWS environment.
    pub async fn new(bucket: String, config: &S3Config) -> Self {
        let mut config_loader = aws_config::from_env();
        if let Some(region) = &config.region {
            config_loader = config_loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint_url) = &config.endpoint {
            config_loader = config_loader.endpoint_url(endpoint_url);
        }
        let sdk_config = config_loader.load().await;

        // Custom endpoints are mostly self-hosted stores, which rarely support virtual hosts.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint.is_some())
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket,
        }
    }
}

/// Converts an S3 SDK error into a [`CacheError`].
///
/// Missing keys become [`CacheError::NotFound`]. A missing bucket does not, as that is a
/// misconfiguration rather than a miss.
fn map_sdk_error<E>(err: SdkError<E>, other: fn(String) -> CacheError) -> CacheError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "S3 request timed out",
            );
            return CacheError::Timeout;
        }
        SdkError::ServiceError(service_err) => {
            // The errors and status codes are explained here:
            // <https://docs.aws.amazon.com/AmazonS3/latest/API/ErrorResponses.html#ErrorCodeList>
            let status = service_err.raw().status().as_u16();
            let code = service_err.err().code();

            if matches!(status, 401 | 403) || code == Some("AuthorizationHeaderMalformed") {
                let details = service_err.err().message().unwrap_or_default().to_string();
                return CacheError::PermissionDenied(details);
            }
            // `HeadObject` has no response body, so a 404 carries no error code.
            if code != Some("NoSuchBucket")
                && (status == 404 || matches!(code, Some("NoSuchKey" | "NotFound")))
            {
                return CacheError::NotFound;
            }
        }
        _ => {}
    }

    let details = DisplayErrorContext(&err).to_string();
    tracing::debug!("S3 request failed: {details}");
    other(details)
}

#[async_trait]
impl RemoteStore for S3Remote {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn upload(
        &self,
        key: &str,
        source: UploadSource,
        options: UploadOptions,
    ) -> CacheContents {
        tracing::debug!("Storing to s3: {} (in {})", key, self.bucket);

        let body = match source {
            UploadSource::Empty => ByteStream::from_static(b""),
            UploadSource::File(path) => ByteStream::from_path(&path)
                .await
                .map_err(|e| CacheError::UploadError(DisplayErrorContext(&e).to_string()))?,
        };
        let metadata: HashMap<String, String> = options.metadata.into_iter().collect();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(options.content_type)
            .set_metadata(Some(metadata))
            .body(body)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, CacheError::UploadError))?;

        Ok(())
    }

    async fn download(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> CacheContents<u64> {
        tracing::debug!("Fetching from s3: {} (from {})", key, self.bucket);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, CacheError::DownloadError))?;

        let body = response.body.into_async_read();
        tokio::pin!(body);
        tokio::io::copy(&mut body, destination)
            .await
            .map_err(|e| CacheError::download_error(&e))
    }

    async fn metadata(&self, key: &str) -> CacheContents<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| map_sdk_error(err, CacheError::DownloadError))?;

        Ok(response.metadata.unwrap_or_default().into_iter().collect())
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::{CacheContents, CacheError, DiskStore, UploadQueue};
use crate::config::UploadConfig;
use crate::remote::{OUTPUT_ID_METADATA, RemoteLayout, RemoteStore, UploadOptions, UploadSource};

/// The local disk tier in front of the remote store.
///
/// This type does no request coalescing at all, see [`Cacher`](super::Cacher) for that.
#[derive(Debug)]
pub struct TieredCache {
    disk: DiskStore,
    remote: Arc<dyn RemoteStore>,
    layout: RemoteLayout,
    uploads: UploadQueue,
}

impl TieredCache {
    /// Creates the cache and starts its upload worker on the current runtime.
    pub fn new(
        disk: DiskStore,
        remote: Arc<dyn RemoteStore>,
        layout: RemoteLayout,
        uploads: &UploadConfig,
    ) -> Self {
        let queue = UploadQueue::start(remote.clone(), layout.clone(), uploads);
        Self {
            disk,
            remote,
            layout,
            uploads: queue,
        }
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    /// Resolves the `OutputID` an action produced.
    ///
    /// `Ok(None)` means a miss. Misses confirmed by the remote store are remembered with a
    /// negative-result marker, so the remote store is asked at most once per action.
    pub async fn resolve_action(&self, action_id: &str) -> CacheContents<Option<String>> {
        if let Some(output_id) = self.disk.action_to_output(action_id).await? {
            return Ok(Some(output_id));
        }

        if self.disk.has_miss_marker(action_id).await? {
            metric!(counter("cache.get") += 1, "result" => "negative");
            return Ok(None);
        }

        let key = self.layout.action_key(action_id);
        let metadata = match self.remote.metadata(&key).await {
            Ok(metadata) => metadata,
            Err(CacheError::NotFound) => {
                if let Err(e) = self.disk.mark_miss(action_id).await {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        action_id,
                        "Failed to write miss marker",
                    );
                }
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let output_id = match metadata.get(OUTPUT_ID_METADATA) {
            Some(output_id) if is_valid_id(output_id) => output_id.clone(),
            other => {
                tracing::warn!(action_id, output_id = ?other, "Remote action has no valid output id");
                return Ok(None);
            }
        };

        if let Err(e) = self.disk.link_action(action_id, &output_id).await {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                action_id,
                "Failed to link remote action locally",
            );
        }

        Ok(Some(output_id))
    }

    /// Makes sure the output blob is on local disk, downloading it if needed.
    ///
    /// Returns `Ok(None)` if neither tier has the blob.
    pub async fn fetch_output(&self, output_id: &str) -> CacheContents<Option<PathBuf>> {
        if self.disk.has_output(output_id).await? {
            metric!(counter("cache.get") += 1, "result" => "local");
            return Ok(Some(self.disk.locate_output(output_id)));
        }

        let start = Instant::now();
        let temp_file = self.disk.tempfile()?;
        let temp_fd = temp_file
            .reopen()
            .map_err(|e| CacheError::io("opening temporary output file", e))?;
        let mut destination = File::from_std(temp_fd);

        let key = self.layout.output_key(output_id);
        let size = match self.remote.download(&key, &mut destination).await {
            Ok(size) => size,
            Err(CacheError::NotFound) => {
                metric!(counter("cache.get") += 1, "result" => "miss");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        destination
            .flush()
            .await
            .map_err(|e| CacheError::io("flushing output to disk", e))?;
        drop(destination);

        let (path, _) = self.disk.persist_output(output_id, temp_file)?;
        tracing::info!(output_id, size, took = ?start.elapsed(), "Downloaded output");
        metric!(counter("cache.get") += 1, "result" => "remote");
        Ok(Some(path))
    }

    /// Stores an output blob locally and schedules its replication.
    ///
    /// Blobs that already exist locally are neither rewritten nor uploaded again.
    pub async fn store_output<R>(&self, output_id: &str, body: &mut R) -> CacheContents<PathBuf>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (path, existed) = self.disk.write_output(output_id, body).await?;
        if !existed {
            self.uploads.enqueue(output_id, path.clone()).await;
        }
        Ok(path)
    }

    /// Links an action to its output on both tiers.
    ///
    /// The remote action object is written synchronously, but only when the local link is new.
    pub async fn link_action(&self, action_id: &str, output_id: &str) -> CacheContents {
        if self.disk.link_action(action_id, output_id).await? {
            return Ok(());
        }

        let key = self.layout.action_key(action_id);
        self.remote
            .upload(&key, UploadSource::Empty, UploadOptions::action(output_id))
            .await
    }

    /// Waits for all scheduled uploads to finish.
    pub async fn close(&self) {
        self.uploads.close().await;
    }
}

/// Whether `id` is a non-empty hex string, as produced by the build tool.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && hex::decode(id).is_ok()
}

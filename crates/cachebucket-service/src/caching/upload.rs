use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::UploadConfig;
use crate::remote::{RemoteLayout, RemoteStore, UploadOptions, UploadSource};

/// Message to send upload tasks across the upload queue.
#[derive(Debug)]
struct UploadMessage {
    /// The hex encoded output id, which determines the remote key.
    output_id: String,
    /// The local blob to upload.
    path: PathBuf,
}

/// A bounded queue replicating output blobs to the remote store in the background.
///
/// Enqueueing waits for a free slot once the queue is full, which throttles producers instead of
/// dropping uploads. [`close`](Self::close) is a barrier: it returns once every upload that was
/// enqueued before it has finished.
#[derive(Debug)]
pub struct UploadQueue {
    queue_tx: Mutex<Option<mpsc::Sender<UploadMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    /// Spawns the upload worker onto the current runtime.
    pub fn start(remote: Arc<dyn RemoteStore>, layout: RemoteLayout, config: &UploadConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.max_upload_queue_size.max(1));
        let worker = tokio::spawn(upload_worker(
            rx,
            remote,
            layout,
            config.max_concurrent_uploads.max(1),
        ));

        Self {
            queue_tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Schedules the blob at `path` to be uploaded as `output_id`.
    ///
    /// Waits while the queue is full. After [`close`](Self::close), the upload is skipped.
    pub async fn enqueue(&self, output_id: &str, path: PathBuf) {
        let Some(queue_tx) = self.queue_tx.lock().await.clone() else {
            tracing::error!(output_id, "Upload queue closed, not replicating output");
            return;
        };

        let message = UploadMessage {
            output_id: output_id.to_owned(),
            path,
        };
        match queue_tx.send(message).await {
            Ok(()) => metric!(counter("uploads.queued") += 1),
            Err(_) => tracing::error!(output_id, "Upload worker is gone, not replicating output"),
        }
    }

    /// Stops accepting uploads and waits for all queued and running uploads to finish.
    ///
    /// Calling this more than once is fine, later calls return once the first one is done.
    pub async fn close(&self) {
        // Dropping the last sender lets the worker finish once the queue is empty.
        self.queue_tx.lock().await.take();

        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = &e as &dyn std::error::Error, "Upload worker failed");
            }
        }
    }
}

/// Long running task managing concurrent uploads to the remote store.
async fn upload_worker(
    mut work_rx: mpsc::Receiver<UploadMessage>,
    remote: Arc<dyn RemoteStore>,
    layout: RemoteLayout,
    max_concurrent_uploads: usize,
) {
    let mut uploads = JoinSet::new();
    loop {
        tokio::select! {
            message = work_rx.recv(), if uploads.len() < max_concurrent_uploads => {
                let Some(message) = message else {
                    break;
                };
                let key = layout.output_key(&message.output_id);
                uploads.spawn(single_uploader(remote.clone(), key, message));
                metric!(gauge("uploads.in_flight") = uploads.len() as u64);
            }
            Some(_) = uploads.join_next() => {
                metric!(gauge("uploads.in_flight") = uploads.len() as u64);
            }
        }
    }

    while uploads.join_next().await.is_some() {}
    metric!(gauge("uploads.in_flight") = 0u64);
    tracing::info!("Upload worker terminated");
}

/// Does a single upload to the remote store.
///
/// Failures are logged and reported as metrics, the build does not notice them.
async fn single_uploader(remote: Arc<dyn RemoteStore>, key: String, message: UploadMessage) {
    let start = Instant::now();
    let res = remote
        .upload(&key, UploadSource::File(message.path), UploadOptions::output())
        .await;
    metric!(timer("uploads.duration") = start.elapsed());

    match res {
        Ok(()) => {
            tracing::info!(
                output_id = %message.output_id,
                took = ?start.elapsed(),
                "Uploaded output",
            );
            metric!(counter("uploads.store") += 1, "status" => "ok");
        }
        Err(err) => {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                output_id = %message.output_id,
                "Error storing output on {} remote",
                remote.name(),
            );
            metric!(counter("uploads.store") += 1, "status" => "error");
        }
    }
}

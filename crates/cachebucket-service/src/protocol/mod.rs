//! The `GOCACHEPROG` wire protocol.
//!
//! The build tool writes newline-delimited JSON [`Request`]s to our stdin and reads [`Response`]s
//! from our stdout. Requests carry an `ID` and may be answered in any order, so every request is
//! handled in its own task and responses are written whenever they are ready. A `put` request
//! with a non-zero `BodySize` is followed by one more record: the body as a base64 JSON string.
//!
//! The first record we write is an unsolicited handshake listing the supported commands.
//!
//! `close` is the one request that is ordered: it is only dispatched once every request read
//! before it has been answered, and it is answered once all their uploads are done.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};

use crate::caching::Cacher;

mod types;

pub use types::*;

/// A failure that ends the whole session.
///
/// Failures of individual requests are reported in their response instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to read request")]
    Read(#[source] std::io::Error),
    #[error("failed to write response")]
    Write(#[source] std::io::Error),
    #[error("failed to decode request")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode response")]
    Encode(#[source] serde_json::Error),
    #[error("input ended before the body of request {0}")]
    MissingBody(i64),
    #[error("incorrect body length: {actual} != {expected}")]
    BodySize { actual: usize, expected: i64 },
}

/// Serializes responses onto the output stream, one complete record at a time.
struct ResponseWriter<W> {
    inner: Mutex<BufWriter<W>>,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    fn new(output: W) -> Self {
        Self {
            inner: Mutex::new(BufWriter::new(output)),
        }
    }

    async fn send(&self, response: &Response) -> Result<(), ProtocolError> {
        let mut record = serde_json::to_vec(response).map_err(ProtocolError::Encode)?;
        record.push(b'\n');

        let mut writer = self.inner.lock().await;
        writer
            .write_all(&record)
            .await
            .map_err(ProtocolError::Write)?;
        writer.flush().await.map_err(ProtocolError::Write)
    }
}

/// Serves the protocol until `input` ends.
///
/// Once the input ends, all outstanding requests are answered and all pending uploads are
/// finished before this returns.
pub async fn serve<R, W>(
    cacher: Arc<Cacher>,
    readonly: bool,
    input: R,
    output: W,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(ResponseWriter::new(output));
    writer.send(&Response::handshake(readonly)).await?;

    let mut records = BufReader::new(input).lines();
    let mut handlers = JoinSet::new();
    let result = 'session: loop {
        let line = match next_record(&mut records).await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request.normalize(),
            Err(e) => break Err(ProtocolError::Decode(e)),
        };

        let body = if request.has_body() {
            match read_body(&mut records, &request).await {
                Ok(body) => body,
                Err(e) => break Err(e),
            }
        } else {
            Vec::new()
        };

        if request.command == Command::Close {
            // Everything read before `close` must have stored and enqueued its output before
            // the upload queue shuts down.
            while let Some(done) = handlers.join_next().await {
                if let Err(e) = reap(done) {
                    break 'session Err(e);
                }
            }
        }

        let cacher = cacher.clone();
        let writer = writer.clone();
        handlers.spawn(async move {
            let response = handle(&cacher, readonly, request, body).await;
            writer.send(&response).await
        });

        while let Some(done) = handlers.try_join_next() {
            if let Err(e) = reap(done) {
                break 'session Err(e);
            }
        }
    };

    // Requests that were already accepted still get their answers.
    let mut result = result;
    while let Some(done) = handlers.join_next().await {
        result = result.and(reap(done));
    }
    cacher.close().await;

    result
}

fn reap(done: Result<Result<(), ProtocolError>, JoinError>) -> Result<(), ProtocolError> {
    match done {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = &e as &dyn std::error::Error, "Request handler failed");
            Ok(())
        }
    }
}

async fn next_record<R>(
    records: &mut tokio::io::Lines<BufReader<R>>,
) -> Result<Option<String>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match records.next_line().await.map_err(ProtocolError::Read)? {
            Some(line) if line.trim().is_empty() => continue,
            other => return Ok(other),
        }
    }
}

async fn read_body<R>(
    records: &mut tokio::io::Lines<BufReader<R>>,
    request: &Request,
) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let line = next_record(records)
        .await?
        .ok_or(ProtocolError::MissingBody(request.id))?;
    let Body(body) = serde_json::from_str(&line).map_err(ProtocolError::Decode)?;

    if i64::try_from(body.len()).ok() != Some(request.body_size) {
        return Err(ProtocolError::BodySize {
            actual: body.len(),
            expected: request.body_size,
        });
    }
    Ok(body)
}

/// Produces the response to a single request. Never fails, errors end up in the response.
async fn handle(cacher: &Cacher, readonly: bool, request: Request, body: Vec<u8>) -> Response {
    let start = Instant::now();
    let id = request.id;
    let command = request.command;
    let action_id = hex::encode(&request.action_id);

    let mut response = match catch_panic(dispatch(cacher, readonly, &request, &body)).await {
        Some(response) => response,
        None => Response::error(id, "internal error"),
    };

    if command != Command::Close && response.err.is_none() {
        if let Some(path) = response.disk_path.clone() {
            describe_output(&mut response, &path).await;
        }
    }

    let status = if response.err.is_some() { "error" } else { "ok" };
    tracing::info!(
        command = command.as_ref(),
        action = %action_id,
        output = ?response.disk_path,
        err = ?response.err,
        took = ?start.elapsed(),
        "Handled request",
    );
    metric!(
        counter("protocol.requests") += 1,
        "command" => command.as_ref(),
        "status" => status,
    );
    metric!(
        timer("protocol.requests.duration") = start.elapsed(),
        "command" => command.as_ref(),
    );

    response
}

async fn catch_panic<F: Future<Output = Response>>(future: F) -> Option<Response> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(response) => Some(response),
        Err(_) => {
            tracing::error!("Request handler panicked");
            None
        }
    }
}

async fn dispatch(cacher: &Cacher, readonly: bool, request: &Request, body: &[u8]) -> Response {
    let mut response = Response::new(request.id);

    match request.command {
        Command::Close => cacher.close().await,
        Command::Get => {
            if request.action_id.is_empty() {
                return Response::error(request.id, "missing ActionID");
            }
            match cacher.get(&hex::encode(&request.action_id)).await {
                Ok(path) => response.disk_path = path,
                Err(e) => response.err = Some(e.to_string()),
            }
            response.miss = response.disk_path.is_none();
        }
        Command::Put => {
            if readonly {
                return Response::error(request.id, "put is not supported in read-only mode");
            }
            if request.action_id.is_empty() || request.output_id.is_empty() {
                return Response::error(request.id, "missing ActionID or OutputID");
            }
            let action_id = hex::encode(&request.action_id);
            let output_id = hex::encode(&request.output_id);
            match cacher.put(&action_id, &output_id, body).await {
                Ok(path) => response.disk_path = Some(path),
                Err(e) => response.err = Some(e.to_string()),
            }
        }
        Command::Unknown => {
            return Response::error(request.id, "unknown command");
        }
    }

    response
}

/// Fills in the size, modification time and `OutputID` of the blob at `path`.
async fn describe_output(response: &mut Response, path: &Path) {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            response.err = Some(e.to_string());
            return;
        }
    };

    match path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| hex::decode(name).ok())
    {
        Some(output_id) => response.output_id = output_id,
        None => response.err = Some("invalid output id".into()),
    }

    response.size = i64::try_from(metadata.len()).unwrap_or(i64::MAX);
    response.time_nanos = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .and_then(|since_epoch| i64::try_from(since_epoch.as_nanos()).ok())
        .unwrap_or_default();
}

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use super::*;
use crate::caching::{Cacher, DiskStore, TieredCache};
use crate::config::UploadConfig;
use crate::remote::RemoteLayout;
use crate::test::{self, MockRemote, TempDir};

const ACTION: [u8; 2] = [0xa1, 0xa1];
const OUTPUT: [u8; 2] = [0x0f, 0x0f];

/// A client talking to a running [`serve`] over in-memory pipes.
struct Session {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    server: JoinHandle<Result<(), ProtocolError>>,
}

impl Session {
    fn start(dir: &TempDir, remote: Arc<MockRemote>, readonly: bool) -> Self {
        let disk = DiskStore::new(dir.path()).unwrap();
        let cache = TieredCache::new(
            disk,
            remote,
            RemoteLayout::default(),
            &UploadConfig::default(),
        );
        let cacher = Arc::new(Cacher::new(Arc::new(cache)));

        let (input, server_input) = tokio::io::duplex(1 << 16);
        let (server_output, output) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(serve(cacher, readonly, server_input, server_output));

        Self {
            input,
            output: BufReader::new(output).lines(),
            server,
        }
    }

    async fn send(&mut self, record: &impl Serialize) {
        self.send_raw(&serde_json::to_string(record).unwrap()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.input.write_all(line.as_bytes()).await.unwrap();
        self.input.write_all(b"\n").await.unwrap();
    }

    async fn recv_raw(&mut self) -> String {
        self.output.next_line().await.unwrap().unwrap()
    }

    async fn recv(&mut self) -> Response {
        serde_json::from_str(&self.recv_raw().await).unwrap()
    }

    /// Closes our end of the input and waits for the server to shut down.
    async fn finish(self) -> Result<(), ProtocolError> {
        drop(self.input);
        self.server.await.unwrap()
    }
}

fn get(id: i64, action_id: &[u8]) -> Request {
    Request {
        id,
        command: Command::Get,
        action_id: action_id.to_vec(),
        ..Default::default()
    }
}

fn put(id: i64, action_id: &[u8], output_id: &[u8], body: &[u8]) -> (Request, Body) {
    let request = Request {
        id,
        command: Command::Put,
        action_id: action_id.to_vec(),
        output_id: output_id.to_vec(),
        body_size: body.len() as i64,
        ..Default::default()
    };
    (request, Body(body.to_vec()))
}

async fn send_put(session: &mut Session, request: &Request, body: &Body) {
    session.send(request).await;
    if request.body_size > 0 {
        session.send(body).await;
    }
}

#[tokio::test]
async fn test_handshake() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);

    insta::assert_snapshot!(session.recv_raw().await, @r#"{"ID":0,"KnownCommands":["close","get","put"]}"#);
    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_put_then_get() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    let (request, body) = put(1, &ACTION, &OUTPUT, b"hello");
    send_put(&mut session, &request, &body).await;
    let response = session.recv().await;
    assert_eq!(response.id, 1);
    assert_eq!(response.err, None);
    assert_eq!(response.output_id, OUTPUT);
    assert_eq!(response.size, 5);
    assert!(response.time_nanos > 0);
    let disk_path = response.disk_path.unwrap();
    assert_eq!(disk_path, dir.path().join("output").join("0f0f"));
    assert_eq!(std::fs::read(&disk_path).unwrap(), b"hello");

    session.send(&get(2, &ACTION)).await;
    let response = session.recv().await;
    assert_eq!(response.id, 2);
    assert!(!response.miss);
    assert_eq!(response.err, None);
    assert_eq!(response.output_id, OUTPUT);
    assert_eq!(response.disk_path, Some(disk_path));

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_get_miss() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    session.send(&get(4, &ACTION)).await;
    let response = session.recv_raw().await;
    insta::assert_snapshot!(response, @r#"{"ID":4,"Miss":true}"#);

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_get_remote_error() {
    test::setup();
    let dir = test::tempdir();
    let remote = Arc::new(MockRemote::default());
    remote.set_failing(true);
    let mut session = Session::start(&dir, remote, false);
    session.recv().await;

    session.send(&get(4, &ACTION)).await;
    let response = session.recv().await;
    assert!(response.miss);
    assert_eq!(
        response.err.as_deref(),
        Some("download failed: remote unavailable")
    );

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_empty_body() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    // No body record follows a put without a body.
    let (request, body) = put(1, &ACTION, &OUTPUT, b"");
    send_put(&mut session, &request, &body).await;
    session.send(&get(2, &ACTION)).await;

    let mut responses = vec![session.recv().await, session.recv().await];
    responses.sort_by_key(|response| response.id);
    assert_eq!(responses[0].err, None);
    assert_eq!(responses[0].size, 0);
    assert_eq!(responses[0].output_id, OUTPUT);

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_legacy_object_id() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    session
        .send_raw(r#"{"ID":1,"Command":"put","ActionID":"oaE=","ObjectID":"Dw8=","BodySize":2}"#)
        .await;
    session.send_raw(r#""aGk=""#).await;
    let response = session.recv().await;
    assert_eq!(response.err, None);
    assert_eq!(response.output_id, OUTPUT);

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_readonly() {
    test::setup();
    let dir = test::tempdir();
    let remote = Arc::new(MockRemote::default());
    let mut session = Session::start(&dir, remote.clone(), true);

    insta::assert_snapshot!(session.recv_raw().await, @r#"{"ID":0,"KnownCommands":["close","get"]}"#);

    let (request, body) = put(1, &ACTION, &OUTPUT, b"hello");
    send_put(&mut session, &request, &body).await;
    let response = session.recv().await;
    assert_eq!(
        response.err.as_deref(),
        Some("put is not supported in read-only mode")
    );
    assert_eq!(response.disk_path, None);

    // The body record was consumed, the session goes on.
    session.send(&get(2, &ACTION)).await;
    assert!(session.recv().await.miss);

    session.finish().await.unwrap();
    assert!(!dir.path().join("output").join("0f0f").exists());
    assert_eq!(remote.uploads(), 0);
}

#[tokio::test]
async fn test_unknown_command() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    session.send_raw(r#"{"ID":3,"Command":"stat"}"#).await;
    insta::assert_snapshot!(session.recv_raw().await, @r#"{"ID":3,"Err":"unknown command"}"#);

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_body_size_mismatch_is_fatal() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    let (mut request, body) = put(1, &ACTION, &OUTPUT, b"hi");
    request.body_size = 5;
    send_put(&mut session, &request, &body).await;

    let err = session.server.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::BodySize {
            actual: 2,
            expected: 5
        }
    ));
    assert!(!dir.path().join("output").join("0f0f").exists());
}

#[tokio::test]
async fn test_missing_body_is_fatal() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    let (request, _) = put(1, &ACTION, &OUTPUT, b"hello");
    session.send(&request).await;

    let err = session.finish().await.unwrap_err();
    assert!(matches!(err, ProtocolError::MissingBody(1)));
}

#[tokio::test]
async fn test_malformed_request_is_fatal() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    session.send_raw("{not json").await;
    let err = session.server.await.unwrap().unwrap_err();
    assert!(matches!(err, ProtocolError::Decode(_)));
}

#[tokio::test]
async fn test_close_drains_uploads() {
    test::setup();
    let dir = test::tempdir();
    let remote = Arc::new(MockRemote::default().with_upload_delay(Duration::from_millis(50)));
    let mut session = Session::start(&dir, remote.clone(), false);
    session.recv().await;

    for i in 0..5u8 {
        let (request, body) = put(i64::from(i) + 1, &[0xa0, i], &[0x00, i], &[i; 3]);
        send_put(&mut session, &request, &body).await;
    }
    for _ in 0..5 {
        assert_eq!(session.recv().await.err, None);
    }

    session
        .send(&Request {
            id: 6,
            command: Command::Close,
            ..Default::default()
        })
        .await;
    insta::assert_snapshot!(session.recv_raw().await, @r#"{"ID":6}"#);

    // Five action objects and five outputs are in place before the close is acknowledged.
    assert_eq!(remote.uploads(), 10);
    assert_eq!(remote.object("output/0004").unwrap(), [4, 4, 4]);

    session.finish().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_close_drains_uploads() {
    test::setup();
    let dir = test::tempdir();
    let remote = Arc::new(MockRemote::default().with_upload_delay(Duration::from_millis(20)));
    let mut session = Session::start(&dir, remote.clone(), false);
    session.recv().await;

    // Large bodies keep the puts busy while `close` is already read.
    for i in 0..5u8 {
        let body = vec![i; 1 << 20];
        let (request, body) = put(i64::from(i) + 1, &[0xa0, i], &[0x00, i], &body);
        send_put(&mut session, &request, &body).await;
    }
    session
        .send(&Request {
            id: 6,
            command: Command::Close,
            ..Default::default()
        })
        .await;

    for _ in 0..5 {
        let response = session.recv().await;
        assert_ne!(response.id, 6);
        assert_eq!(response.err, None);
    }
    insta::assert_snapshot!(session.recv_raw().await, @r#"{"ID":6}"#);

    assert_eq!(remote.uploads(), 10);
    for i in 0..5u8 {
        let key = format!("output/00{}", hex::encode([i]));
        assert_eq!(remote.object(&key).unwrap().len(), 1 << 20);
    }

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_panic_becomes_error_response() {
    test::setup();
    let dir = test::tempdir();
    let remote = Arc::new(MockRemote::default());
    let mut session = Session::start(&dir, remote.clone(), false);
    session.recv().await;

    remote.set_panicking(true);
    session.send(&get(1, &ACTION)).await;
    insta::assert_snapshot!(session.recv_raw().await, @r#"{"ID":1,"Err":"internal error"}"#);

    remote.set_panicking(false);
    session.send(&get(2, &ACTION)).await;
    let response = session.recv().await;
    assert_eq!(response.id, 2);
    assert!(response.miss);
    assert_eq!(response.err, None);

    session.finish().await.unwrap();
}

#[tokio::test]
async fn test_eof_drains_uploads() {
    test::setup();
    let dir = test::tempdir();
    let remote = Arc::new(MockRemote::default().with_upload_delay(Duration::from_millis(50)));
    let mut session = Session::start(&dir, remote.clone(), false);
    session.recv().await;

    let (request, body) = put(1, &ACTION, &OUTPUT, b"hello");
    send_put(&mut session, &request, &body).await;
    session.recv().await;

    session.finish().await.unwrap();
    assert_eq!(remote.object("output/0f0f").unwrap(), b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_responses() {
    test::setup();
    let dir = test::tempdir();
    let mut session = Session::start(&dir, Arc::new(MockRemote::default()), false);
    session.recv().await;

    for i in 0..32u8 {
        let (request, body) = put(i64::from(i) * 2, &[0xa0, i], &[0x00, i % 4], &[i % 4; 64]);
        send_put(&mut session, &request, &body).await;
        session.send(&get(i64::from(i) * 2 + 1, &[0xb0, i])).await;
    }

    // Every response is a complete record, and every request is answered exactly once.
    let mut ids = BTreeSet::new();
    for _ in 0..64 {
        let response = session.recv().await;
        if response.id % 2 == 0 {
            assert_eq!(response.err, None);
            assert_eq!(response.size, 64);
        } else {
            assert!(response.miss);
        }
        assert!(ids.insert(response.id));
    }
    assert_eq!(ids.len(), 64);

    session.finish().await.unwrap();
}

use std::time::Duration;

use sha2::{Digest, Sha256};
use shardbench::{Error, Sample, ShardRemote};
use shardbench_test::server::{GET_TIMER, INSERT_TIMER, Options, SHARD_ID, TestServer};

fn remote(server: &TestServer) -> ShardRemote {
    ShardRemote::builder(&server.base_url()).build().unwrap()
}

#[tokio::test]
async fn uploads_and_fetches() {
    shardbench_test::tracing::init();
    let server = TestServer::new().await;
    let remote = remote(&server);

    let sample = Sample::new("configuration.yml", &b"server:\n  port: 8080\n"[..]);
    let receipt = remote.upload(0, &sample).await.unwrap();

    assert_eq!(receipt.id, hex::encode(Sha256::digest(&sample.data)));
    assert_eq!(receipt.shard.as_deref(), Some(SHARD_ID));
    assert_eq!(receipt.filename, None);

    let body = remote.fetch(0, &receipt.id).await.unwrap();
    assert_eq!(body, sample.data);
}

#[tokio::test]
async fn reports_filename_when_echoed() {
    let server = TestServer::with_options(Options {
        echo_filename: true,
        ..Default::default()
    })
    .await;
    let remote = ShardRemote::builder(&server.base_url())
        .shard_path("/api/shard")
        .build()
        .unwrap();

    let sample = Sample::new("Chord.pdf", &b"%PDF-1.4"[..]);
    let receipt = remote.upload(0, &sample).await.unwrap();

    assert_eq!(receipt.filename.as_deref(), Some("Chord.pdf"));
    assert_eq!(server.object_count(), 1);
}

#[tokio::test]
async fn receipt_without_id_is_rejected() {
    let server = TestServer::with_options(Options {
        omit_id: true,
        ..Default::default()
    })
    .await;
    let remote = remote(&server);

    let sample = Sample::new("configuration.yml", &b"server: {}\n"[..]);
    let err = remote.upload(0, &sample).await.unwrap_err();
    assert!(matches!(err, Error::MissingField("id")), "got {err:?}");
}

#[tokio::test]
async fn non_json_receipt_is_rejected() {
    let server = TestServer::with_options(Options {
        html_receipts: true,
        ..Default::default()
    })
    .await;
    let remote = remote(&server);

    let sample = Sample::new("requirements.txt", &b"requests\n"[..]);
    let err = remote.upload(0, &sample).await.unwrap_err();
    assert!(matches!(err, Error::Json(_)), "got {err:?}");
}

#[tokio::test]
async fn unknown_object_is_not_found() {
    let server = TestServer::new().await;
    let remote = remote(&server);

    let err = remote.fetch(0, "deadbeef").await.unwrap_err();
    assert!(matches!(err, Error::NotFound { id } if id == "deadbeef"));
}

#[tokio::test]
async fn corrupted_object_is_reported() {
    let server = TestServer::new().await;
    let remote = remote(&server);

    let sample = Sample::new("photo.jpg", &b"\xff\xd8\xff\xe0"[..]);
    let receipt = remote.upload(0, &sample).await.unwrap();
    server.corrupt(&receipt.id);

    let (id, message) = match remote.fetch(0, &receipt.id).await {
        Err(Error::Corrupted { id, message }) => (id, message),
        other => panic!("expected corruption, got {other:?}"),
    };
    assert_eq!(id, receipt.id);
    assert!(message.contains("does not match computed checksum"));
}

#[tokio::test]
async fn failed_upload_carries_status() {
    let server = TestServer::new().await;
    let remote = remote(&server);
    server.fail_next_uploads(1);

    let sample = Sample::new("icon.png", &b"\x89PNG"[..]);
    let (status, body) = match remote.upload(0, &sample).await {
        Err(Error::Status { status, body, .. }) => (status, body),
        other => panic!("expected status error, got {other:?}"),
    };
    assert_eq!(status, 500);
    assert_eq!(body, "injected failure");

    // the next upload goes through again
    remote.upload(0, &sample).await.unwrap();
    assert_eq!(server.upload_count(), 2);
}

#[tokio::test]
async fn wrong_route_is_a_status_error() {
    let server = TestServer::new().await;
    let remote = ShardRemote::builder(&server.base_url())
        .shard_path("/shards")
        .build()
        .unwrap();

    let sample = Sample::new("requirements.txt", &b"requests\n"[..]);
    let err = remote.upload(0, &sample).await.unwrap_err();
    assert!(matches!(err, Error::Status { status, .. } if status == 404));
}

#[tokio::test]
async fn reads_server_timers() {
    let server = TestServer::new().await;
    let remote = remote(&server);

    let sample = Sample::new("performanceTest.py", &b"import requests\n"[..]);
    let receipt = remote.upload(0, &sample).await.unwrap();
    remote.fetch(0, &receipt.id).await.unwrap();
    remote.fetch(0, &receipt.id).await.unwrap();

    let document = remote.metrics(0).await.unwrap();
    assert_eq!(document.timer(INSERT_TIMER).unwrap().count, Some(1));
    assert_eq!(document.timer(GET_TIMER).unwrap().count, Some(2));
    assert!(document.timer(GET_TIMER).unwrap().p99.is_some());
}

#[tokio::test]
async fn unavailable_metrics_fail() {
    let server = TestServer::with_options(Options {
        metrics_unavailable: true,
        ..Default::default()
    })
    .await;
    let remote = remote(&server);

    let err = remote.metrics(0).await.unwrap_err();
    assert!(matches!(err, Error::Status { status, .. } if status == 503));
}

#[tokio::test]
async fn unreachable_remote_fails() {
    // reserve a free port and release it again, nothing listens there afterwards
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let remote = ShardRemote::builder(&base_url)
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let sample = Sample::new("executable.jar", &b"PK\x03\x04"[..]);

    let err = remote.upload(0, &sample).await.unwrap_err();
    assert!(matches!(err, Error::Reqwest(_)), "got {err:?}");
}

use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::time;

use telemetry_collector::config::ServiceConfig;
use telemetry_collector::error::{ClientError, SetupError};
use telemetry_collector::producer::{FixedReadings, ProducerClient};
use telemetry_collector::region::SharedRegion;
use telemetry_collector::service::Service;

fn test_config(dir: &tempfile::TempDir) -> ServiceConfig {
    ServiceConfig {
        service_name: "TempServerTest".into(),
        region_name: format!("/telemetry-e2e-{}", uuid::Uuid::new_v4()),
        socket_dir: dir.path().to_owned(),
        publish_period_secs: 1,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producers_feed_window_and_region_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let region_name = config.region_name.clone();

    let service = Service::start(config).unwrap();
    let socket_path = service.socket_path().to_owned();
    let window = service.window();
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(service.run(shutdown));

    // ── One request, one reply ──────────────────────────────────
    let mut first = ProducerClient::connect(&socket_path, 1234).await.unwrap();
    let reply = first.send(27.5).await.unwrap();
    assert!(reply.as_str().contains("27.5"));
    assert!(reply.as_str().contains("1234"));

    let snap = window.snapshot();
    assert_eq!(snap.count, 1);
    assert_eq!(snap.maximum, 27.5);

    // ── A second producer on its own connection ─────────────────
    let second = ProducerClient::connect(&socket_path, 42).await.unwrap();
    let mut readings = FixedReadings::new(vec![20.0, 15.0, 40.0]);
    second
        .run(&mut readings, Duration::from_millis(1), Some(3))
        .await
        .unwrap();

    let snap = window.snapshot();
    assert_eq!(snap.count, 4);
    assert_eq!(snap.minimum, 15.0);
    assert_eq!(snap.maximum, 40.0);
    assert_eq!(snap.average, 25.625);

    // ── An unrelated reader maps the region by name ─────────────
    let reader = SharedRegion::open(&region_name).unwrap();
    time::sleep(Duration::from_millis(1_500)).await;
    let summary = reader.read().unwrap();
    assert_eq!(summary.count, 4);
    assert_eq!(summary.average, 25.625);
    assert_eq!(summary.minimum, 15.0);
    assert_eq!(summary.maximum, 40.0);

    // ── Deliberate teardown ─────────────────────────────────────
    stop.send(true).unwrap();
    time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server did not stop")
        .unwrap();

    assert!(!socket_path.exists());
    assert!(SharedRegion::open(&region_name).is_err());

    // The producer's next exchange fails instead of hanging.
    let err = first.send(1.0).await.err().unwrap();
    assert!(matches!(err, ClientError::Exchange(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_connection_does_not_affect_other_producers() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::start(test_config(&dir)).unwrap();
    let socket_path = service.socket_path().to_owned();
    let window = service.window();
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(service.run(shutdown));

    // A peer that dies halfway through a request frame.
    let mut broken = UnixStream::connect(&socket_path).await.unwrap();
    broken.write_all(&[1, 0, 0, 0, 9]).await.unwrap();
    drop(broken);
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(window.snapshot().count, 0);

    let mut healthy = ProducerClient::connect(&socket_path, 7).await.unwrap();
    let reply = healthy.send(3.0).await.unwrap();
    assert_eq!(reply.as_str(), "ACK: received 3.000 from pid 7");

    let snap = window.snapshot();
    assert_eq!(snap.count, 1);
    assert_eq!(snap.average, 3.0);

    stop.send(true).unwrap();
    time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_loop_ends_with_error_once_server_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service::start(test_config(&dir)).unwrap();
    let socket_path = service.socket_path().to_owned();
    let window = service.window();
    let (stop, shutdown) = watch::channel(false);
    let server = tokio::spawn(service.run(shutdown));

    let producer = ProducerClient::connect(&socket_path, 99).await.unwrap();

    stop.send(true).unwrap();
    time::timeout(Duration::from_secs(2), server)
        .await
        .expect("server did not stop")
        .unwrap();

    let mut readings = FixedReadings::new(vec![21.0]);
    let result = time::timeout(
        Duration::from_secs(2),
        producer.run(&mut readings, Duration::from_millis(1), Some(5)),
    )
    .await
    .expect("producer kept looping after a failed exchange");

    assert!(matches!(result, Err(ClientError::Exchange(_))));
    assert_eq!(window.snapshot().count, 0);
}

#[tokio::test]
async fn producer_without_server_fails_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let err = ProducerClient::connect(&config.socket_path(), 1)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ClientError::Connect { .. }));
}

#[tokio::test]
async fn unusable_endpoint_directory_is_a_setup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.socket_dir = dir.path().join("missing").join("deeper");
    let region_name = config.region_name.clone();

    let err = Service::start(config).err().unwrap();
    assert!(matches!(err, SetupError::Bind { .. }));
    // Nothing is left behind after a failed start.
    assert!(SharedRegion::open(&region_name).is_err());
}

//! The HTTP firmware source against a loopback server.
//!
//! These run on the real clock: the client talks to a real socket.

use std::time::{Duration, Instant};

use at_test_utils::{MemorySlot, MockHttpServer, MockResponse, firmware_image};
use at_updater::{
    FirmwareSource, HttpFirmwareSource, SourceError, UpdateJob, UpdateLimits, UpdatePhase,
    UpdatePlan,
};
use sha2::{Digest, Sha256};

const PATH: &str = "/firmware/2.0.0.bin";
const IMAGE_LEN: usize = 150_000;

fn plan(server: &MockHttpServer, image: &[u8]) -> UpdatePlan {
    UpdatePlan {
        target_version: "2.0.0".to_owned(),
        locator: server.url(PATH),
        expected_checksum: Some(hex::encode(Sha256::digest(image))),
        declared_size: None,
    }
}

fn limits(request_timeout: Duration) -> UpdateLimits {
    UpdateLimits {
        chunk_size: 8192,
        request_timeout,
        ..UpdateLimits::default()
    }
}

fn source() -> HttpFirmwareSource {
    HttpFirmwareSource::new("term-07", "1.4.0")
}

/// Step the job, pausing between steps the way the terminal's loop does.
async fn run_paced(
    job: &mut UpdateJob,
    source: &HttpFirmwareSource,
    slot: &mut MemorySlot,
    pause: Duration,
) {
    while !job.is_finished() {
        job.step(source, slot).await;
        tokio::time::sleep(pause).await;
    }
}

#[tokio::test]
async fn paced_download_outlasting_request_timeout_completes() {
    let server = MockHttpServer::start().await.unwrap();
    let image = firmware_image(IMAGE_LEN);
    server.route(PATH, MockResponse::ok(image.clone()));
    let source = source();
    let handle = MemorySlot::with_boot_image(b"current".to_vec());
    let mut slot = handle.clone();

    let timeout = Duration::from_millis(500);
    let mut job = UpdateJob::new(plan(&server, &image), limits(timeout));
    let started = Instant::now();
    run_paced(&mut job, &source, &mut slot, Duration::from_millis(50)).await;

    assert!(started.elapsed() > timeout, "download should outlast one timeout");
    assert_eq!(job.phase(), UpdatePhase::Complete, "{:?}", job.failure());
    assert_eq!(handle.boot_image(), image);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].header("x-device-id"), Some("term-07"));
    assert_eq!(
        requests[0].header("user-agent"),
        Some("attendance-terminal/1.4.0")
    );
}

#[tokio::test]
async fn non_200_status_is_reported() {
    let server = MockHttpServer::start().await.unwrap();
    server.route(PATH, MockResponse::status(503, "maintenance"));

    let result = source()
        .open(&server.url(PATH), Duration::from_secs(2))
        .await;
    assert!(matches!(result, Err(SourceError::Status(503))));

    let image = firmware_image(IMAGE_LEN);
    let handle = MemorySlot::with_boot_image(b"current".to_vec());
    let mut job = UpdateJob::new(plan(&server, &image), limits(Duration::from_secs(2)));
    job.run(&source(), &mut handle.clone()).await;
    assert_eq!(job.phase(), UpdatePhase::Failed);
    assert!(job.failure().unwrap().contains("503"), "{:?}", job.failure());
    assert_eq!(handle.boot_image(), b"current");
}

#[tokio::test]
async fn missing_content_length_fails_before_staging() {
    let server = MockHttpServer::start().await.unwrap();
    let image = firmware_image(IMAGE_LEN);
    server.route(PATH, MockResponse::ok(image.clone()).without_content_length());
    let handle = MemorySlot::with_boot_image(b"current".to_vec());

    let mut job = UpdateJob::new(plan(&server, &image), limits(Duration::from_secs(2)));
    job.run(&source(), &mut handle.clone()).await;

    assert_eq!(job.phase(), UpdatePhase::Failed);
    assert!(
        job.failure().unwrap().contains("content length"),
        "{:?}",
        job.failure()
    );
    assert_eq!(job.progress().bytes_written, 0);
    assert_eq!(handle.boot_image(), b"current");
}

#[tokio::test]
async fn connection_closed_mid_body_fails_and_keeps_boot_image() {
    let server = MockHttpServer::start().await.unwrap();
    let image = firmware_image(IMAGE_LEN);
    server.route(PATH, MockResponse::ok(image.clone()).close_after(40_000));
    let handle = MemorySlot::with_boot_image(b"current".to_vec());

    let mut job = UpdateJob::new(plan(&server, &image), limits(Duration::from_secs(2)));
    job.run(&source(), &mut handle.clone()).await;

    assert_eq!(job.phase(), UpdatePhase::Failed);
    assert!(job.progress().bytes_written <= 40_000);
    assert_eq!(handle.boot_image(), b"current");
}

#[tokio::test]
async fn stalled_body_times_out_per_read() {
    let server = MockHttpServer::start().await.unwrap();
    let image = firmware_image(IMAGE_LEN);
    server.route(PATH, MockResponse::ok(image.clone()).stall_after(20_000));
    let handle = MemorySlot::with_boot_image(b"current".to_vec());

    let mut job = UpdateJob::new(plan(&server, &image), limits(Duration::from_millis(300)));
    let started = Instant::now();
    job.run(&source(), &mut handle.clone()).await;

    assert_eq!(job.phase(), UpdatePhase::Failed);
    assert!(
        job.failure().unwrap().contains("timed out"),
        "{:?}",
        job.failure()
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(handle.boot_image(), b"current");
}

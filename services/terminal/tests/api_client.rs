/// The backend request/response client against a loopback HTTP server.
mod support;

use std::time::Duration;

use at_protocol::{AttendanceRecord, RecordKind};
use at_test_utils::{MockBroker, MockHttpServer, MockResponse};
use serde_json::json;
use support::{build_with_api, identity, rfid};
use terminal::api::{ApiClient, ApiError};
use terminal::config::{QueueConfig, UpdateConfig};

const PATH: &str = "/device-api";

async fn server_and_client() -> (MockHttpServer, ApiClient) {
    let server = MockHttpServer::start().await.unwrap();
    let client = ApiClient::new(server.url(PATH), &identity(), Duration::from_secs(2));
    (server, client)
}

#[tokio::test]
async fn authenticate_posts_identity_and_action() {
    let (server, mut client) = server_and_client().await;
    server.route(PATH, MockResponse::json(200, &json!({"ok": true})));

    client.authenticate().await.unwrap();

    assert_eq!(client.last_response_code(), Some(200));
    assert_eq!(client.last_error(), None);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].header("content-type"), Some("application/json"));
    let body = requests[0].json();
    assert_eq!(body["action"], "authenticate");
    assert_eq!(body["deviceId"], "term-07");
    assert_eq!(body["accessKey"], "ak-123");
}

#[tokio::test]
async fn rejection_takes_message_from_error_field() {
    let (server, mut client) = server_and_client().await;
    server.route(
        PATH,
        MockResponse::json(401, &json!({"error": "invalid access key"})),
    );

    let err = client.authenticate().await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::Rejected { code: 401, ref message, .. } if message == "invalid access key"
    ));
    assert_eq!(client.last_response_code(), Some(401));
    assert_eq!(client.last_error(), Some("invalid access key"));
}

#[tokio::test]
async fn rejection_without_error_field_keeps_raw_body() {
    let (server, mut client) = server_and_client().await;
    server.route(PATH, MockResponse::status(500, "upstream down"));

    assert!(client.authenticate().await.is_err());
    assert_eq!(client.last_response_code(), Some(500));
    assert_eq!(client.last_error(), Some("upstream down"));

    // A later success clears the error.
    server.route(PATH, MockResponse::json(200, &json!({})));
    client.authenticate().await.unwrap();
    assert_eq!(client.last_error(), None);
}

#[tokio::test]
async fn attendance_actions_follow_record_kind() {
    let (server, mut client) = server_and_client().await;
    server.route(PATH, MockResponse::json(200, &json!({})));

    let finger = AttendanceRecord::new(RecordKind::Fingerprint, "42", "2026-03-02T08:00:00.000Z");
    client.log_attendance(&finger).await.unwrap();
    client.log_attendance(&rfid(7)).await.unwrap();
    client.bulk_log(&[rfid(1), rfid(2)]).await.unwrap();

    let bodies: Vec<_> = server.requests().iter().map(|r| r.json()).collect();
    assert_eq!(bodies[0]["action"], "logFingerprint");
    assert_eq!(bodies[0]["fingerId"], 42);
    assert_eq!(bodies[0]["timestamp"], "2026-03-02T08:00:00.000Z");
    assert_eq!(bodies[1]["action"], "logRFID");
    assert_eq!(bodies[1]["rfid"], "TAG007");
    assert_eq!(bodies[2]["action"], "bulkLog");
    assert_eq!(bodies[2]["records"][1]["id"], "TAG002");
    assert!(bodies.iter().all(|b| b["accessKey"] == "ak-123"));
}

#[tokio::test]
async fn unreachable_backend_is_a_request_error() {
    // Bind then release a port so nothing is listening on it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}{PATH}", listener.local_addr().unwrap());
    drop(listener);
    let mut client = ApiClient::new(url, &identity(), Duration::from_millis(500));

    let err = client.authenticate().await.unwrap_err();
    assert!(matches!(err, ApiError::Request(_)), "{err:?}");
    assert_eq!(client.last_response_code(), None);
    assert!(client.last_error().is_some());
}

#[tokio::test]
async fn terminal_reports_last_response_code_after_authenticate() {
    let (server, client) = server_and_client().await;
    server.route(PATH, MockResponse::json(403, &json!({"error": "device disabled"})));
    let dir = tempfile::tempdir().unwrap();
    let queue = QueueConfig::at(dir.path().join("offline.log"));
    let mut h = build_with_api(
        MockBroker::new(),
        dir,
        queue,
        UpdateConfig::default(),
        Some(client),
    );

    assert_eq!(h.terminal.status().last_response_code, None);
    assert!(h.terminal.authenticate().await.is_err());

    let status = h.terminal.status();
    assert_eq!(status.last_response_code, Some(403));
    assert!(status.last_error.unwrap().contains("device disabled"));
}

#[tokio::test]
async fn terminal_without_api_refuses_authenticate() {
    let mut h = support::harness(MockBroker::new());
    assert!(matches!(
        h.terminal.authenticate().await,
        Err(ApiError::NotConfigured)
    ));
    assert_eq!(h.terminal.status().last_response_code, None);
}

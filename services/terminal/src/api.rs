//! Request/response channel to the attendance backend.
//!
//! Every call is a JSON `POST` to one base URL whose `action` field selects
//! the operation (`authenticate`, `logFingerprint`, `logRFID`, `bulkLog`).
//! Only `200` counts as success. On anything else the error message is the
//! response's `error` field, or the raw body when it has none.

use std::time::Duration;

use at_protocol::{AttendanceLog, AttendanceRecord, BulkAttendance, RecordKind};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::DeviceIdentity;

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_millis(10_000);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("backend API not configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
    #[error("{action} rejected with HTTP {code}: {message}")]
    Rejected {
        action: &'static str,
        code: u16,
        message: String,
    },
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    device_id: String,
    access_key: String,
    timeout: Duration,
    last_response_code: Option<u16>,
    last_error: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, identity: &DeviceIdentity, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            device_id: identity.device_id.clone(),
            access_key: identity.access_key.clone(),
            timeout,
            last_response_code: None,
            last_error: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// HTTP status of the last request that got a response.
    pub fn last_response_code(&self) -> Option<u16> {
        self.last_response_code
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Prove the device's identity to the backend.
    pub async fn authenticate(&mut self) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "deviceId": self.device_id,
            "accessKey": self.access_key,
        });
        self.request("authenticate", body).await?;
        info!(device_id = %self.device_id, "authenticated with backend");
        Ok(())
    }

    /// Send one attendance event directly.
    pub async fn log_attendance(&mut self, record: &AttendanceRecord) -> Result<(), ApiError> {
        let action = match record.kind() {
            RecordKind::Fingerprint => "logFingerprint",
            RecordKind::Rfid => "logRFID",
        };
        let body = serde_json::to_value(AttendanceLog::from_record(
            &self.device_id,
            &self.access_key,
            record,
        ))?;
        self.request(action, body).await
    }

    /// Send a batch of stored events in one request.
    pub async fn bulk_log(&mut self, records: &[AttendanceRecord]) -> Result<(), ApiError> {
        let body = serde_json::to_value(BulkAttendance::new(
            &self.device_id,
            &self.access_key,
            records.to_vec(),
        ))?;
        self.request("bulkLog", body).await
    }

    async fn request(&mut self, action: &'static str, mut body: Value) -> Result<(), ApiError> {
        if let Value::Object(fields) = &mut body {
            fields.insert("action".to_owned(), Value::from(action));
        }

        let sent = self
            .client
            .post(&self.base_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await;
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                warn!(action, error = %message, "backend request failed");
                self.last_response_code = None;
                self.last_error = Some(message.clone());
                return Err(ApiError::Request(message));
            }
        };

        let code = response.status().as_u16();
        self.last_response_code = Some(code);
        if code == 200 {
            debug!(action, "backend request accepted");
            self.last_error = None;
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = error_message(&text);
        warn!(action, code, error = %message, "backend request rejected");
        self.last_error = Some(message.clone());
        Err(ApiError::Rejected {
            action,
            code,
            message,
        })
    }
}

/// The `error` field of a JSON body, or the body itself.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| match value.get("error")? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .unwrap_or_else(|| body.to_owned())
}

//! Where firmware bytes come from.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("{0}")]
    Other(String),
}

/// An open download. Yields at most `max` bytes per call; `None` once the
/// source has no more data.
pub trait FirmwareStream: Send {
    fn content_length(&self) -> Option<u64>;

    fn next_chunk(&mut self, max: usize) -> BoxFuture<'_, Result<Option<Bytes>, SourceError>>;
}

pub trait FirmwareSource: Send + Sync {
    /// Start a download. `timeout` bounds reaching the response headers and,
    /// separately, each later read; it is not a deadline for the whole body.
    fn open<'a>(
        &'a self,
        locator: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn FirmwareStream>, SourceError>>;
}

// ---------------------------------------------------------------------------
// HTTP source
// ---------------------------------------------------------------------------

/// Fetches images over HTTP(S). Sends the terminal's identity so the backend
/// can serve per-device builds.
pub struct HttpFirmwareSource {
    client: reqwest::Client,
    device_id: String,
    user_agent: String,
}

impl HttpFirmwareSource {
    pub fn new(device_id: impl Into<String>, firmware_version: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            device_id: device_id.into(),
            user_agent: format!("attendance-terminal/{firmware_version}"),
        }
    }
}

impl FirmwareSource for HttpFirmwareSource {
    fn open<'a>(
        &'a self,
        locator: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Box<dyn FirmwareStream>, SourceError>> {
        Box::pin(async move {
            debug!(url = %locator, "opening firmware download");
            let request = self
                .client
                .get(locator)
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .header("X-Device-ID", &self.device_id)
                .send();
            let response = tokio::time::timeout(timeout, request)
                .await
                .map_err(|_elapsed| SourceError::Timeout)?
                .map_err(map_reqwest_error)?;

            let status = response.status();
            if status != reqwest::StatusCode::OK {
                return Err(SourceError::Status(status.as_u16()));
            }

            Ok(Box::new(HttpStream {
                content_length: response.content_length(),
                response,
                read_timeout: timeout,
                pending: Bytes::new(),
            }) as Box<dyn FirmwareStream>)
        })
    }
}

struct HttpStream {
    response: reqwest::Response,
    content_length: Option<u64>,
    read_timeout: Duration,
    /// Bytes received but not yet handed out.
    pending: Bytes,
}

impl FirmwareStream for HttpStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn next_chunk(&mut self, max: usize) -> BoxFuture<'_, Result<Option<Bytes>, SourceError>> {
        Box::pin(async move {
            if self.pending.is_empty() {
                let chunk = tokio::time::timeout(self.read_timeout, self.response.chunk())
                    .await
                    .map_err(|_elapsed| SourceError::Timeout)?
                    .map_err(map_reqwest_error)?;
                match chunk {
                    Some(bytes) => self.pending = bytes,
                    None => return Ok(None),
                }
            }
            let take = self.pending.len().min(max);
            Ok(Some(self.pending.split_to(take)))
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout
    } else if let Some(status) = e.status() {
        SourceError::Status(status.as_u16())
    } else if e.is_body() || e.is_connect() || e.is_request() {
        SourceError::Disconnected(e.to_string())
    } else {
        SourceError::Other(e.to_string())
    }
}

// at-updater: Streaming firmware update pipeline for the attendance terminal.
//
// Downloads an image in fixed-size chunks straight into a staging slot,
// validates size and SHA-256 digest, and promotes the slot to the boot image
// with a single atomic rename. A failure at any stage leaves the current boot
// image untouched.

pub mod pipeline;
pub mod slot;
pub mod source;

pub use pipeline::{UpdateEvent, UpdateJob};
pub use slot::{FileSlot, FirmwareSlot, SlotError};
pub use source::{FirmwareSource, FirmwareStream, HttpFirmwareSource, SourceError};

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Status reported to the backend on `ota/status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    Downloading,
    Validating,
    Applying,
    Completed,
    Failed { error: String },
}

impl UpdateStatus {
    /// The wire value of the `status` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Validating => "validating",
            UpdateStatus::Applying => "applying",
            UpdateStatus::Completed => "completed",
            UpdateStatus::Failed { .. } => "failed",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            UpdateStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Downloading,
    Validating,
    Applying,
    Complete,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatePhase::Complete | UpdatePhase::Failed)
    }
}

/// What to install. Built from an "update available" control message and
/// consumed by exactly one [`UpdateJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlan {
    pub target_version: String,
    pub locator: String,
    pub expected_checksum: Option<String>,
    /// Size announced by the backend, checked before any network I/O.
    pub declared_size: Option<u64>,
}

/// Device-side bounds and tuning for every update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLimits {
    pub min_size: u64,
    pub max_size: u64,
    pub chunk_size: usize,
    pub request_timeout: Duration,
}

impl Default for UpdateLimits {
    fn default() -> Self {
        Self {
            min_size: 100_000,
            max_size: 2_000_000,
            chunk_size: 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl UpdateLimits {
    pub fn accepts(&self, size: u64) -> bool {
        (self.min_size..=self.max_size).contains(&size)
    }
}

/// A point-in-time view of a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateProgress {
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub phase: UpdatePhase,
    pub percent: u8,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("firmware size {size} outside accepted range {min}..={max}")]
    SizeOutOfRange { size: u64, min: u64, max: u64 },
    #[error("server did not report a content length")]
    MissingContentLength,
    #[error("declared size {declared} does not match content length {reported}")]
    SizeMismatch { declared: u64, reported: u64 },
    #[error("stream ended after {received} of {expected} bytes")]
    ShortRead { received: u64, expected: u64 },
    #[error("slot accepted {wrote} of {expected} bytes")]
    WriteMismatch { expected: usize, wrote: usize },
    #[error("download failed: {0}")]
    Transport(#[from] SourceError),
    #[error("checksum must be 64 hex characters, got {len} characters")]
    InvalidChecksumFormat { len: usize },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("staging slot error: {0}")]
    Slot(#[from] SlotError),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Length of a hex-encoded SHA-256 digest.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Accepts exactly 64 ASCII hex digits, either case.
pub fn validate_checksum_format(checksum: &str) -> Result<(), UpdateError> {
    if checksum.len() == CHECKSUM_HEX_LEN && checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(UpdateError::InvalidChecksumFormat {
            len: checksum.chars().count(),
        })
    }
}

/// Download progress mapped onto 5..=95.
pub fn download_percent(bytes_written: u64, total_bytes: u64) -> u8 {
    if total_bytes == 0 {
        return 5;
    }
    let scaled = bytes_written.min(total_bytes) * 90 / total_bytes;
    // scaled <= 90
    u8::try_from(scaled).unwrap_or(90) + 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_format_requires_64_hex_chars() {
        let good = "a".repeat(64);
        assert!(validate_checksum_format(&good).is_ok());
        assert!(validate_checksum_format(&"A0".repeat(32)).is_ok());

        let short = "a".repeat(63);
        assert!(matches!(
            validate_checksum_format(&short),
            Err(UpdateError::InvalidChecksumFormat { len: 63 })
        ));

        let non_hex = format!("{}g", "a".repeat(63));
        assert!(validate_checksum_format(&non_hex).is_err());
    }

    #[test]
    fn download_percent_spans_five_to_ninety_five() {
        assert_eq!(download_percent(0, 1000), 5);
        assert_eq!(download_percent(500, 1000), 50);
        assert_eq!(download_percent(1000, 1000), 95);
        assert_eq!(download_percent(2000, 1000), 95);
    }

    #[test]
    fn limits_bound_inclusively() {
        let limits = UpdateLimits::default();
        assert!(limits.accepts(100_000));
        assert!(limits.accepts(2_000_000));
        assert!(!limits.accepts(50_000));
        assert!(!limits.accepts(2_000_001));
    }

    #[test]
    fn status_serializes_with_status_tag() {
        let json = serde_json::to_value(UpdateStatus::Failed {
            error: "boom".to_owned(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(UpdateStatus::Completed.as_str(), "completed");
    }
}

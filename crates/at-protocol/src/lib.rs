// at-protocol: Wire vocabulary shared by the attendance terminal components.
//
// Every message on the broker is a JSON object. Outbound payloads carry the
// canonical `deviceId` and `timestamp` fields; attendance payloads also carry
// `accessKey`. Inbound control messages are classified by topic (see
// `topics`) and decoded by `control`. The `broker` module defines the
// transport seam the terminal drives.

pub mod broker;
pub mod control;
pub mod topics;

pub use broker::{Broker, BrokerEndpoint, InboundMessage, TransportError};
pub use control::{
    Broadcast, ControlMessage, EnrollmentRequest, ModeSwitch, ProtocolError, UpdateAvailable,
    WifiCredentials,
};
pub use topics::{InboundKind, Topics};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Format a UTC instant the way the backend expects it: ISO-8601 with the
/// millisecond field forced to zero, e.g. `2026-03-01T08:15:42.000Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S.000Z").to_string()
}

/// The current wall-clock time in wire format.
pub fn timestamp_now() -> String {
    format_timestamp(Utc::now())
}

// ---------------------------------------------------------------------------
// Attendance records
// ---------------------------------------------------------------------------

/// How an attendance event was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Fingerprint,
    Rfid,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Fingerprint => "fingerprint",
            RecordKind::Rfid => "rfid",
        }
    }
}

/// One attendance event. Immutable once created.
///
/// Serialized as `{"type": "...", "id": "...", "timestamp": "..."}`, which is
/// both the offline log line format and the element format of bulk batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(rename = "type")]
    kind: RecordKind,
    #[serde(rename = "id")]
    identifier: String,
    timestamp: String,
}

impl AttendanceRecord {
    pub fn new(
        kind: RecordKind,
        identifier: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            timestamp: timestamp.into(),
        }
    }

    /// A fingerprint match stamped with the current time.
    pub fn fingerprint(finger_id: u32) -> Self {
        Self::new(RecordKind::Fingerprint, finger_id.to_string(), timestamp_now())
    }

    /// An RFID read stamped with the current time.
    pub fn rfid(tag: impl Into<String>) -> Self {
        Self::new(RecordKind::Rfid, tag, timestamp_now())
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads: attendance
// ---------------------------------------------------------------------------

/// A single attendance event sent while connected.
///
/// Fingerprint events carry `fingerId` (numeric when the identifier is a
/// number), RFID events carry `rfid`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceLog {
    pub device_id: String,
    pub access_key: String,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finger_id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rfid: Option<String>,
}

impl AttendanceLog {
    pub fn from_record(device_id: &str, access_key: &str, record: &AttendanceRecord) -> Self {
        let (finger_id, rfid) = match record.kind() {
            RecordKind::Fingerprint => {
                let value = record
                    .identifier()
                    .parse::<u64>()
                    .map(serde_json::Value::from)
                    .unwrap_or_else(|_| serde_json::Value::from(record.identifier()));
                (Some(value), None)
            }
            RecordKind::Rfid => (None, Some(record.identifier().to_owned())),
        };
        Self {
            device_id: device_id.to_owned(),
            access_key: access_key.to_owned(),
            timestamp: record.timestamp().to_owned(),
            kind: record.kind(),
            finger_id,
            rfid,
        }
    }
}

/// An aggregated batch of offline records, published as one message during a
/// drain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkAttendance {
    pub device_id: String,
    pub access_key: String,
    pub timestamp: String,
    pub count: usize,
    pub records: Vec<AttendanceRecord>,
}

impl BulkAttendance {
    pub fn new(device_id: &str, access_key: &str, records: Vec<AttendanceRecord>) -> Self {
        Self {
            device_id: device_id.to_owned(),
            access_key: access_key.to_owned(),
            timestamp: timestamp_now(),
            count: records.len(),
            records,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound payloads: device status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    /// `"online"` or `"offline"`.
    pub status: String,
    pub timestamp: String,
    pub firmware_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub device_id: String,
    pub timestamp: String,
    /// Seconds since boot.
    pub uptime: u64,
    pub free_heap: u64,
    #[serde(rename = "wifiRSSI")]
    pub wifi_rssi: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBody {
    pub uptime: u64,
    pub free_heap: u64,
    #[serde(rename = "wifiRSSI")]
    pub wifi_rssi: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub firmware_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub device_id: String,
    pub timestamp: String,
    pub metrics: MetricsBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceError {
    pub device_id: String,
    pub error: String,
    pub timestamp: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetNotice {
    pub device_id: String,
    pub action: String,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Outbound payloads: enrollment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentStatus {
    pub device_id: String,
    pub employee_id: String,
    pub status: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentMode {
    pub device_id: String,
    pub enrollment_mode: bool,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Outbound payloads: firmware update
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaProgress {
    pub device_id: String,
    /// Percent, 0..=100.
    pub progress: u8,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaStatus {
    pub device_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
    pub firmware_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub ota: bool,
    pub max_firmware_size: u64,
    pub checksum_validation: bool,
    pub progress_reporting: bool,
    pub rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaCapabilities {
    pub device_id: String,
    pub capabilities: Capabilities,
    pub current_version: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaCheck {
    pub device_id: String,
    pub current_version: String,
    pub request_update: bool,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Outbound payloads: Wi-Fi configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    pub rssi: i32,
    /// `"Open"` or `"Secured"`.
    pub encryption: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiScanResults {
    pub device_id: String,
    pub networks: Vec<WifiNetwork>,
    pub timestamp: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiStatus {
    pub device_id: String,
    pub connected: bool,
    pub ssid: String,
    pub ip_address: String,
    pub timestamp: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

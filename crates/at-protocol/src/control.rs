//! Inbound control messages.
//!
//! A message is accepted only if its topic classifies (see
//! [`Topics::classify`]) and its payload decodes into the typed body of that
//! category. Everything else is a [`ProtocolError`]; callers drop and log it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topics::{InboundKind, Topics};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognized topic: {0}")]
    UnknownTopic(String),
    #[error("malformed JSON on {topic}: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequest {
    pub employee_id: String,
    #[serde(default)]
    pub employee_name: String,
    pub fingerprint_slot: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeSwitch {
    pub enrollment_mode: bool,
}

/// Body of `ota/available` and `ota/download`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAvailable {
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub checksum: Option<String>,
    /// Declared image size in bytes, when the backend knows it.
    #[serde(default)]
    pub size: Option<u64>,
}

impl UpdateAvailable {
    /// The checksum, treating an empty string as absent.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref().filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Broadcast {
    /// `data.enabled` for maintenance broadcasts; `false` when absent.
    pub fn enabled_flag(&self) -> bool {
        self.data
            .get("enabled")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// A classified, decoded inbound control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    EnrollmentRequest(EnrollmentRequest),
    EnrollmentModeSwitch(ModeSwitch),
    UpdateAvailable(UpdateAvailable),
    WifiConfig(WifiCredentials),
    WifiScan,
    Command {
        name: String,
        payload: serde_json::Value,
    },
    Broadcast {
        kind: String,
        body: Broadcast,
    },
}

impl ControlMessage {
    /// Classify `topic` against `topics` and decode `payload`.
    ///
    /// An empty payload decodes as JSON `null`, which is accepted only by the
    /// categories that carry no body (Wi-Fi scan and commands).
    pub fn parse(topics: &Topics, topic: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let kind = topics
            .classify(topic)
            .ok_or_else(|| ProtocolError::UnknownTopic(topic.to_owned()))?;

        let value: serde_json::Value = if payload.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(payload).map_err(|source| ProtocolError::Malformed {
                topic: topic.to_owned(),
                source,
            })?
        };

        let msg = match kind {
            InboundKind::EnrollmentRequest => {
                ControlMessage::EnrollmentRequest(decode(topic, value)?)
            }
            InboundKind::EnrollmentModeSwitch => {
                ControlMessage::EnrollmentModeSwitch(decode(topic, value)?)
            }
            InboundKind::UpdateAvailable => {
                let body: UpdateAvailable = decode(topic, value)?;
                if body.download_url.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload {
                        topic: topic.to_owned(),
                        reason: "downloadUrl is empty".to_owned(),
                    });
                }
                ControlMessage::UpdateAvailable(body)
            }
            InboundKind::WifiConfigResponse => ControlMessage::WifiConfig(decode(topic, value)?),
            InboundKind::WifiScan => ControlMessage::WifiScan,
            InboundKind::Command(name) => ControlMessage::Command {
                name,
                payload: value,
            },
            InboundKind::Broadcast(kind) => {
                let body = if value.is_null() {
                    Broadcast {
                        message: String::new(),
                        data: serde_json::Value::Null,
                    }
                } else {
                    decode(topic, value)?
                };
                ControlMessage::Broadcast { kind, body }
            }
        };
        Ok(msg)
    }

    /// Short category name for logs.
    pub fn category(&self) -> &'static str {
        match self {
            ControlMessage::EnrollmentRequest(_) => "enrollment_request",
            ControlMessage::EnrollmentModeSwitch(_) => "enrollment_mode",
            ControlMessage::UpdateAvailable(_) => "update_available",
            ControlMessage::WifiConfig(_) => "wifi_config",
            ControlMessage::WifiScan => "wifi_scan",
            ControlMessage::Command { .. } => "command",
            ControlMessage::Broadcast { .. } => "broadcast",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    topic: &str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        topic: topic.to_owned(),
        reason: e.to_string(),
    })
}

//! Topic layout.
//!
//! Device topics live under `{namespace}/devices/{device_id}` and follow
//! `{prefix}/{category}/{subcategory}`. Broadcasts shared by every terminal
//! live under `{namespace}/system/broadcast/{type}`.

/// Inbound topic categories the router knows how to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    EnrollmentRequest,
    EnrollmentModeSwitch,
    UpdateAvailable,
    WifiConfigResponse,
    WifiScan,
    /// `commands/{name}`
    Command(String),
    /// `system/broadcast/{type}`
    Broadcast(String),
}

/// Topic builder for a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    broadcast_prefix: String,
}

impl Topics {
    pub fn new(namespace: &str, device_id: &str) -> Self {
        Self {
            prefix: format!("{namespace}/devices/{device_id}"),
            broadcast_prefix: format!("{namespace}/system/broadcast"),
        }
    }

    /// `{namespace}/devices/{device_id}`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `{prefix}/{category}/{subcategory}`
    pub fn device(&self, category: &str, subcategory: &str) -> String {
        format!("{}/{}/{}", self.prefix, category, subcategory)
    }

    pub fn broadcast(&self, kind: &str) -> String {
        format!("{}/{}", self.broadcast_prefix, kind)
    }

    /// The canonical subscription set, re-established on every connect.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.device("enrollment", "request"),
            self.device("enrollment", "mode/switch"),
            self.device("ota", "available"),
            self.device("ota", "download"),
            self.device("config", "wifi/response"),
            self.device("config", "wifi/scan"),
            self.device("commands", "+"),
            self.broadcast("+"),
        ]
    }

    pub fn attendance(&self, kind: crate::RecordKind) -> String {
        self.device("attendance", kind.as_str())
    }

    pub fn attendance_bulk(&self) -> String {
        self.device("attendance", "bulk")
    }

    pub fn status(&self, subcategory: &str) -> String {
        self.device("status", subcategory)
    }

    pub fn enrollment(&self, subcategory: &str) -> String {
        self.device("enrollment", subcategory)
    }

    pub fn ota(&self, subcategory: &str) -> String {
        self.device("ota", subcategory)
    }

    pub fn wifi(&self, subcategory: &str) -> String {
        self.device("config", &format!("wifi/{subcategory}"))
    }

    /// Classify an inbound topic. Returns `None` for topics outside this
    /// device's namespace or with an unrecognized suffix.
    pub fn classify(&self, topic: &str) -> Option<InboundKind> {
        if let Some(kind) = topic
            .strip_prefix(self.broadcast_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            return single_segment(kind).map(|k| InboundKind::Broadcast(k.to_owned()));
        }

        let rest = topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))?;

        match rest {
            "enrollment/request" => Some(InboundKind::EnrollmentRequest),
            "enrollment/mode/switch" => Some(InboundKind::EnrollmentModeSwitch),
            "ota/available" | "ota/download" => Some(InboundKind::UpdateAvailable),
            "config/wifi/response" => Some(InboundKind::WifiConfigResponse),
            "config/wifi/scan" => Some(InboundKind::WifiScan),
            _ => rest
                .strip_prefix("commands/")
                .and_then(single_segment)
                .map(|name| InboundKind::Command(name.to_owned())),
        }
    }
}

fn single_segment(s: &str) -> Option<&str> {
    if s.is_empty() || s.contains('/') {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordKind;

    fn topics() -> Topics {
        Topics::new("fitinfinity", "term-07")
    }

    #[test]
    fn builds_device_and_broadcast_topics() {
        let t = topics();
        assert_eq!(t.prefix(), "fitinfinity/devices/term-07");
        assert_eq!(
            t.status("heartbeat"),
            "fitinfinity/devices/term-07/status/heartbeat"
        );
        assert_eq!(
            t.attendance(RecordKind::Fingerprint),
            "fitinfinity/devices/term-07/attendance/fingerprint"
        );
        assert_eq!(
            t.wifi("status"),
            "fitinfinity/devices/term-07/config/wifi/status"
        );
        assert_eq!(
            t.broadcast("maintenance"),
            "fitinfinity/system/broadcast/maintenance"
        );
    }

    #[test]
    fn subscriptions_cover_every_inbound_category() {
        let subs = topics().subscriptions();
        assert_eq!(subs.len(), 8);
        assert!(subs.contains(&"fitinfinity/devices/term-07/commands/+".to_owned()));
        assert!(subs.contains(&"fitinfinity/system/broadcast/+".to_owned()));
    }

    #[test]
    fn classifies_known_suffixes() {
        let t = topics();
        assert_eq!(
            t.classify("fitinfinity/devices/term-07/enrollment/request"),
            Some(InboundKind::EnrollmentRequest)
        );
        assert_eq!(
            t.classify("fitinfinity/devices/term-07/enrollment/mode/switch"),
            Some(InboundKind::EnrollmentModeSwitch)
        );
        assert_eq!(
            t.classify("fitinfinity/devices/term-07/ota/download"),
            Some(InboundKind::UpdateAvailable)
        );
        assert_eq!(
            t.classify("fitinfinity/devices/term-07/commands/restart"),
            Some(InboundKind::Command("restart".to_owned()))
        );
        assert_eq!(
            t.classify("fitinfinity/system/broadcast/maintenance"),
            Some(InboundKind::Broadcast("maintenance".to_owned()))
        );
    }

    #[test]
    fn rejects_foreign_and_unknown_topics() {
        let t = topics();
        assert_eq!(t.classify("fitinfinity/devices/other/enrollment/request"), None);
        assert_eq!(t.classify("fitinfinity/devices/term-07/ota/progress"), None);
        assert_eq!(t.classify("fitinfinity/devices/term-07/commands/a/b"), None);
        assert_eq!(t.classify("fitinfinity/system/broadcast/"), None);
    }
}

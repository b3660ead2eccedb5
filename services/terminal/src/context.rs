//! The explicitly owned device state shared by every component.

use std::time::Duration;

use at_protocol::{
    DeviceMetrics, DeviceStatus, Heartbeat, MetricsBody, Topics, timestamp_now,
};
use tokio::time::Instant;

use crate::hooks::DeviceProbe;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub access_key: String,
    pub namespace: String,
}

pub struct DeviceContext {
    identity: DeviceIdentity,
    topics: Topics,
    pub firmware_version: String,
    pub started_at: Instant,
    pub ntp_server: String,
    /// Budget for per-request network operations such as firmware fetches.
    pub request_timeout: Duration,
    pub enrollment_mode: bool,
    pub maintenance_mode: bool,
    probe: Box<dyn DeviceProbe>,
}

impl DeviceContext {
    pub fn new(
        identity: DeviceIdentity,
        firmware_version: impl Into<String>,
        probe: Box<dyn DeviceProbe>,
    ) -> Self {
        let topics = Topics::new(&identity.namespace, &identity.device_id);
        Self {
            identity,
            topics,
            firmware_version: firmware_version.into(),
            started_at: Instant::now(),
            ntp_server: "pool.ntp.org".to_owned(),
            request_timeout: Duration::from_secs(30),
            enrollment_mode: false,
            maintenance_mode: false,
            probe,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn access_key(&self) -> &str {
        &self.identity.access_key
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn probe(&self) -> &dyn DeviceProbe {
        self.probe.as_ref()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    // -----------------------------------------------------------------------
    // Status payloads
    // -----------------------------------------------------------------------

    pub fn status(&self, status: &str) -> DeviceStatus {
        DeviceStatus {
            device_id: self.identity.device_id.clone(),
            status: status.to_owned(),
            timestamp: timestamp_now(),
            firmware_version: self.firmware_version.clone(),
            ip_address: self.probe.ip_address(),
        }
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            device_id: self.identity.device_id.clone(),
            timestamp: timestamp_now(),
            uptime: self.uptime_secs(),
            free_heap: self.probe.free_heap(),
            wifi_rssi: self.probe.signal_strength(),
        }
    }

    pub fn metrics(&self) -> DeviceMetrics {
        DeviceMetrics {
            device_id: self.identity.device_id.clone(),
            timestamp: timestamp_now(),
            metrics: MetricsBody {
                uptime: self.uptime_secs(),
                free_heap: self.probe.free_heap(),
                wifi_rssi: self.probe.signal_strength(),
                temperature: self.probe.temperature(),
                firmware_version: self.firmware_version.clone(),
                ip_address: self.probe.ip_address(),
            },
        }
    }
}

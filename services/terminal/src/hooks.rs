//! Host-facing hooks.
//!
//! The host application plugs in here: one handler trait per inbound
//! category, a probe for heartbeat metrics, and an ordered list of
//! observers for device-level events.

use std::time::Duration;

use at_protocol::{EnrollmentRequest, UpdateAvailable, WifiCredentials, WifiNetwork};
use at_updater::UpdateProgress;

// ---------------------------------------------------------------------------
// Inbound handlers
// ---------------------------------------------------------------------------

pub trait EnrollmentHandler: Send {
    fn on_enrollment_request(&mut self, request: &EnrollmentRequest);
}

pub trait ModeHandler: Send {
    /// Called after the context flag has been updated.
    fn on_mode_switch(&mut self, enrollment_mode: bool);
}

pub trait ConfigHandler: Send {
    /// Replaces the default save-and-restart handling.
    fn on_wifi_config(&mut self, credentials: &WifiCredentials);

    fn scan_networks(&mut self) -> Vec<WifiNetwork>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    Apply,
    Defer,
}

pub trait FirmwareHandler: Send {
    fn on_update_available(&mut self, offer: &UpdateAvailable) -> UpdateDecision;
}

pub trait CommandHandler: Send {
    /// Commands the terminal does not handle itself.
    fn on_command(&mut self, name: &str, payload: &serde_json::Value);
}

// ---------------------------------------------------------------------------
// Device probe
// ---------------------------------------------------------------------------

/// Source of the health figures reported in heartbeats and metrics.
pub trait DeviceProbe: Send {
    /// Free memory estimate in bytes.
    fn free_heap(&self) -> u64;

    /// Signal strength in dBm.
    fn signal_strength(&self) -> i32;

    fn temperature(&self) -> Option<f32> {
        None
    }

    fn ip_address(&self) -> Option<String> {
        None
    }
}

/// Reads what a Linux host can tell us. Signal strength is not available
/// from the kernel in a portable way and reports 0.
#[derive(Debug, Default)]
pub struct HostProbe;

impl DeviceProbe for HostProbe {
    fn free_heap(&self) -> u64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_mem_available(&text))
            .unwrap_or(0)
    }

    fn signal_strength(&self) -> i32 {
        0
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Why the terminal wants to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    UpdateApplied,
    WifiReconfigured,
    FactoryReset,
    Requested,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestartReason::UpdateApplied => "update applied",
            RestartReason::WifiReconfigured => "wifi reconfigured",
            RestartReason::FactoryReset => "factory reset",
            RestartReason::Requested => "requested",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ConnectivityChanged { connected: bool, attempt_count: u32 },
    StorageDegraded { reason: String },
    UpdateProgress(UpdateProgress),
    UpdateFailed { version: String, reason: String },
    MaintenanceMode { enabled: bool, message: String },
    RestartScheduled { reason: RestartReason, after: Duration },
}

pub trait DeviceObserver: Send {
    fn on_event(&mut self, event: &DeviceEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_available() {
        let text = "MemTotal:       16316412 kB\nMemFree:  100 kB\nMemAvailable:   2048 kB\n";
        assert_eq!(parse_mem_available(text), Some(2048 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }
}

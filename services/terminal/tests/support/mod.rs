// Shared fixtures for the terminal integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use at_protocol::{AttendanceRecord, BrokerEndpoint, RecordKind};
use at_test_utils::{MemorySlot, MemorySource, MockBroker};
use tempfile::TempDir;
use terminal::api::ApiClient;
use terminal::config::{QueueConfig, SessionConfig, UpdateConfig};
use terminal::hooks::{DeviceEvent, DeviceObserver, DeviceProbe};
use terminal::storage::credentials::SqliteCredentialStore;
use terminal::storage::offline_queue::OfflineQueue;
use terminal::{DeviceContext, DeviceIdentity, Terminal, TerminalParts, TransportSession};

pub const DEVICE_PREFIX: &str = "fitinfinity/devices/term-07";
pub const BOOT_IMAGE: &[u8] = b"firmware 1.0.0";

pub struct FixedProbe;

impl DeviceProbe for FixedProbe {
    fn free_heap(&self) -> u64 {
        96_000
    }

    fn signal_strength(&self) -> i32 {
        -58
    }
}

/// Observer that keeps every event for later assertions.
#[derive(Clone, Default)]
pub struct Recording(Arc<Mutex<Vec<DeviceEvent>>>);

impl Recording {
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.0.lock().unwrap().clone()
    }
}

impl DeviceObserver for Recording {
    fn on_event(&mut self, event: &DeviceEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

pub struct Harness {
    pub terminal: Terminal<MockBroker>,
    pub broker: MockBroker,
    pub source: MemorySource,
    pub slot: MemorySlot,
    pub observer: Recording,
    pub credentials_path: PathBuf,
    pub dir: TempDir,
}

pub fn endpoint() -> BrokerEndpoint {
    BrokerEndpoint {
        host: "broker.test".to_owned(),
        port: 1883,
        client_id: "fitinfinity-term-07-abcd".to_owned(),
        username: None,
        password: None,
        keep_alive: Duration::from_secs(60),
    }
}

pub fn rfid(n: usize) -> AttendanceRecord {
    AttendanceRecord::new(
        RecordKind::Rfid,
        format!("TAG{n:03}"),
        format!("2026-03-02T08:{:02}:00.000Z", n % 60),
    )
}

pub fn harness(broker: MockBroker) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let queue = QueueConfig::at(dir.path().join("offline.log"));
    build(broker, dir, queue, UpdateConfig::default())
}

pub fn build(broker: MockBroker, dir: TempDir, queue: QueueConfig, update: UpdateConfig) -> Harness {
    build_with_api(broker, dir, queue, update, None)
}

pub fn identity() -> DeviceIdentity {
    DeviceIdentity {
        device_id: "term-07".to_owned(),
        access_key: "ak-123".to_owned(),
        namespace: "fitinfinity".to_owned(),
    }
}

pub fn build_with_api(
    broker: MockBroker,
    dir: TempDir,
    queue: QueueConfig,
    update: UpdateConfig,
    api: Option<ApiClient>,
) -> Harness {
    let credentials_path = dir.path().join("credentials.sqlite3");
    let credentials = SqliteCredentialStore::open(&credentials_path).unwrap();
    let source = MemorySource::new();
    let slot = MemorySlot::with_boot_image(BOOT_IMAGE.to_vec());
    let context = DeviceContext::new(identity(), "1.0.0", Box::new(FixedProbe));

    let mut terminal = Terminal::new(TerminalParts {
        context,
        session: TransportSession::new(broker.clone(), SessionConfig::default()),
        batch_max: queue.batch_max,
        queue: OfflineQueue::open(&queue),
        credentials: Box::new(credentials),
        source: Box::new(source.clone()),
        slot: Box::new(slot.clone()),
        update,
        api,
    });
    let observer = Recording::default();
    terminal.add_observer(Box::new(observer.clone()));

    Harness {
        terminal,
        broker,
        source,
        slot,
        observer,
        credentials_path,
        dir,
    }
}

/// Identifiers carried by a published bulk batch, in order.
pub fn batch_ids(payload: &serde_json::Value) -> Vec<String> {
    payload["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_owned())
        .collect()
}

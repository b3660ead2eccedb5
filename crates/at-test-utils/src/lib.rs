// at-test-utils: Shared test doubles for the attendance terminal.
//
// Provides an in-process broker and in-memory firmware source/slot with
// fault injection, plus loopback HTTP and MQTT servers for exercising the
// real network adapters.

pub mod memory_firmware;
pub mod mock_broker;
pub mod mock_http_server;
pub mod mock_mqtt_server;

pub use memory_firmware::{MemorySlot, MemorySource};
pub use mock_broker::{MockBroker, Published};
pub use mock_http_server::{MockHttpServer, MockResponse, RecordedRequest};
pub use mock_mqtt_server::{MockMqttServer, ReceivedPublish};

/// Deterministic pseudo-random image of `len` bytes.
pub fn firmware_image(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i * 31 + 7) % 251).unwrap_or(0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use at_protocol::{Broker, BrokerEndpoint};
    use at_updater::{FirmwareSlot, FirmwareSource};
    use std::time::Duration;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint {
            host: "localhost".to_owned(),
            port: 1883,
            client_id: "test".to_owned(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn mock_broker_records_publishes_while_connected() {
        let handle = MockBroker::new();
        let mut broker = handle.clone();

        assert!(broker.publish("a/b", b"{}".to_vec()).await.is_err());
        broker.connect(&endpoint()).await.unwrap();
        broker.subscribe("a/+").await.unwrap();
        broker.publish("a/b", br#"{"x":1}"#.to_vec()).await.unwrap();

        assert_eq!(handle.subscriptions(), vec!["a/+".to_owned()]);
        let published = handle.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json()["x"], 1);
    }

    #[tokio::test]
    async fn mock_broker_injected_publish_failure_drops_link() {
        let handle = MockBroker::new();
        let mut broker = handle.clone();
        broker.connect(&endpoint()).await.unwrap();
        handle.fail_next_publishes(1);

        assert!(broker.publish("a/b", vec![]).await.is_err());
        assert!(!handle.is_connected());
        assert!(handle.published().is_empty());
    }

    #[tokio::test]
    async fn mock_broker_delivers_inbound_then_drops() {
        let handle = MockBroker::new();
        let mut broker = handle.clone();
        broker.connect(&endpoint()).await.unwrap();
        handle.push_inbound("x/y", b"1");

        let msgs = broker.pump(Duration::from_millis(10)).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "x/y");

        handle.drop_connection();
        assert!(broker.pump(Duration::from_millis(10)).await.is_err());
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn memory_source_interrupts_after_budget() {
        let source = MemorySource::new();
        source.serve_interrupted("mem://fw", firmware_image(100), 40);

        let mut stream = source
            .open("mem://fw", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stream.content_length(), Some(100));
        assert_eq!(stream.next_chunk(64).await.unwrap().unwrap().len(), 40);
        assert!(stream.next_chunk(64).await.is_err());
    }

    #[test]
    fn memory_slot_keeps_boot_image_until_finalize() {
        let handle = MemorySlot::with_boot_image(b"old".to_vec());
        let mut slot = handle.clone();
        slot.begin(3).unwrap();
        slot.write(b"new").unwrap();
        assert_eq!(handle.boot_image(), b"old");
        slot.finalize().unwrap();
        assert_eq!(handle.boot_image(), b"new");
    }
}

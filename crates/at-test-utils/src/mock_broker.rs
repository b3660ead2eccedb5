// mock_broker: An in-process broker for driving the terminal in tests.
//
// Cloning a `MockBroker` yields another handle onto the same state, so a test
// can hand one clone to the terminal and keep another to inject faults and
// inspect traffic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use at_protocol::{Broker, BrokerEndpoint, InboundMessage, TransportError};
use futures_util::future::BoxFuture;
use tokio::time::Instant;

/// A message the terminal published and the mock acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug)]
struct State {
    reachable: bool,
    connected: bool,
    failing_connects: u32,
    failing_publishes: u32,
    stall_publishes: bool,
    stall_disconnects: bool,
    drop_on_next_pump: bool,
    connect_attempts: Vec<Instant>,
    endpoints: Vec<BrokerEndpoint>,
    subscriptions: Vec<String>,
    published: Vec<Published>,
    inbound: VecDeque<InboundMessage>,
    disconnects: u32,
}

#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// A reachable broker that accepts every connection.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                reachable: true,
                connected: false,
                failing_connects: 0,
                failing_publishes: 0,
                stall_publishes: false,
                stall_disconnects: false,
                drop_on_next_pump: false,
                connect_attempts: Vec::new(),
                endpoints: Vec::new(),
                subscriptions: Vec::new(),
                published: Vec::new(),
                inbound: VecDeque::new(),
                disconnects: 0,
            })),
        }
    }

    /// A broker that refuses connections until `set_reachable(true)`.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.set_reachable(false);
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -- fault injection --

    pub fn set_reachable(&self, reachable: bool) {
        let mut s = self.lock();
        s.reachable = reachable;
        if !reachable {
            s.connected = false;
        }
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// The next `n` publishes fail and take the connection down with them.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().failing_publishes = n;
    }

    /// Publishes never resolve until cleared.
    pub fn stall_publishes(&self, stall: bool) {
        self.lock().stall_publishes = stall;
    }

    /// Disconnects never resolve until cleared. The link is still marked
    /// down when one starts.
    pub fn stall_disconnects(&self, stall: bool) {
        self.lock().stall_disconnects = stall;
    }

    /// The next pump reports the link as lost.
    pub fn drop_connection(&self) {
        self.lock().drop_on_next_pump = true;
    }

    /// Queue a message for delivery on the next pump.
    pub fn push_inbound(&self, topic: &str, payload: &[u8]) {
        self.lock()
            .inbound
            .push_back(InboundMessage::new(topic, payload));
    }

    // -- inspection --

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn last_endpoint(&self) -> Option<BrokerEndpoint> {
        self.lock().endpoints.last().cloned()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// Published messages whose topic ends with `suffix`.
    pub fn published_to(&self, suffix: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.topic.ends_with(suffix))
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.lock().published.clear();
    }

    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }
}

impl Broker for MockBroker {
    fn connect<'a>(
        &'a mut self,
        endpoint: &'a BrokerEndpoint,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut s = self.lock();
            s.connect_attempts.push(Instant::now());
            s.endpoints.push(endpoint.clone());
            s.connected = false;
            s.subscriptions.clear();
            if !s.reachable {
                return Err(TransportError::Connect("broker unreachable".to_owned()));
            }
            if s.failing_connects > 0 {
                s.failing_connects -= 1;
                return Err(TransportError::Connect("injected connect failure".to_owned()));
            }
            s.connected = true;
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a mut self,
        filter: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut s = self.lock();
            if !s.connected {
                return Err(TransportError::Disconnected);
            }
            s.subscriptions.push(filter.to_owned());
            Ok(())
        })
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let stall = {
                let mut s = self.lock();
                if !s.connected {
                    return Err(TransportError::Disconnected);
                }
                if s.failing_publishes > 0 {
                    s.failing_publishes -= 1;
                    s.connected = false;
                    return Err(TransportError::Io("injected publish failure".to_owned()));
                }
                if !s.stall_publishes {
                    s.published.push(Published {
                        topic: topic.to_owned(),
                        payload,
                    });
                }
                s.stall_publishes
            };
            if stall {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }

    fn pump(
        &mut self,
        _budget: Duration,
    ) -> BoxFuture<'_, Result<Vec<InboundMessage>, TransportError>> {
        Box::pin(async move {
            let mut s = self.lock();
            if !s.connected {
                return Err(TransportError::Disconnected);
            }
            if s.drop_on_next_pump || !s.reachable {
                s.drop_on_next_pump = false;
                s.connected = false;
                return Err(TransportError::Io("connection reset".to_owned()));
            }
            Ok(s.inbound.drain(..).collect())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let stall = {
                let mut s = self.lock();
                s.connected = false;
                s.disconnects += 1;
                s.stall_disconnects
            };
            if stall {
                std::future::pending::<()>().await;
            }
        })
    }
}

//! The seam between the terminal and its message broker.
//!
//! The terminal drives one [`Broker`] from a single task. `publish` resolves
//! only once the broker has acknowledged the message, so a successful return
//! is the delivery guarantee the offline queue relies on before compacting.

use std::time::Duration;

use futures_util::future::BoxFuture;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection refused by broker: {0}")]
    Rejected(String),
    #[error("not connected")]
    Disconnected,
    #[error("transport error: {0}")]
    Io(String),
}

pub trait Broker: Send {
    /// Open a fresh connection. Any previous connection is discarded first.
    fn connect<'a>(
        &'a mut self,
        endpoint: &'a BrokerEndpoint,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn subscribe<'a>(
        &'a mut self,
        filter: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Publish with at-least-once delivery; resolves on acknowledgement.
    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Service the connection for up to `budget` and return any inbound
    /// messages received meanwhile. An error means the link is gone.
    fn pump(
        &mut self,
        budget: Duration,
    ) -> BoxFuture<'_, Result<Vec<InboundMessage>, TransportError>>;

    fn disconnect(&mut self) -> BoxFuture<'_, ()>;
}

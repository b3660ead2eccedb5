//! MQTT adapter for the [`Broker`] seam, built on `rumqttc`.
//!
//! Every operation drives the event loop inline, so the caller's single task
//! stays in control. Publishes use QoS 1 and resolve on the matching PUBACK;
//! inbound publishes seen while waiting are buffered for the next pump.

use std::collections::VecDeque;
use std::time::Duration;

use at_protocol::{Broker, BrokerEndpoint, InboundMessage, TransportError};
use futures_util::future::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 16;

#[derive(Default)]
pub struct MqttBroker {
    link: Option<Link>,
    pending: VecDeque<InboundMessage>,
}

struct Link {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&mut self) -> Result<&mut Link, TransportError> {
        self.link.as_mut().ok_or(TransportError::Disconnected)
    }

    /// Poll once, buffering inbound publishes. Drops the link on error.
    async fn poll_once(&mut self) -> Result<Event, TransportError> {
        let polled = self.link()?.eventloop.poll().await;
        match polled {
            Ok(event) => {
                if let Event::Incoming(Packet::Publish(publish)) = &event {
                    self.pending.push_back(InboundMessage::new(
                        publish.topic.clone(),
                        publish.payload.to_vec(),
                    ));
                }
                Ok(event)
            }
            Err(e) => {
                self.link = None;
                Err(TransportError::Io(e.to_string()))
            }
        }
    }
}

impl Broker for MqttBroker {
    fn connect<'a>(
        &'a mut self,
        endpoint: &'a BrokerEndpoint,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.link = None;
            self.pending.clear();

            let mut options = MqttOptions::new(&endpoint.client_id, &endpoint.host, endpoint.port);
            options.set_keep_alive(endpoint.keep_alive);
            options.set_clean_session(true);
            if let Some(username) = &endpoint.username {
                options.set_credentials(
                    username.clone(),
                    endpoint.password.clone().unwrap_or_default(),
                );
            }
            let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            break;
                        }
                        return Err(TransportError::Rejected(format!("{:?}", ack.code)));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(TransportError::Connect(e.to_string())),
                }
            }
            debug!(host = %endpoint.host, port = endpoint.port, "MQTT connected");
            self.link = Some(Link { client, eventloop });
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a mut self,
        filter: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.link()?
                .client
                .subscribe(filter, QoS::AtLeastOnce)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;
            loop {
                if let Event::Incoming(Packet::SubAck(_)) = self.poll_once().await? {
                    return Ok(());
                }
            }
        })
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.link()?
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| TransportError::Io(e.to_string()))?;

            let mut pkid = None;
            loop {
                match self.poll_once().await? {
                    Event::Outgoing(Outgoing::Publish(id)) if pkid.is_none() => pkid = Some(id),
                    Event::Incoming(Packet::PubAck(ack)) if Some(ack.pkid) == pkid => {
                        return Ok(());
                    }
                    _ => {}
                }
            }
        })
    }

    fn pump(
        &mut self,
        budget: Duration,
    ) -> BoxFuture<'_, Result<Vec<InboundMessage>, TransportError>> {
        Box::pin(async move {
            let deadline = Instant::now() + budget;
            loop {
                let polled = {
                    let link = self.link()?;
                    tokio::time::timeout_at(deadline, link.eventloop.poll()).await
                };
                match polled {
                    Err(_elapsed) => break,
                    Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        self.pending.push_back(InboundMessage::new(
                            publish.topic,
                            publish.payload.to_vec(),
                        ));
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "MQTT connection lost");
                        self.link = None;
                        return Err(TransportError::Io(e.to_string()));
                    }
                }
            }
            Ok(self.pending.drain(..).collect())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(mut link) = self.link.take()
                && link.client.disconnect().await.is_ok()
            {
                // Give the event loop a moment to flush the DISCONNECT.
                let _ = tokio::time::timeout(Duration::from_millis(200), link.eventloop.poll())
                    .await;
            }
            self.pending.clear();
        })
    }
}

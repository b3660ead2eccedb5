//! Transport session: one logical broker connection with fixed-cooldown
//! reconnection.
//!
//! The session is advanced by [`TransportSession::poll`] from the terminal's
//! driving loop. It never blocks longer than the configured connect or send
//! budget, and any transport failure drops it straight to
//! [`Phase::Disconnected`].

use std::time::Duration;

use at_protocol::{Broker, BrokerEndpoint, InboundMessage, TransportError};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::context::DeviceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub phase: Phase,
    pub last_attempt_at: Option<Instant>,
    pub attempt_count: u32,
    pub last_heartbeat_at: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: Phase::Disconnected,
            last_attempt_at: None,
            attempt_count: 0,
            last_heartbeat_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("reconnect cooling down for another {remaining:?}")]
    CoolingDown { remaining: Duration },
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not encode status payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A connectivity transition, reported to observers by the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    AttemptFailed { attempt_count: u32 },
    Lost,
}

/// What one [`TransportSession::poll`] produced.
#[derive(Debug, Default)]
pub struct PollReport {
    /// A reconnect succeeded during this poll.
    pub reconnected: bool,
    pub inbound: Vec<InboundMessage>,
}

/// `{namespace}-{device_id}-{4 random hex}`
pub fn client_id(namespace: &str, device_id: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{namespace}-{device_id}-{}", &suffix[..4])
}

pub struct TransportSession<B> {
    broker: B,
    config: SessionConfig,
    state: SessionState,
    /// Remembered for automatic reconnects; cleared by `disconnect`.
    endpoint: Option<BrokerEndpoint>,
    events: Vec<LinkEvent>,
    last_error: Option<String>,
}

impl<B: Broker> TransportSession<B> {
    pub fn new(broker: B, config: SessionConfig) -> Self {
        Self {
            broker,
            config,
            state: SessionState::default(),
            endpoint: None,
            events: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.phase == Phase::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) {
        self.config.send_timeout = timeout;
    }

    /// Connectivity transitions since the last call.
    pub fn take_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    /// Connect to `endpoint`. A no-op when already connected.
    ///
    /// The endpoint is remembered, so a failed attempt is retried by
    /// [`TransportSession::poll`] once the cooldown has passed.
    pub async fn connect(
        &mut self,
        ctx: &DeviceContext,
        endpoint: BrokerEndpoint,
    ) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        self.endpoint = Some(endpoint);
        if let Some(remaining) = self.cooldown_remaining(Instant::now()) {
            return Err(ConnectError::CoolingDown { remaining });
        }
        self.attempt(ctx).await
    }

    /// Advance the session by one cooperative step.
    ///
    /// Disconnected with a remembered endpoint and an elapsed cooldown: try to
    /// reconnect. Connected: collect inbound messages for at most the
    /// configured inbound budget.
    pub async fn poll(&mut self, ctx: &DeviceContext) -> PollReport {
        let mut report = PollReport::default();

        if self.state.phase == Phase::Disconnected
            && self.endpoint.is_some()
            && self.cooldown_remaining(Instant::now()).is_none()
        {
            report.reconnected = self.attempt(ctx).await.is_ok();
        }

        if self.is_connected() {
            let budget = self.config.inbound_budget;
            let pumped =
                tokio::time::timeout(budget + self.config.send_timeout, self.broker.pump(budget))
                    .await;
            match pumped {
                Ok(Ok(inbound)) => report.inbound = inbound,
                Ok(Err(e)) => self.mark_lost(&e.to_string()),
                Err(_elapsed) => self.mark_lost("inbound pump timed out"),
            }
        }
        report
    }

    /// Publish a heartbeat if connected and the interval has elapsed.
    /// Returns whether one was sent.
    pub async fn heartbeat_if_due(&mut self, ctx: &DeviceContext) -> Result<bool, PublishError> {
        if !self.is_connected() {
            return Ok(false);
        }
        let now = Instant::now();
        let due = self
            .state
            .last_heartbeat_at
            .is_none_or(|at| now.duration_since(at) >= self.config.heartbeat_interval);
        if !due {
            return Ok(false);
        }
        self.send_heartbeat(ctx).await?;
        Ok(true)
    }

    /// Publish a heartbeat now and restart the interval.
    pub async fn send_heartbeat(&mut self, ctx: &DeviceContext) -> Result<(), PublishError> {
        self.publish_json(&ctx.topics().status("heartbeat"), &ctx.heartbeat())
            .await?;
        self.state.last_heartbeat_at = Some(Instant::now());
        debug!("heartbeat sent");
        Ok(())
    }

    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let timeout = self.config.send_timeout;
        match tokio::time::timeout(timeout, self.broker.publish(topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_lost(&e.to_string());
                Err(PublishError::Transport(e))
            }
            Err(_elapsed) => {
                self.mark_lost("publish timed out");
                Err(PublishError::Timeout(timeout))
            }
        }
    }

    pub async fn publish_json<T: Serialize>(
        &mut self,
        topic: &str,
        body: &T,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(body)?;
        self.publish(topic, payload).await
    }

    /// Announce "offline", close the link and stop reconnecting until
    /// [`TransportSession::connect`] is called again.
    pub async fn disconnect(&mut self, ctx: &DeviceContext) {
        self.endpoint = None;
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self
            .publish_json(&ctx.topics().status("online"), &ctx.status("offline"))
            .await
        {
            debug!(error = %e, "offline status not delivered");
        }
        tokio::time::timeout(self.config.send_timeout, self.broker.disconnect())
            .await
            .ok();
        if self.state.phase == Phase::Connected {
            self.state.phase = Phase::Disconnected;
            self.events.push(LinkEvent::Lost);
        }
        info!("session closed");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.state.last_attempt_at?;
        let elapsed = now.duration_since(last);
        (elapsed < self.config.reconnect_cooldown)
            .then(|| self.config.reconnect_cooldown - elapsed)
    }

    async fn attempt(&mut self, ctx: &DeviceContext) -> Result<(), ConnectError> {
        let Some(endpoint) = self.endpoint.clone() else {
            return Err(ConnectError::Transport(TransportError::Disconnected));
        };
        let now = Instant::now();
        self.state.phase = Phase::Connecting;
        self.state.last_attempt_at = Some(now);
        info!(
            host = %endpoint.host,
            port = endpoint.port,
            attempt = self.state.attempt_count + 1,
            "connecting to broker"
        );

        let budget = self.config.connect_timeout;
        let result = match tokio::time::timeout(budget, self.establish(ctx, &endpoint)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ConnectError::Timeout(budget)),
        };

        match result {
            Ok(()) => {
                self.state.phase = Phase::Connected;
                self.state.attempt_count = 0;
                self.state.last_heartbeat_at = Some(now);
                self.last_error = None;
                self.events.push(LinkEvent::Connected);
                info!(client_id = %endpoint.client_id, "broker session established");
                Ok(())
            }
            Err(e) => {
                tokio::time::timeout(self.config.send_timeout, self.broker.disconnect())
                    .await
                    .ok();
                self.state.phase = Phase::Disconnected;
                self.state.attempt_count = self.state.attempt_count.saturating_add(1);
                self.last_error = Some(e.to_string());
                self.events.push(LinkEvent::AttemptFailed {
                    attempt_count: self.state.attempt_count,
                });
                warn!(
                    error = %e,
                    attempts = self.state.attempt_count,
                    retry_in = ?self.config.reconnect_cooldown,
                    "broker connect failed"
                );
                Err(e)
            }
        }
    }

    /// Connect, subscribe, and announce. Runs inside the connect budget.
    async fn establish(
        &mut self,
        ctx: &DeviceContext,
        endpoint: &BrokerEndpoint,
    ) -> Result<(), ConnectError> {
        self.broker.connect(endpoint).await?;
        for filter in ctx.topics().subscriptions() {
            self.broker.subscribe(&filter).await?;
        }
        let topics = ctx.topics();
        self.broker
            .publish(
                &topics.status("online"),
                serde_json::to_vec(&ctx.status("online"))?,
            )
            .await?;
        self.broker
            .publish(&topics.status("metrics"), serde_json::to_vec(&ctx.metrics())?)
            .await?;
        Ok(())
    }

    fn mark_lost(&mut self, reason: &str) {
        if self.state.phase != Phase::Connected {
            return;
        }
        warn!(reason, "broker connection lost");
        self.state.phase = Phase::Disconnected;
        self.last_error = Some(reason.to_owned());
        self.events.push(LinkEvent::Lost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceIdentity;
    use crate::hooks::DeviceProbe;
    use at_test_utils::MockBroker;

    struct FixedProbe;

    impl DeviceProbe for FixedProbe {
        fn free_heap(&self) -> u64 {
            120_000
        }

        fn signal_strength(&self) -> i32 {
            -61
        }
    }

    fn context() -> DeviceContext {
        DeviceContext::new(
            DeviceIdentity {
                device_id: "term-07".to_owned(),
                access_key: "key".to_owned(),
                namespace: "fitinfinity".to_owned(),
            },
            "1.0.0",
            Box::new(FixedProbe),
        )
    }

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint {
            host: "broker.local".to_owned(),
            port: 1883,
            client_id: client_id("fitinfinity", "term-07"),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
        }
    }

    fn session(broker: &MockBroker) -> TransportSession<MockBroker> {
        TransportSession::new(broker.clone(), SessionConfig::default())
    }

    #[test]
    fn client_id_has_four_hex_suffix() {
        let id = client_id("fitinfinity", "term-07");
        let suffix = id.strip_prefix("fitinfinity-term-07-").unwrap();
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_subscribes_and_announces() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);

        s.connect(&ctx, endpoint()).await.unwrap();

        assert!(s.is_connected());
        assert_eq!(broker.subscriptions(), ctx.topics().subscriptions());
        let online = broker.published_to("status/online");
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].json()["status"], "online");
        assert_eq!(broker.published_to("status/metrics").len(), 1);
        assert_eq!(s.take_events(), vec![LinkEvent::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_when_connected_has_no_side_effects() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();
        broker.clear_published();

        s.connect(&ctx, endpoint()).await.unwrap();

        assert_eq!(broker.connect_attempts().len(), 1);
        assert!(broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_requires_connection() {
        let broker = MockBroker::unreachable();
        let mut s = session(&broker);
        let err = s.publish("a/b", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, PublishError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_spaced_by_cooldown_and_counter_resets() {
        let broker = MockBroker::unreachable();
        let ctx = context();
        let mut s = session(&broker);

        assert!(s.connect(&ctx, endpoint()).await.is_err());
        assert_eq!(s.state().attempt_count, 1);

        // Poll every 100 ms for 12 s: only two more attempts fit.
        for _ in 0..120 {
            tokio::time::advance(Duration::from_millis(100)).await;
            s.poll(&ctx).await;
        }
        let attempts = broker.connect_attempts();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(5));
        }
        assert_eq!(s.state().attempt_count, 3);

        broker.set_reachable(true);
        tokio::time::advance(Duration::from_secs(5)).await;
        let report = s.poll(&ctx).await;
        assert!(report.reconnected);
        assert_eq!(s.state().attempt_count, 0);
        assert_eq!(s.state().phase, Phase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_inside_cooldown_is_refused() {
        let broker = MockBroker::unreachable();
        let ctx = context();
        let mut s = session(&broker);
        assert!(s.connect(&ctx, endpoint()).await.is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        let err = s.connect(&ctx, endpoint()).await.unwrap_err();
        assert!(matches!(err, ConnectError::CoolingDown { .. }));
        assert_eq!(broker.connect_attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_teardown_after_failed_connect_is_bounded() {
        let broker = MockBroker::unreachable();
        broker.stall_disconnects(true);
        let ctx = context();
        let mut s = session(&broker);

        let started = Instant::now();
        assert!(s.connect(&ctx, endpoint()).await.is_err());
        assert!(started.elapsed() <= s.config().send_timeout);
        assert_eq!(broker.disconnects(), 1);
        assert_eq!(s.state().phase, Phase::Disconnected);
        assert_eq!(s.state().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_link_is_detected_on_poll_and_reconnected_later() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();
        s.take_events();

        broker.drop_connection();
        s.poll(&ctx).await;
        assert_eq!(s.state().phase, Phase::Disconnected);
        assert_eq!(s.take_events(), vec![LinkEvent::Lost]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(s.poll(&ctx).await.reconnected);
        assert_eq!(broker.subscriptions().len(), ctx.topics().subscriptions().len());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_disconnects_immediately() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();

        broker.fail_next_publishes(1);
        assert!(s.publish("a/b", b"{}".to_vec()).await.is_err());
        assert!(!s.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_times_out() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();

        broker.stall_publishes(true);
        let err = s.publish("a/b", b"{}".to_vec()).await.unwrap_err();
        assert!(matches!(err, PublishError::Timeout(_)));
        assert!(!s.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_follows_interval_and_never_while_disconnected() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();

        assert!(!s.heartbeat_if_due(&ctx).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(s.heartbeat_if_due(&ctx).await.unwrap());
        let beats = broker.published_to("status/heartbeat");
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].json()["wifiRSSI"], -61);

        broker.drop_connection();
        s.poll(&ctx).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!s.heartbeat_if_due(&ctx).await.unwrap());
        assert_eq!(broker.published_to("status/heartbeat").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_messages_are_returned_by_poll() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();

        broker.push_inbound("fitinfinity/devices/term-07/commands/restart", b"");
        let report = s.poll(&ctx).await;
        assert_eq!(report.inbound.len(), 1);
        assert!(!report.reconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_announces_offline_and_stops_reconnecting() {
        let broker = MockBroker::new();
        let ctx = context();
        let mut s = session(&broker);
        s.connect(&ctx, endpoint()).await.unwrap();

        s.disconnect(&ctx).await;
        let online = broker.published_to("status/online");
        assert_eq!(online.last().unwrap().json()["status"], "offline");
        assert!(!broker.is_connected());

        tokio::time::advance(Duration::from_secs(30)).await;
        s.poll(&ctx).await;
        assert_eq!(broker.connect_attempts().len(), 1);
    }
}

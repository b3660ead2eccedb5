//! The terminal: one owner for the session, the offline queue, the update
//! job and the host hooks, advanced by a single cooperative poll loop.
//!
//! Within one [`Terminal::poll`] the order is fixed: reconnect, drain one
//! offline batch, dispatch inbound messages, advance the update job by one
//! step, then heartbeat. A heartbeat is therefore never attempted while the
//! session is down.

use std::time::Duration;

use at_protocol::{
    AttendanceLog, AttendanceRecord, Broker, BrokerEndpoint, BulkAttendance, Capabilities,
    DeviceError, EnrollmentMode, EnrollmentStatus, OtaCapabilities, OtaCheck, OtaProgress,
    OtaStatus, ResetNotice, WifiCredentials, WifiNetwork, WifiScanResults, WifiStatus,
    timestamp_now,
};
use at_updater::{
    FirmwareSlot, FirmwareSource, UpdateEvent, UpdateJob, UpdatePhase, UpdatePlan,
    UpdateProgress, UpdateStatus,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::config::UpdateConfig;
use crate::context::DeviceContext;
use crate::hooks::{DeviceEvent, DeviceObserver, RestartReason};
use crate::router::{BuiltinCommand, EventRouter, RouteAction};
use crate::session::{ConnectError, LinkEvent, Phase, PublishError, TransportSession};
use crate::storage::credentials::CredentialStore;
use crate::storage::offline_queue::{EnqueueOutcome, OfflineQueue, QueueStats};
use crate::storage::{StorageError, StorageMode};

/// Delay between a factory reset and the restart it triggers.
const FACTORY_RESET_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where an attendance record went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("batch not delivered: {0}")]
    Publish(#[from] PublishError),
    #[error("batch delivered but not committed: {0}")]
    Storage(#[from] StorageError),
}

/// Snapshot for the host's status query.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalStatus {
    pub device_id: String,
    pub phase: Phase,
    pub attempt_count: u32,
    pub queue: QueueStats,
    pub update: Option<UpdateProgress>,
    pub firmware_version: String,
    pub enrollment_mode: bool,
    pub maintenance_mode: bool,
    pub ntp_server: String,
    /// HTTP status of the last backend API request, if any was made.
    pub last_response_code: Option<u16>,
    pub last_error: Option<String>,
}

/// Everything a [`Terminal`] is assembled from.
pub struct TerminalParts<B> {
    pub context: DeviceContext,
    pub session: TransportSession<B>,
    pub queue: OfflineQueue,
    pub batch_max: usize,
    pub credentials: Box<dyn CredentialStore>,
    pub source: Box<dyn FirmwareSource>,
    pub slot: Box<dyn FirmwareSlot>,
    pub update: UpdateConfig,
    /// Backend request/response channel; `None` when no API URL is set.
    pub api: Option<ApiClient>,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledRestart {
    reason: RestartReason,
    at: Instant,
}

pub struct Terminal<B> {
    ctx: DeviceContext,
    session: TransportSession<B>,
    queue: OfflineQueue,
    batch_max: usize,
    credentials: Box<dyn CredentialStore>,
    router: EventRouter,
    observers: Vec<Box<dyn DeviceObserver>>,
    source: Box<dyn FirmwareSource>,
    slot: Box<dyn FirmwareSlot>,
    update_config: UpdateConfig,
    update: Option<UpdateJob>,
    last_update: Option<UpdateProgress>,
    restart: Option<ScheduledRestart>,
    storage_reported: bool,
    api: Option<ApiClient>,
    last_error: Option<String>,
}

impl<B: Broker> Terminal<B> {
    pub fn new(parts: TerminalParts<B>) -> Self {
        let mut ctx = parts.context;
        ctx.request_timeout = parts.update.request_timeout;
        Self {
            ctx,
            session: parts.session,
            queue: parts.queue,
            batch_max: parts.batch_max.max(1),
            credentials: parts.credentials,
            router: EventRouter::new(),
            observers: Vec::new(),
            source: parts.source,
            slot: parts.slot,
            update_config: parts.update,
            update: None,
            last_update: None,
            restart: None,
            storage_reported: false,
            api: parts.api,
            last_error: None,
        }
    }

    // -----------------------------------------------------------------------
    // Host contract
    // -----------------------------------------------------------------------

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub fn router_mut(&mut self) -> &mut EventRouter {
        &mut self.router
    }

    /// Observers are notified in registration order.
    pub fn add_observer(&mut self, observer: Box<dyn DeviceObserver>) {
        self.observers.push(observer);
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error
            .as_deref()
            .or_else(|| self.session.last_error())
            .or_else(|| self.queue.last_error())
    }

    pub fn status(&self) -> TerminalStatus {
        let session = self.session.state();
        TerminalStatus {
            device_id: self.ctx.device_id().to_owned(),
            phase: session.phase,
            attempt_count: session.attempt_count,
            queue: self.queue.stats(),
            update: self
                .update
                .as_ref()
                .map(UpdateJob::progress)
                .or(self.last_update),
            firmware_version: self.ctx.firmware_version.clone(),
            enrollment_mode: self.ctx.enrollment_mode,
            maintenance_mode: self.ctx.maintenance_mode,
            ntp_server: self.ctx.ntp_server.clone(),
            last_response_code: self.api.as_ref().and_then(ApiClient::last_response_code),
            last_error: self.last_error().map(str::to_owned),
        }
    }

    /// Budget for per-request network operations, in milliseconds.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        let timeout = Duration::from_millis(timeout_ms);
        self.ctx.request_timeout = timeout;
        self.session.set_send_timeout(timeout);
        if let Some(api) = self.api.as_mut() {
            api.set_timeout(timeout);
        }
        info!(timeout_ms, "request timeout updated");
    }

    pub fn set_ntp_server(&mut self, server: impl Into<String>) {
        self.ctx.ntp_server = server.into();
        info!(server = %self.ctx.ntp_server, "NTP server updated");
    }

    pub fn set_offline_storage_mode(&mut self, mode: StorageMode) {
        self.queue.set_mode(mode);
    }

    pub async fn connect(&mut self, endpoint: BrokerEndpoint) -> Result<(), ConnectError> {
        let result = self.session.connect(&self.ctx, endpoint).await;
        self.flush_link_events();
        result?;
        if !self.queue.is_empty() {
            self.drain_once().await;
        }
        Ok(())
    }

    /// Authenticate with the backend API. A rejection is kept as the last
    /// error.
    pub async fn authenticate(&mut self) -> Result<(), ApiError> {
        let api = self.api.as_mut().ok_or(ApiError::NotConfigured)?;
        let result = api.authenticate().await;
        if let Err(e) = &result {
            self.last_error = Some(e.to_string());
        }
        result
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect(&self.ctx).await;
        self.flush_link_events();
    }

    // -----------------------------------------------------------------------
    // Attendance
    // -----------------------------------------------------------------------

    /// Send `record` now if connected, otherwise (or if the send fails)
    /// keep it in the offline queue.
    pub async fn log_attendance(&mut self, record: AttendanceRecord) -> Delivery {
        if self.session.is_connected() {
            let body =
                AttendanceLog::from_record(self.ctx.device_id(), self.ctx.access_key(), &record);
            let topic = self.ctx.topics().attendance(record.kind());
            match self.session.publish_json(&topic, &body).await {
                Ok(()) => {
                    debug!(kind = record.kind().as_str(), "attendance sent");
                    return Delivery::Sent;
                }
                Err(e) => {
                    warn!(error = %e, "attendance send failed, queueing");
                    self.flush_link_events();
                }
            }
        }
        self.enqueue(record);
        Delivery::Queued
    }

    /// One drain cycle: send up to one batch and commit it once the broker
    /// has acknowledged it. Returns the number of records removed.
    pub async fn sync_offline(&mut self) -> Result<usize, SyncError> {
        if self.queue.is_empty() {
            return Ok(0);
        }
        if !self.session.is_connected() {
            return Err(PublishError::NotConnected.into());
        }
        let batch = self.queue.drain_batch(self.batch_max);
        self.check_storage();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        let body = BulkAttendance::new(self.ctx.device_id(), self.ctx.access_key(), batch);
        let topic = self.ctx.topics().attendance_bulk();
        let sent = self.session.publish_json(&topic, &body).await;
        self.flush_link_events();
        sent?;
        self.queue.commit(count)?;
        info!(count, remaining = self.queue.len(), "offline batch synced");
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Enrollment
    // -----------------------------------------------------------------------

    /// Updates the context even while offline; the announcement is only
    /// published when connected.
    pub async fn set_enrollment_mode(&mut self, enabled: bool) -> Result<(), PublishError> {
        self.ctx.enrollment_mode = enabled;
        info!(enabled, "enrollment mode set");
        if !self.session.is_connected() {
            return Ok(());
        }
        let body = EnrollmentMode {
            device_id: self.ctx.device_id().to_owned(),
            enrollment_mode: enabled,
            timestamp: timestamp_now(),
        };
        let topic = self.ctx.topics().enrollment("mode");
        self.publish(&topic, &body).await
    }

    pub async fn publish_enrollment_status(
        &mut self,
        employee_id: &str,
        status: &str,
        fingerprint_id: Option<u32>,
    ) -> Result<(), PublishError> {
        let body = EnrollmentStatus {
            device_id: self.ctx.device_id().to_owned(),
            employee_id: employee_id.to_owned(),
            status: status.to_owned(),
            timestamp: timestamp_now(),
            fingerprint_id,
        };
        let topic = self.ctx.topics().enrollment("status");
        self.publish(&topic, &body).await
    }

    /// Report a device-level error on `status/error`.
    pub async fn report_error(&mut self, message: &str) -> Result<(), PublishError> {
        self.last_error = Some(message.to_owned());
        let body = DeviceError {
            device_id: self.ctx.device_id().to_owned(),
            error: message.to_owned(),
            timestamp: timestamp_now(),
            firmware_version: self.ctx.firmware_version.clone(),
        };
        let topic = self.ctx.topics().status("error");
        self.publish(&topic, &body).await
    }

    // -----------------------------------------------------------------------
    // Firmware update
    // -----------------------------------------------------------------------

    /// Start an update. Returns `false` if one is already running.
    pub fn start_update(&mut self, plan: UpdatePlan) -> bool {
        if let Some(running) = &self.update {
            info!(
                running = %running.plan().target_version,
                offered = %plan.target_version,
                "update already in progress, offer ignored"
            );
            return false;
        }
        info!(
            version = %plan.target_version,
            locator = %plan.locator,
            "firmware update started"
        );
        let mut limits = self.update_config.limits();
        limits.request_timeout = self.ctx.request_timeout;
        self.update = Some(UpdateJob::new(plan, limits));
        true
    }

    pub async fn publish_capabilities(&mut self) -> Result<(), PublishError> {
        let body = OtaCapabilities {
            device_id: self.ctx.device_id().to_owned(),
            capabilities: Capabilities {
                ota: true,
                max_firmware_size: self.update_config.max_size,
                checksum_validation: true,
                progress_reporting: true,
                rollback: false,
            },
            current_version: self.ctx.firmware_version.clone(),
            timestamp: timestamp_now(),
        };
        let topic = self.ctx.topics().ota("capabilities");
        self.publish(&topic, &body).await
    }

    /// Ask the backend whether a newer image exists.
    pub async fn request_update_check(&mut self) -> Result<(), PublishError> {
        let body = OtaCheck {
            device_id: self.ctx.device_id().to_owned(),
            current_version: self.ctx.firmware_version.clone(),
            request_update: true,
            timestamp: timestamp_now(),
        };
        let topic = self.ctx.topics().ota("check");
        self.publish(&topic, &body).await
    }

    async fn step_update(&mut self) {
        let Some(job) = self.update.as_mut() else {
            return;
        };
        let events = job.step(self.source.as_ref(), self.slot.as_mut()).await;
        let progress = job.progress();

        for event in events {
            match event {
                UpdateEvent::Progress(percent) => {
                    let body = OtaProgress {
                        device_id: self.ctx.device_id().to_owned(),
                        progress: percent,
                        timestamp: timestamp_now(),
                    };
                    let topic = self.ctx.topics().ota("progress");
                    self.announce(&topic, &body).await;
                    self.notify(&DeviceEvent::UpdateProgress(UpdateProgress {
                        percent,
                        ..progress
                    }));
                }
                UpdateEvent::Status(status) => self.announce_update_status(&status).await,
            }
        }

        if progress.phase.is_terminal()
            && let Some(job) = self.update.take()
        {
            self.last_update = Some(progress);
            self.finish_update(&job);
        }
    }

    fn finish_update(&mut self, job: &UpdateJob) {
        let version = job.plan().target_version.clone();
        match job.phase() {
            UpdatePhase::Complete => {
                info!(from = %self.ctx.firmware_version, to = %version, "firmware update applied");
                self.ctx.firmware_version = version;
                self.schedule_restart(
                    RestartReason::UpdateApplied,
                    self.update_config.restart_grace,
                );
            }
            _ => {
                let reason = job.failure().unwrap_or("unknown failure").to_owned();
                self.last_error = Some(format!("update to {version} failed: {reason}"));
                self.notify(&DeviceEvent::UpdateFailed { version, reason });
            }
        }
    }

    async fn announce_update_status(&mut self, status: &UpdateStatus) {
        let body = OtaStatus {
            device_id: self.ctx.device_id().to_owned(),
            status: status.as_str().to_owned(),
            error: status.error().map(str::to_owned),
            timestamp: timestamp_now(),
            firmware_version: self.ctx.firmware_version.clone(),
        };
        let topic = self.ctx.topics().ota("status");
        self.announce(&topic, &body).await;
    }

    // -----------------------------------------------------------------------
    // Restart and factory reset
    // -----------------------------------------------------------------------

    /// Keep the earliest pending restart.
    pub fn schedule_restart(&mut self, reason: RestartReason, after: Duration) {
        let at = Instant::now() + after;
        if self.restart.is_some_and(|pending| pending.at <= at) {
            return;
        }
        info!(%reason, after_ms = after.as_millis(), "restart scheduled");
        self.restart = Some(ScheduledRestart { reason, at });
        self.notify(&DeviceEvent::RestartScheduled { reason, after });
    }

    /// Forget credentials and queued records, announce, and restart.
    pub async fn factory_reset(&mut self) {
        warn!("factory reset requested");
        if let Err(e) = self.credentials.clear() {
            error!(error = %e, "failed to clear credentials");
            self.last_error = Some(e.to_string());
        }
        if let Err(e) = self.queue.clear() {
            error!(error = %e, "failed to clear offline queue");
            self.last_error = Some(e.to_string());
        }
        let body = ResetNotice {
            device_id: self.ctx.device_id().to_owned(),
            action: "factory_reset".to_owned(),
            timestamp: timestamp_now(),
        };
        let topic = self.ctx.topics().status("reset");
        self.announce(&topic, &body).await;
        self.schedule_restart(RestartReason::FactoryReset, FACTORY_RESET_GRACE);
    }

    // -----------------------------------------------------------------------
    // Driving loop
    // -----------------------------------------------------------------------

    /// One cooperative step. Returns a restart reason once a scheduled
    /// restart is due.
    pub async fn poll(&mut self) -> Option<RestartReason> {
        let report = self.session.poll(&self.ctx).await;
        self.flush_link_events();
        if report.reconnected {
            debug!("session re-established");
        }

        if self.session.is_connected() && !self.queue.is_empty() {
            self.drain_once().await;
        }

        for message in &report.inbound {
            let action = self.router.route(&mut self.ctx, message);
            self.perform(action).await;
        }

        self.step_update().await;

        if let Err(e) = self.session.heartbeat_if_due(&self.ctx).await {
            debug!(error = %e, "heartbeat not delivered");
        }
        self.flush_link_events();
        self.check_storage();

        self.restart
            .filter(|pending| Instant::now() >= pending.at)
            .map(|pending| pending.reason)
    }

    /// Poll on the configured cadence until a restart is due or `shutdown`
    /// flips to `true`. The session is closed before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Option<RestartReason> {
        let mut ticker = tokio::time::interval(self.session.config().poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            if *shutdown.borrow() {
                info!("terminal stopping (shutdown)");
                break None;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(reason) = self.poll().await {
                        info!(%reason, "restarting");
                        break Some(reason);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                }
            }
        };
        self.disconnect().await;
        outcome
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn perform(&mut self, action: RouteAction) {
        match action {
            RouteAction::Done => {}
            RouteAction::StartUpdate(plan) => {
                if self.update_config.auto_apply {
                    self.start_update(plan);
                } else {
                    info!(version = %plan.target_version, "update offered, auto apply disabled");
                }
            }
            RouteAction::ApplyWifi(credentials) => self.apply_wifi(&credentials).await,
            RouteAction::PublishScan(networks) => self.publish_scan(networks).await,
            RouteAction::Command(command) => self.run_command(command).await,
            RouteAction::MaintenanceChanged { enabled, message } => {
                info!(enabled, "maintenance mode changed");
                self.notify(&DeviceEvent::MaintenanceMode { enabled, message });
            }
        }
    }

    async fn run_command(&mut self, command: BuiltinCommand) {
        info!(?command, "command received");
        let result = match command {
            BuiltinCommand::Restart => {
                self.schedule_restart(RestartReason::Requested, self.update_config.restart_grace);
                Ok(())
            }
            BuiltinCommand::FactoryReset => {
                self.factory_reset().await;
                Ok(())
            }
            BuiltinCommand::Heartbeat => self.session.send_heartbeat(&self.ctx).await,
            BuiltinCommand::Metrics => {
                let body = self.ctx.metrics();
                let topic = self.ctx.topics().status("metrics");
                self.publish(&topic, &body).await
            }
            BuiltinCommand::CheckUpdate => self.request_update_check().await,
            BuiltinCommand::Capabilities => self.publish_capabilities().await,
            BuiltinCommand::Sync => match self.sync_offline().await {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "requested sync failed");
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            warn!(?command, error = %e, "command reply not delivered");
        }
        self.flush_link_events();
    }

    async fn apply_wifi(&mut self, credentials: &WifiCredentials) {
        info!(ssid = %credentials.ssid, "applying network credentials");
        if let Err(e) = self.credentials.save_wifi(credentials) {
            error!(error = %e, "failed to save network credentials");
            self.last_error = Some(e.to_string());
            self.announce_wifi_status(&credentials.ssid, &e.to_string())
                .await;
            return;
        }
        self.announce_wifi_status(&credentials.ssid, "Configuring...")
            .await;
        self.schedule_restart(
            RestartReason::WifiReconfigured,
            self.update_config.restart_grace,
        );
    }

    async fn announce_wifi_status(&mut self, ssid: &str, note: &str) {
        let body = WifiStatus {
            device_id: self.ctx.device_id().to_owned(),
            connected: false,
            ssid: ssid.to_owned(),
            ip_address: String::new(),
            timestamp: timestamp_now(),
            action: "status".to_owned(),
            error: Some(note.to_owned()),
        };
        let topic = self.ctx.topics().wifi("status");
        self.announce(&topic, &body).await;
    }

    async fn publish_scan(&mut self, networks: Vec<WifiNetwork>) {
        info!(found = networks.len(), "network scan completed");
        let body = WifiScanResults {
            device_id: self.ctx.device_id().to_owned(),
            networks,
            timestamp: timestamp_now(),
            action: "scan".to_owned(),
        };
        let topic = self.ctx.topics().wifi("request");
        self.announce(&topic, &body).await;
    }

    async fn drain_once(&mut self) {
        if let Err(e) = self.sync_offline().await {
            warn!(error = %e, pending = self.queue.len(), "offline sync failed, will retry");
        }
    }

    fn enqueue(&mut self, record: AttendanceRecord) {
        let evicted = match self.queue.enqueue(record) {
            EnqueueOutcome::Persisted => false,
            EnqueueOutcome::Buffered { evicted } | EnqueueOutcome::Degraded { evicted, .. } => {
                evicted
            }
        };
        if evicted {
            warn!("offline buffer full, oldest record dropped");
        }
        self.check_storage();
    }

    /// Report storage degradation once per episode.
    fn check_storage(&mut self) {
        match (self.queue.is_degraded(), self.storage_reported) {
            (true, false) => {
                let reason = self
                    .queue
                    .last_error()
                    .unwrap_or("offline log unavailable")
                    .to_owned();
                self.storage_reported = true;
                self.notify(&DeviceEvent::StorageDegraded { reason });
            }
            (false, true) => self.storage_reported = false,
            _ => {}
        }
    }

    async fn publish<T: Serialize>(&mut self, topic: &str, body: &T) -> Result<(), PublishError> {
        let result = self.session.publish_json(topic, body).await;
        self.flush_link_events();
        result
    }

    /// Publish if connected; a failure only costs the announcement.
    async fn announce<T: Serialize>(&mut self, topic: &str, body: &T) {
        if !self.session.is_connected() {
            return;
        }
        if let Err(e) = self.publish(topic, body).await {
            debug!(topic, error = %e, "announcement not delivered");
        }
    }

    fn flush_link_events(&mut self) {
        for event in self.session.take_events() {
            let (connected, attempt_count) = match event {
                LinkEvent::Connected => (true, 0),
                LinkEvent::AttemptFailed { attempt_count } => (false, attempt_count),
                LinkEvent::Lost => (false, self.session.state().attempt_count),
            };
            self.notify(&DeviceEvent::ConnectivityChanged {
                connected,
                attempt_count,
            });
        }
    }

    fn notify(&mut self, event: &DeviceEvent) {
        for observer in &mut self.observers {
            observer.on_event(event);
        }
    }
}

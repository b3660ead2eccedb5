//! Inbound control message dispatch.
//!
//! Each inbound message is classified by topic and handled by exactly one
//! handler. Anything the router cannot finish on its own (starting an update,
//! publishing, restarting) comes back to the terminal as a [`RouteAction`].

use at_protocol::{ControlMessage, InboundMessage, UpdateAvailable, WifiCredentials, WifiNetwork};
use at_updater::UpdatePlan;
use tracing::{debug, info, warn};

use crate::context::DeviceContext;
use crate::hooks::{
    CommandHandler, ConfigHandler, EnrollmentHandler, FirmwareHandler, ModeHandler,
    UpdateDecision,
};

/// Commands the terminal answers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinCommand {
    Restart,
    FactoryReset,
    Heartbeat,
    Metrics,
    CheckUpdate,
    Capabilities,
    Sync,
}

impl BuiltinCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "restart" => BuiltinCommand::Restart,
            "factory_reset" => BuiltinCommand::FactoryReset,
            "heartbeat" => BuiltinCommand::Heartbeat,
            "metrics" => BuiltinCommand::Metrics,
            "check_update" => BuiltinCommand::CheckUpdate,
            "capabilities" => BuiltinCommand::Capabilities,
            "sync" => BuiltinCommand::Sync,
            _ => return None,
        })
    }
}

/// Follow-up work for the terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Fully handled, or dropped.
    Done,
    StartUpdate(UpdatePlan),
    /// No config handler registered: persist and restart.
    ApplyWifi(WifiCredentials),
    PublishScan(Vec<WifiNetwork>),
    Command(BuiltinCommand),
    MaintenanceChanged { enabled: bool, message: String },
}

#[derive(Default)]
pub struct EventRouter {
    enrollment: Option<Box<dyn EnrollmentHandler>>,
    mode: Option<Box<dyn ModeHandler>>,
    config: Option<Box<dyn ConfigHandler>>,
    firmware: Option<Box<dyn FirmwareHandler>>,
    command: Option<Box<dyn CommandHandler>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enrollment_handler(&mut self, handler: Box<dyn EnrollmentHandler>) {
        self.enrollment = Some(handler);
    }

    pub fn set_mode_handler(&mut self, handler: Box<dyn ModeHandler>) {
        self.mode = Some(handler);
    }

    pub fn set_config_handler(&mut self, handler: Box<dyn ConfigHandler>) {
        self.config = Some(handler);
    }

    pub fn set_firmware_handler(&mut self, handler: Box<dyn FirmwareHandler>) {
        self.firmware = Some(handler);
    }

    pub fn set_command_handler(&mut self, handler: Box<dyn CommandHandler>) {
        self.command = Some(handler);
    }

    /// Parse and dispatch one raw inbound message. Unknown topics and
    /// malformed payloads are logged and dropped.
    pub fn route(&mut self, ctx: &mut DeviceContext, message: &InboundMessage) -> RouteAction {
        match ControlMessage::parse(ctx.topics(), &message.topic, &message.payload) {
            Ok(msg) => self.dispatch(ctx, msg),
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "inbound message dropped");
                RouteAction::Done
            }
        }
    }

    pub fn dispatch(&mut self, ctx: &mut DeviceContext, msg: ControlMessage) -> RouteAction {
        debug!(category = msg.category(), "dispatching control message");
        match msg {
            ControlMessage::EnrollmentRequest(request) => {
                match self.enrollment.as_mut() {
                    Some(handler) => handler.on_enrollment_request(&request),
                    None => info!(
                        employee_id = %request.employee_id,
                        "enrollment request with no handler registered"
                    ),
                }
                RouteAction::Done
            }
            ControlMessage::EnrollmentModeSwitch(switch) => {
                ctx.enrollment_mode = switch.enrollment_mode;
                info!(enabled = switch.enrollment_mode, "enrollment mode switched");
                if let Some(handler) = self.mode.as_mut() {
                    handler.on_mode_switch(switch.enrollment_mode);
                }
                RouteAction::Done
            }
            ControlMessage::UpdateAvailable(offer) => self.offer_update(&offer),
            ControlMessage::WifiConfig(credentials) => match self.config.as_mut() {
                Some(handler) => {
                    handler.on_wifi_config(&credentials);
                    RouteAction::Done
                }
                None => RouteAction::ApplyWifi(credentials),
            },
            ControlMessage::WifiScan => {
                let networks = self
                    .config
                    .as_mut()
                    .map(|handler| handler.scan_networks())
                    .unwrap_or_default();
                RouteAction::PublishScan(networks)
            }
            ControlMessage::Command { name, payload } => {
                if let Some(builtin) = BuiltinCommand::from_name(&name) {
                    return RouteAction::Command(builtin);
                }
                match self.command.as_mut() {
                    Some(handler) => handler.on_command(&name, &payload),
                    None => warn!(command = %name, "unknown command dropped"),
                }
                RouteAction::Done
            }
            ControlMessage::Broadcast { kind, body } => {
                info!(kind = %kind, message = %body.message, "system broadcast");
                if kind != "maintenance" {
                    return RouteAction::Done;
                }
                let enabled = body.enabled_flag();
                ctx.maintenance_mode = enabled;
                RouteAction::MaintenanceChanged {
                    enabled,
                    message: body.message,
                }
            }
        }
    }

    fn offer_update(&mut self, offer: &UpdateAvailable) -> RouteAction {
        if let Some(handler) = self.firmware.as_mut()
            && handler.on_update_available(offer) == UpdateDecision::Defer
        {
            info!(version = %offer.version, "firmware update deferred by host");
            return RouteAction::Done;
        }
        RouteAction::StartUpdate(UpdatePlan {
            target_version: offer.version.clone(),
            locator: offer.download_url.clone(),
            expected_checksum: offer.checksum().map(str::to_owned),
            declared_size: offer.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::context::DeviceIdentity;
    use crate::hooks::HostProbe;

    fn context() -> DeviceContext {
        DeviceContext::new(
            DeviceIdentity {
                device_id: "term-07".to_owned(),
                access_key: "key".to_owned(),
                namespace: "fitinfinity".to_owned(),
            },
            "1.0.0",
            Box::new(HostProbe),
        )
    }

    fn inbound(suffix: &str, payload: &str) -> InboundMessage {
        InboundMessage::new(format!("fitinfinity/devices/term-07/{suffix}"), payload)
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.0.lock().unwrap().push(call);
        }
    }

    impl EnrollmentHandler for Recorder {
        fn on_enrollment_request(&mut self, request: &at_protocol::EnrollmentRequest) {
            self.push(format!("enroll:{}", request.employee_id));
        }
    }

    impl ModeHandler for Recorder {
        fn on_mode_switch(&mut self, enrollment_mode: bool) {
            self.push(format!("mode:{enrollment_mode}"));
        }
    }

    impl CommandHandler for Recorder {
        fn on_command(&mut self, name: &str, _payload: &serde_json::Value) {
            self.push(format!("command:{name}"));
        }
    }

    struct Veto;

    impl FirmwareHandler for Veto {
        fn on_update_available(&mut self, _offer: &UpdateAvailable) -> UpdateDecision {
            UpdateDecision::Defer
        }
    }

    struct FixedScan;

    impl ConfigHandler for FixedScan {
        fn on_wifi_config(&mut self, _credentials: &WifiCredentials) {}

        fn scan_networks(&mut self) -> Vec<WifiNetwork> {
            vec![WifiNetwork {
                ssid: "office".to_owned(),
                rssi: -50,
                encryption: "Secured".to_owned(),
            }]
        }
    }

    #[test]
    fn enrollment_request_reaches_its_handler_only() {
        let rec = Recorder::default();
        let mut router = EventRouter::new();
        router.set_enrollment_handler(Box::new(rec.clone()));
        router.set_mode_handler(Box::new(rec.clone()));
        let mut ctx = context();

        let action = router.route(
            &mut ctx,
            &inbound(
                "enrollment/request",
                r#"{"employeeId":"E-12","employeeName":"Ana","fingerprintSlot":4}"#,
            ),
        );

        assert_eq!(action, RouteAction::Done);
        assert_eq!(rec.calls(), vec!["enroll:E-12"]);
    }

    #[test]
    fn mode_switch_updates_context_then_notifies() {
        let rec = Recorder::default();
        let mut router = EventRouter::new();
        router.set_mode_handler(Box::new(rec.clone()));
        let mut ctx = context();

        router.route(
            &mut ctx,
            &inbound("enrollment/mode/switch", r#"{"enrollmentMode":true}"#),
        );

        assert!(ctx.enrollment_mode);
        assert_eq!(rec.calls(), vec!["mode:true"]);
    }

    #[test]
    fn update_offer_becomes_a_plan() {
        let mut router = EventRouter::new();
        let mut ctx = context();
        let action = router.route(
            &mut ctx,
            &inbound(
                "ota/available",
                r#"{"version":"1.2.0","downloadUrl":"http://fw/1.2.0.bin","checksum":"","size":150000}"#,
            ),
        );
        assert_eq!(
            action,
            RouteAction::StartUpdate(UpdatePlan {
                target_version: "1.2.0".to_owned(),
                locator: "http://fw/1.2.0.bin".to_owned(),
                expected_checksum: None,
                declared_size: Some(150_000),
            })
        );
    }

    #[test]
    fn firmware_handler_can_defer_an_update() {
        let mut router = EventRouter::new();
        router.set_firmware_handler(Box::new(Veto));
        let mut ctx = context();
        let action = router.route(
            &mut ctx,
            &inbound(
                "ota/available",
                r#"{"version":"1.2.0","downloadUrl":"http://fw/1.2.0.bin"}"#,
            ),
        );
        assert_eq!(action, RouteAction::Done);
    }

    #[test]
    fn wifi_config_defaults_to_apply_without_handler() {
        let mut router = EventRouter::new();
        let mut ctx = context();
        let action = router.route(
            &mut ctx,
            &inbound("config/wifi/response", r#"{"ssid":"gym","password":"pw"}"#),
        );
        assert_eq!(
            action,
            RouteAction::ApplyWifi(WifiCredentials {
                ssid: "gym".to_owned(),
                password: "pw".to_owned(),
            })
        );
    }

    #[test]
    fn wifi_scan_uses_config_handler_or_reports_nothing() {
        let mut ctx = context();
        let mut bare = EventRouter::new();
        assert_eq!(
            bare.route(&mut ctx, &inbound("config/wifi/scan", "")),
            RouteAction::PublishScan(Vec::new())
        );

        let mut router = EventRouter::new();
        router.set_config_handler(Box::new(FixedScan));
        let RouteAction::PublishScan(networks) =
            router.route(&mut ctx, &inbound("config/wifi/scan", ""))
        else {
            panic!("expected scan results");
        };
        assert_eq!(networks[0].ssid, "office");
    }

    #[test]
    fn builtin_commands_stay_in_the_terminal() {
        let rec = Recorder::default();
        let mut router = EventRouter::new();
        router.set_command_handler(Box::new(rec.clone()));
        let mut ctx = context();

        assert_eq!(
            router.route(&mut ctx, &inbound("commands/factory_reset", "")),
            RouteAction::Command(BuiltinCommand::FactoryReset)
        );
        assert_eq!(
            router.route(&mut ctx, &inbound("commands/beep", r#"{"times":2}"#)),
            RouteAction::Done
        );
        assert_eq!(rec.calls(), vec!["command:beep"]);
    }

    #[test]
    fn maintenance_broadcast_sets_flag() {
        let mut router = EventRouter::new();
        let mut ctx = context();
        let action = router.route(
            &mut ctx,
            &InboundMessage::new(
                "fitinfinity/system/broadcast/maintenance",
                r#"{"message":"back at 6","data":{"enabled":true}}"#,
            ),
        );
        assert!(ctx.maintenance_mode);
        assert_eq!(
            action,
            RouteAction::MaintenanceChanged {
                enabled: true,
                message: "back at 6".to_owned(),
            }
        );

        router.route(
            &mut ctx,
            &InboundMessage::new(
                "fitinfinity/system/broadcast/news",
                r#"{"message":"hello","data":{"enabled":false}}"#,
            ),
        );
        assert!(ctx.maintenance_mode);
    }

    #[test]
    fn malformed_and_unknown_messages_are_dropped() {
        let rec = Recorder::default();
        let mut router = EventRouter::new();
        router.set_enrollment_handler(Box::new(rec.clone()));
        let mut ctx = context();

        assert_eq!(
            router.route(&mut ctx, &inbound("enrollment/request", "{not json")),
            RouteAction::Done
        );
        assert_eq!(
            router.route(&mut ctx, &inbound("something/else", "{}")),
            RouteAction::Done
        );
        assert!(rec.calls().is_empty());
    }
}

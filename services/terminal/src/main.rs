// attendance-terminal: Runs the device resilience layer against an MQTT broker.
//
// Wires together the credential store, offline queue, broker session and
// firmware updater, then drives the terminal until shutdown or a scheduled
// restart. A restart exits with status 0 so the supervisor starts us again.

use std::path::PathBuf;

use at_updater::{FileSlot, HttpFirmwareSource};
use clap::{Arg, Command};
use terminal::api::ApiClient;
use terminal::broker::MqttBroker;
use terminal::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use terminal::hooks::HostProbe;
use terminal::session::client_id;
use terminal::storage::credentials::SqliteCredentialStore;
use terminal::storage::offline_queue::OfflineQueue;
use terminal::{DeviceContext, Terminal, TerminalParts, TransportSession};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "attendance terminal starting");

    let matches = Command::new("Attendance Terminal")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Connectivity, offline queue and firmware updates for an attendance terminal")
        .arg(
            Arg::new("config")
                .help("Path to the TOML config file")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let cfg = match load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                device_id = %cfg.device.id,
                broker = %cfg.broker.host,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // -------------------------------------------------------------------------
    // Local state
    // -------------------------------------------------------------------------
    let credentials =
        match SqliteCredentialStore::open(std::path::Path::new(&cfg.credentials.sqlite_path)) {
            Ok(store) => {
                info!(path = %cfg.credentials.sqlite_path, "credential store opened");
                store
            }
            Err(e) => {
                eprintln!("FATAL: failed to open credential store: {e}");
                std::process::exit(1);
            }
        };
    let queue = OfflineQueue::open(&cfg.queue);
    if queue.is_degraded() {
        warn!(
            path = %cfg.queue.log_path.display(),
            "offline log unavailable, buffering in memory"
        );
    }

    // -------------------------------------------------------------------------
    // Terminal
    // -------------------------------------------------------------------------
    let mut context = DeviceContext::new(
        cfg.identity(),
        cfg.device.firmware_version.clone(),
        Box::new(HostProbe),
    );
    context.ntp_server = cfg.time.ntp_server.clone();
    info!(ntp_server = %context.ntp_server, "time source configured");

    let api = cfg.api.as_ref().map(|api| {
        info!(url = %api.base_url, "backend API enabled");
        ApiClient::new(api.base_url.clone(), &cfg.identity(), api.timeout)
    });

    let mut terminal = Terminal::new(TerminalParts {
        context,
        session: TransportSession::new(MqttBroker::new(), cfg.session.clone()),
        queue,
        batch_max: cfg.queue.batch_max,
        credentials: Box::new(credentials),
        source: Box::new(HttpFirmwareSource::new(
            cfg.device.id.clone(),
            &cfg.device.firmware_version,
        )),
        slot: Box::new(FileSlot::new(cfg.update.slot_path.clone())),
        update: cfg.update.clone(),
        api,
    });

    if cfg.api.is_some()
        && let Err(e) = terminal.authenticate().await
    {
        warn!(error = %e, "backend authentication failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let endpoint = cfg
        .broker
        .endpoint(client_id(&cfg.device.namespace, &cfg.device.id));
    if let Err(e) = terminal.connect(endpoint).await {
        warn!(error = %e, "initial broker connect failed, retrying in background");
    }

    match terminal.run(shutdown_rx).await {
        Some(reason) => info!(%reason, "exiting for restart"),
        None => info!("attendance terminal stopped"),
    }
}

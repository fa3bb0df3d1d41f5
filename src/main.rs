use color_eyre::{eyre::eyre, Result};
use mqtt_lux_bridge::config::{default_config_path, AppConfig, LoggingConfig};
use mqtt_lux_bridge::mqtt::config::{MqttConfig, OFFLINE_PAYLOAD};
use mqtt_lux_bridge::mqtt::discovery::{Discovery, DiscoveryTarget};
use mqtt_lux_bridge::mqtt::message_manager::CommandRouter;
use mqtt_lux_bridge::mqtt::mqtt_handler::RumqttTransport;
use mqtt_lux_bridge::publish_loop::PublishLoop;
use mqtt_lux_bridge::registry::{Capabilities, CommandContext, TopicRegistry};
use mqtt_lux_bridge::sensor::bh1750::{LuxModeCommand, LuxSensor, ModeHandle};
use mqtt_lux_bridge::sensor::status::{RefreshCommand, StatusBeacon, ONLINE_PAYLOAD};
use mqtt_lux_bridge::sensor::{RppalBus, SharedBus};
use mqtt_lux_bridge::session::controller::SessionSettings;
use mqtt_lux_bridge::session::{self, state::SharedState};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = setup()?;
    let _log_guard = setup_logging(&config.logging)?;

    let topic_root = config.global.device_topic_root();
    info!("Starting agent for '{}'", topic_root);

    let state = SharedState::new();
    let registry = build_registry(&config)?;
    let router = CommandRouter::new(
        topic_root.clone(),
        &registry,
        CommandContext::new(state.clone()),
    );

    let status_topic = format!("{topic_root}/status");
    let mqtt_config = MqttConfig::from_global(&config.global, Some(status_topic.clone()));
    info!(
        "Connecting to {}:{} as '{}'",
        mqtt_config.host, mqtt_config.port, mqtt_config.client_id
    );
    let transport = Box::new(RumqttTransport::new(mqtt_config.mqtt_options()));

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let settings = SessionSettings {
        topic_root: topic_root.clone(),
        reconnect_delay: config.global.reconnect_delay(),
        discovery: build_discovery(&config, &topic_root, status_topic),
    };
    let (handle, supervisor) = tokio::select! {
        connected = session::connect(transport, router, state, settings, shutdown.clone()) => {
            connected
        }
        _ = shutdown.cancelled() => {
            warn!("Termination requested before the broker answered");
            return Ok(());
        }
    };

    let publish_loop = PublishLoop::new(
        registry,
        handle,
        topic_root,
        config.global.publish_delay(),
        config.global.full_publish_cycle,
    );
    publish_loop.run(shutdown.clone().cancelled_owned()).await;

    shutdown.cancel();
    if let Err(e) = supervisor.await {
        error!("MQTT session task ended abnormally: {}", e);
    }
    info!("Stopped");
    Ok(())
}

fn setup() -> Result<AppConfig> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let config = AppConfig::load(&path)
        .map_err(|e| eyre!("Invalid configuration {}: {}", path.display(), e))?;
    Ok(config)
}

/// Stdout logging, or a daily rotated file when `[logging] file` is set.
fn setup_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let level = logging.level()?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match logging.file_name() {
        Some(file) => {
            std::fs::create_dir_all(&logging.path).map_err(|e| {
                eyre!("Unable to create log directory {}: {}", logging.path.display(), e)
            })?;
            let appender = tracing_appender::rolling::daily(&logging.path, file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder.with_writer(writer).with_ansi(false).init();
            Ok(Some(guard))
        }
        None => {
            builder.pretty().init();
            Ok(None)
        }
    }
}

fn build_registry(config: &AppConfig) -> Result<TopicRegistry> {
    let sensor = &config.bh1750;
    let bus = SharedBus::new(
        RppalBus::open(sensor.i2c_bus)
            .map_err(|e| eyre!("Unable to open I2C bus {}: {}", sensor.i2c_bus, e))?,
    );
    let mode = ModeHandle::new(sensor.mode);

    let mut registry = TopicRegistry::new();
    registry.register(
        "bh1750",
        "lux",
        Capabilities::both(
            LuxSensor::new(bus, sensor.i2c_addr, mode.clone()),
            LuxModeCommand::new(mode),
        ),
    )?;
    registry.register("status", "status", Capabilities::both(StatusBeacon, RefreshCommand))?;
    Ok(registry)
}

fn build_discovery(config: &AppConfig, topic_root: &str, status_topic: String) -> Discovery {
    let ha = &config.ha_discover;
    Discovery::new(
        ha.enabled,
        ha.base.clone(),
        config.global.device_name.clone(),
        ha.display_name(&config.global),
    )
    .with_entity(
        "sensor",
        "lux",
        format!("{topic_root}/lux"),
        move |target: &DiscoveryTarget<'_>| lux_discovery_payload(target, &status_topic),
    )
}

fn lux_discovery_payload(target: &DiscoveryTarget<'_>, status_topic: &str) -> String {
    serde_json::json!({
        "name": "Light sensor",
        "unique_id": format!("{}_{}", target.node_id, target.object_id),
        "state_topic": target.state_topic,
        "device_class": "illuminance",
        "unit_of_measurement": "lx",
        "availability_topic": status_topic,
        "payload_available": ONLINE_PAYLOAD,
        "payload_not_available": OFFLINE_PAYLOAD,
        "device": {
            "identifiers": [target.node_id],
            "name": target.device_name,
            "model": "BH1750",
        },
    })
    .to_string()
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

use window_cover_bridge::config::{Config, ConnectionKind, load_dotenv};
use window_cover_bridge::cover::{CoverCommand, CoverController, CoverEvent};
use window_cover_bridge::device::{
    DeviceSession, DriveTiming, SerialTransport, TelnetTransport, Transport, WindowDrive,
};
use window_cover_bridge::error::{BridgeError, Result};
use window_cover_bridge::instance_lock::InstanceLock;
use window_cover_bridge::mqtt::MqttIntegration;

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    // Load .env file before anything else
    load_dotenv();
    init_logger();
    info!("Starting Window Cover Bridge");

    let config = Config::from_env();
    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Window Cover Bridge stopped");
}

async fn run(config: Config) -> Result<()> {
    let _lock = InstanceLock::acquire()?;

    info!("Configuration loaded:");
    info!("  Connection: {}", config.connection.kind);
    info!(
        "  Drive timing: {}s unlock / {}s travel / {}s lock",
        config.drive.unlock_secs, config.drive.travel_secs, config.drive.lock_secs
    );
    info!(
        "  MQTT broker: {}:{}",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    info!("  Base topic: {}", config.mqtt.base_topic);

    let timing = DriveTiming {
        unlock_secs: config.drive.unlock_secs,
        travel_secs: config.drive.travel_secs,
        lock_secs: config.drive.lock_secs,
    };
    let transport: Box<dyn Transport> = match config.connection.kind {
        ConnectionKind::Serial => Box::new(SerialTransport::new(&config.connection.serial_port)),
        ConnectionKind::Telnet => Box::new(TelnetTransport::new(
            &config.connection.host,
            config.connection.port,
        )),
    };
    let endpoint = transport.describe();

    let drive = WindowDrive::new(transport, timing);
    let unique_id = drive.unique_id();
    let session = Arc::new(Mutex::new(drive));

    // First contact runs on the blocking pool like every other wire access
    let connect_session = session.clone();
    match tokio::task::spawn_blocking(move || connect_session.lock().connect()).await {
        Ok(Ok(true)) => info!("Window drive on {} is available", endpoint),
        Ok(Ok(false)) => {
            return Err(BridgeError::ConnectionFailed(format!(
                "no answer from {endpoint}"
            )));
        }
        Ok(Err(e)) => return Err(BridgeError::ConnectionFailed(format!("{endpoint}: {e}"))),
        Err(e) => return Err(BridgeError::ConnectionFailed(format!("{endpoint}: {e}"))),
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<CoverCommand>(16);
    let (event_tx, event_rx) = mpsc::channel::<CoverEvent>(64);

    let controller = CoverController::new(session, config.poll, cmd_rx, event_tx);
    let controller_task = tokio::spawn(controller.run());

    let integration = MqttIntegration::new(config.mqtt, unique_id, cmd_tx.clone(), event_rx);
    let mqtt_task = integration.start();

    info!("Window Cover Bridge is running");
    info!("  - Press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    // The controller disconnects the drive on shutdown; the integration
    // follows once the event channel closes and leaves an offline marker.
    let _ = cmd_tx.send(CoverCommand::Shutdown).await;
    if tokio::time::timeout(Duration::from_secs(5), controller_task)
        .await
        .is_err()
    {
        warn!("Controller did not stop in time");
    }
    let mqtt_abort = mqtt_task.abort_handle();
    if tokio::time::timeout(Duration::from_secs(2), mqtt_task)
        .await
        .is_err()
    {
        warn!("MQTT integration did not stop in time");
        mqtt_abort.abort();
    }

    Ok(())
}

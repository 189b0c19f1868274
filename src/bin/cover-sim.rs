//! Development binary that runs the cover controller against a simulated
//! drive, without a broker or hardware.
//!
//! Usage:
//!   cargo run --bin cover-sim
//!
//! Plays a short command script against the controller and logs every
//! state change, compressing a full open/close cycle into a few seconds.

use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

use window_cover_bridge::config::PollConfig;
use window_cover_bridge::cover::{CoverCommand, CoverController, CoverEvent};
use window_cover_bridge::device::{DriveTiming, SimulatedDrive};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .format_timestamp_millis()
        .init();

    info!("Starting cover simulation");

    // Compressed timing so a full cycle fits in a few seconds
    let timing = DriveTiming {
        unlock_secs: 1.0,
        travel_secs: 6.0,
        lock_secs: 1.0,
    };
    let poll = PollConfig {
        moving_interval_ms: 200,
        settling_interval_ms: 50,
        offline_interval_ms: 1000,
        offline_after_failures: 0,
    };

    let session = Arc::new(Mutex::new(SimulatedDrive::new(timing)));
    let (cmd_tx, cmd_rx) = mpsc::channel::<CoverCommand>(16);
    let (event_tx, mut event_rx) = mpsc::channel::<CoverEvent>(64);

    let controller = CoverController::new(session, poll, cmd_rx, event_tx);
    let controller_task = tokio::spawn(controller.run());

    let logger_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                CoverEvent::StateChanged(state) => info!(
                    "cover: position={:?} opening={} closing={} closed={}",
                    state.position, state.opening, state.closing, state.closed
                ),
                CoverEvent::DeviceInfo(device) => {
                    info!("drive: {} ({})", device.device, device.version)
                }
                CoverEvent::RefreshFailed(e) => info!("refresh failed: {}", e),
            }
        }
    });

    // Pretend the platform remembered the window 40% open; the simulated
    // drive wakes up locked, so the restore gets discarded.
    let script = [
        (Duration::ZERO, CoverCommand::Restore(Some(40))),
        (Duration::from_secs(1), CoverCommand::Open),
        (Duration::from_secs(4), CoverCommand::Stop),
        (Duration::from_secs(1), CoverCommand::SetPosition(25)),
        (Duration::from_secs(4), CoverCommand::Close),
        (Duration::from_secs(9), CoverCommand::Shutdown),
    ];
    for (delay, cmd) in script {
        sleep(delay).await;
        info!("sending {:?}", cmd);
        if cmd_tx.send(cmd).await.is_err() {
            break;
        }
    }

    let _ = controller_task.await;
    logger_task.abort();
    info!("Simulation finished");
}

use anyhow::Result;
use locator::{
    CoordinatorOptions, LanTransport, OverlayFeed, SessionCoordinator, SimulatedRanging,
};
use shared::config::Config;
use shared::init_logging;
use std::time::Duration;

/// Frames between two progress lines in the log
const LOG_EVERY_FRAMES: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    init_logging(config.logging.format)?;

    tracing::info!(
        device = %config.device.display_name,
        port = config.transport.listen_port,
        ranging_supported = config.ranging.supported,
        "Starting locator"
    );

    let transport = LanTransport::new(
        config.device.display_name.clone(),
        config.transport.listen_port,
    );
    let ranging = SimulatedRanging::with_settings(
        config.ranging.supported,
        Duration::from_millis(config.ranging.update_interval_ms),
    );

    let coordinator = SessionCoordinator::new(
        Box::new(transport),
        Box::new(ranging),
        CoordinatorOptions::from(&config.coordinator),
    );
    coordinator.start()?;

    let mut feed = OverlayFeed::new(coordinator.subscribe());
    let mut frames: u64 = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown requested");
                break;
            }
            frame = feed.next_frame() => {
                frames += 1;
                if frames % LOG_EVERY_FRAMES != 0 {
                    continue;
                }
                match frame.placement {
                    Some(placement) => tracing::info!(
                        status = %frame.status,
                        distance = %placement.label(),
                        x = placement.position.x,
                        y = placement.position.y,
                        z = placement.position.z,
                        "Tracking"
                    ),
                    None => tracing::info!(state = %frame.state, status = %frame.status, "Waiting"),
                }
                if let Some(error) = frame.error_message {
                    tracing::error!(%error, "Session failed, press Ctrl-C to exit");
                }
            }
        }
    }

    coordinator.stop()?;
    coordinator.shutdown().await;
    tracing::info!("Locator stopped");
    Ok(())
}

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use ringlink::{ChangeCause, ConnectionState, Result, RingDevice};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💍 ringlink live monitor");

    let device = RingDevice::new().await?;
    if !device.request_permissions().await {
        error!("❌ Bluetooth is unavailable or permission was denied");
        return Ok(());
    }

    info!("Searching for rings...");
    let rings = device.discover().await?;
    let Some(ring) = rings.first() else {
        warn!("No ring found. Make sure it is charged and close by.");
        return Ok(());
    };
    info!(
        "Found {} ring(s); using {} ({} dBm)",
        rings.len(),
        ring.name.as_deref().unwrap_or("unnamed"),
        ring.rssi
    );

    let _link_watch = device.on_connection_change(|change| match (change.state, change.cause) {
        (ConnectionState::Disconnected, ChangeCause::LinkLost) => {
            warn!("❌ Link to {} lost", change.device_id);
        }
        (state, cause) => info!("Connection {}: {state} ({cause:?})", change.device_id),
    });

    if let Err(e) = device.connect(&ring.id).await {
        error!("❌ Failed to connect: {e}");
        if let Some(hint) = e.user_guidance() {
            println!("{hint}");
        }
        return Err(e);
    }

    let mut samples = device.subscribe_samples();
    let report = device.start_live_monitoring().await?;
    if !report.is_complete() {
        warn!("{} of the arming commands failed", report.failed);
    }

    info!("📊 Streaming telemetry. Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = samples.recv() => match received {
                Ok(sample) => println!("{}", sample.value),
                Err(RecvError::Lagged(missed)) => warn!("Skipped {missed} samples"),
                Err(RecvError::Closed) => break,
            },
        }

        if !device.is_connected() {
            break;
        }
    }

    info!("🔌 Disconnecting...");
    device.disconnect().await;
    info!("✅ Done");

    Ok(())
}

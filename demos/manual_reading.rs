use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};
use ringlink::{DeviceId, Result, RingDevice, TelemetryValue};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("💍 ringlink manual reading");

    let device = RingDevice::new().await?;

    // Use the identifier given on the command line, otherwise the strongest ring nearby
    let id = match std::env::args().nth(1) {
        Some(id) => DeviceId::new(id),
        None => match device.discover().await?.into_iter().next() {
            Some(ring) => ring.id,
            None => {
                warn!("No ring found");
                return Ok(());
            }
        },
    };

    if let Err(e) = device.connect(&id).await {
        error!("❌ Failed to connect to {id}: {e}");
        return Err(e);
    }

    match device.read_battery().await {
        Ok(percent) => info!("🔋 Battery: {percent}%"),
        Err(e) => warn!("Battery level unavailable: {e}"),
    }

    let mut samples = device.subscribe_samples();
    let report = device.trigger_manual_scan().await?;
    info!(
        "Measurement requested ({} commands accepted). Keep the ring on your finger...",
        report.sent
    );

    let mut heart_rate = None;
    let mut blood_oxygen = None;
    let waited = timeout(Duration::from_secs(45), async {
        while heart_rate.is_none() || blood_oxygen.is_none() {
            let Ok(sample) = samples.recv().await else {
                break;
            };
            match sample.value {
                TelemetryValue::HeartRate { bpm } => heart_rate = Some(bpm),
                TelemetryValue::BloodOxygen { percent } => blood_oxygen = Some(percent),
                other => info!("{other}"),
            }
        }
    })
    .await;

    if waited.is_err() {
        warn!("Timed out waiting for a complete reading");
    }
    if let Some(bpm) = heart_rate {
        println!("❤️  Heart rate: {bpm} bpm");
    }
    if let Some(percent) = blood_oxygen {
        println!("🩸 Blood oxygen: {percent}%");
    }

    device.disconnect().await;
    Ok(())
}

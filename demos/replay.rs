use std::time::{Duration, Instant};

use ftms_fit_bridge::{
    pipeline, protocol, BridgeError, FrameKind, Inbound, MachineClass, MetricSample,
    PipelineConfig, PipelineEvent, Result, WorkoutPipeline,
};
use tracing::{error, info, warn};

/// Power, cadence and heart rate of the synthetic ride at `second`
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn ride_at(second: u64) -> (i16, f64, u16) {
    let wobble = ((second as f64) / 20.0).sin();
    match second {
        // easy spin
        0..=419 => (120, 75.0, 105 + u16::try_from(second / 20).unwrap_or(0)),
        // main set
        420..=1899 => (215 + (wobble * 25.0) as i16, 88.0 + wobble * 4.0, 148),
        _ => (80, 65.0, 125),
    }
}

#[tokio::main]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let output = args.next().unwrap_or_else(|| "replay.fit".to_string());
    let config = match args.next() {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };

    let identity = ftms_fit_bridge::identify(Some("Rogue Echo Bike"), MachineClass::Bike);
    info!(
        "🚴 Replaying a synthetic ride as {} (product {})",
        identity.product_name, identity.product
    );

    let handle = pipeline::spawn(WorkoutPipeline::new(config, identity)?);
    let pipeline::PipelineHandle {
        sender,
        mut events,
        task,
    } = handle;

    // The frames are replayed faster than real time; only their timestamps matter
    let start = Instant::now();
    let ride_secs = 2100;
    let mut distance = 0.0;
    for second in 0..ride_secs {
        let at = start + Duration::from_secs(second);
        let (power, cadence, bpm) = ride_at(second);

        if second % 2 == 0 {
            sender
                .send(Inbound::Frame {
                    kind: FrameKind::HeartRateMeasurement,
                    data: protocol::encode_heart_rate(bpm),
                    at,
                })
                .map_err(|_| BridgeError::ChannelClosed)?;
        }

        // a flaky link drops one frame in every 500
        if second % 500 == 499 {
            sender
                .send(Inbound::TransportGap { missed: 1 })
                .map_err(|_| BridgeError::ChannelClosed)?;
            continue;
        }

        let speed_kmh = 8.0 + f64::from(power.max(0)).sqrt() * 1.6;
        distance += speed_kmh / 3.6;
        let mut sample = MetricSample::new(MachineClass::Bike, at);
        sample.set_speed(Some(speed_kmh));
        sample.cadence = Some((cadence * 2.0).round() / 2.0);
        sample.instantaneous_power = Some(power);
        sample.total_distance = Some(distance as u32);
        sample.total_energy = u16::try_from(second / 60 * 12).ok();
        sender
            .send(Inbound::Frame {
                kind: FrameKind::IndoorBikeData,
                data: protocol::encode_frame(&sample),
                at,
            })
            .map_err(|_| BridgeError::ChannelClosed)?;
    }
    sender
        .send(Inbound::End { early: false })
        .map_err(|_| BridgeError::ChannelClosed)?;

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::PhaseChanged(transition) => {
                info!("⏱️  {} -> {} at {:?}", transition.from, transition.to, transition.at);
            }
            PipelineEvent::FrameDropped { kind, error } => warn!("Dropped {kind:?}: {error}"),
            PipelineEvent::SessionFinished(summary) => {
                println!("\n📊 Session Summary");
                println!("  Duration:      {:?}", summary.duration);
                println!("  Samples:       {}", summary.sample_count);
                println!("  Distance:      {:.0} m", summary.total_distance.unwrap_or(0.0));
                println!("  Avg power:     {:.1} W", summary.average_power.unwrap_or(0.0));
                println!("  Max power:     {:.0} W", summary.max_power.unwrap_or(0.0));
                println!("  Avg HR:        {:.0} bpm", summary.average_heart_rate.unwrap_or(0.0));
                for phase in &summary.phases {
                    println!(
                        "  {:<10} from {:>5}s for {:>5}s, {:.0} W",
                        phase.phase.to_string(),
                        phase.start_offset.as_secs(),
                        phase.duration.as_secs(),
                        phase.average_power.unwrap_or(0.0)
                    );
                }
            }
            PipelineEvent::Exported(activity) => {
                activity.save(&output)?;
                info!(
                    "✅ Wrote {} ({} bytes, {} records)",
                    output,
                    activity.bytes.len(),
                    activity.record_count
                );
                for warning in &activity.report.warnings {
                    warn!("⚠️  {warning}");
                }
            }
            PipelineEvent::ExportFailed(e) => {
                error!("❌ Export failed: {e}");
                return Err(e);
            }
            PipelineEvent::Sample(_) => {}
        }
    }

    let stats = task.await.map_err(|_| BridgeError::ChannelClosed)?;
    info!(
        "Validator: {} samples, {} corrected, {} interpolated",
        stats.total, stats.outliers_corrected, stats.interpolated
    );
    Ok(())
}

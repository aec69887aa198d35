use anyhow::{Context, Result};
use dalyble_lib::{Monitor, SessionEvent, SessionPhase};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::{commandline, mqtt};

/// Consume the session's event stream until ctrl-c or a terminal session
/// error, forwarding each reading to the selected output.
pub async fn run(monitor: Monitor, output: commandline::DaemonOutput) -> Result<()> {
    info!("Starting daemon mode: output={output:?}");

    let mut publisher: Option<mqtt::MqttPublisher> = None;
    if let commandline::DaemonOutput::Mqtt { config_file } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        publisher =
            Some(mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?);
    }

    let mut events = monitor.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received ctrl-c, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Reading(reading)) => {
                    let payload = serde_json::to_string(&reading)
                        .with_context(|| "Failed to serialize reading")?;
                    match &publisher {
                        Some(publisher) => {
                            if let Err(err) = publisher.publish(publisher.topic(), &payload).await {
                                error!("Failed to publish reading: {err:?}");
                            }
                        }
                        None => println!("{payload}"),
                    }
                }
                Ok(SessionEvent::PhaseChanged(status)) => {
                    info!(
                        "Session phase: {:?} (reads={} errors={})",
                        status.phase, status.read_count, status.error_count
                    );
                    if status.phase == SessionPhase::Error {
                        warn!("Session entered terminal error state");
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Event consumer lagged, {missed} events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let stats = monitor.stats();
    info!(
        "Session finished: {} reads, {} errors, {:.1}% success",
        stats.read_count,
        stats.error_count,
        stats.success_rate()
    );
    monitor.shutdown().await?;
    Ok(())
}

// RTK Sensor Fleet - Main Entry Point

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use rtk_fleet::config::{parse_sensor_spec, Config};
use rtk_fleet::fleet::{FleetConfig, SensorFleet};
use rtk_fleet::net::ntrip::NtripClient;
use rtk_fleet::supervisor::ChannelPorts;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    init_logging(config.verbose);

    info!("Starting RTK sensor fleet");

    let fleet_config = FleetConfig {
        ports: ChannelPorts {
            power: config.power_port,
            gps: config.gps_port,
        },
        ..FleetConfig::default()
    };
    let fleet = Arc::new(SensorFleet::new(fleet_config));

    if config.sensors.is_empty() {
        warn!("No sensors configured! Use --sensor IP[=LABEL]");
    }
    for spec in &config.sensors {
        match parse_sensor_spec(spec) {
            Ok((addr, label)) => {
                fleet.add_sensor(addr, label).await;
            }
            Err(e) => {
                error!("Skipping sensor argument: {}", e);
            }
        }
    }

    // One handshake attempt; a refusal leaves the fleet on plain GPS
    let ntrip_session = match &config.ntrip_host {
        Some(host) => {
            let client = NtripClient::new(
                host.clone(),
                config.ntrip_port,
                config.ntrip_user.clone(),
                config.ntrip_password.clone(),
                config.ntrip_mount.clone(),
            );
            match client.connect().await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("NTRIP connection failed, continuing without RTK: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    fleet.start(ntrip_session).await;

    if let Some(path) = config.state_file.clone() {
        fleet
            .start_state_writer(
                path,
                Duration::from_secs(rtk_fleet::constants::STATE_WRITE_PERIOD_SECS),
            )
            .await;
    }

    info!("Fleet running");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal (Ctrl+C)");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            return Err(err.into());
        }
    }

    info!("Shutting down...");
    fleet.stop().await;

    let remaining = fleet.snapshot().await.len();
    info!("Fleet stopped. Final sensor count: {}", remaining);

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_span_events(FmtSpan::NONE);

    if verbose {
        subscriber.with_max_level(tracing::Level::DEBUG).init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber.with_max_level(tracing::Level::INFO).init();
    }
}

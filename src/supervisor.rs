// Reconnection supervisor
// Periodically scans the registry and restarts any channel that is absent
// or closed, honoring a per-(sensor, channel) back-off

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info};

use crate::net::channel;
use crate::registry::{ChannelKind, SensorRegistry};

/// Ports the two channel kinds connect to on every sensor.
#[derive(Debug, Clone, Copy)]
pub struct ChannelPorts {
    pub power: u16,
    pub gps: u16,
}

impl Default for ChannelPorts {
    fn default() -> Self {
        ChannelPorts {
            power: crate::constants::POWER_PORT,
            gps: crate::constants::GPS_PORT,
        }
    }
}

/// Run the supervisor until the shutdown signal flips.
///
/// Each tick claims attempts through the registry, which enforces both the
/// back-off and the one-connection-per-channel invariant; the supervisor
/// itself only spawns tasks for the claims it wins. The first tick performs
/// the initial connections for sensors added before start.
pub async fn run_supervisor(
    registry: Arc<SensorRegistry>,
    ports: ChannelPorts,
    period: Duration,
    backoff: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Reconnection supervisor running (period {:?}, back-off {:?})",
        period, backoff
    );
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                scan(&registry, ports, backoff).await;
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown
                if changed.is_err() || *shutdown.borrow() {
                    info!("Reconnection supervisor stopping");
                    return;
                }
            }
        }
    }
}

/// One scan pass: the two channels of each sensor are considered
/// independently, so a failing power channel never delays GPS retries.
async fn scan(registry: &Arc<SensorRegistry>, ports: ChannelPorts, backoff: Duration) {
    for addr in registry.addrs().await {
        if let Some((cancel, seq)) = registry
            .begin_attempt(addr, ChannelKind::Power, backoff)
            .await
        {
            debug!("Starting power channel for {}", addr);
            tokio::spawn(channel::run_power_channel(
                registry.clone(),
                addr,
                ports.power,
                cancel,
                seq,
            ));
        }
        if let Some((cancel, seq)) = registry
            .begin_attempt(addr, ChannelKind::Gps, backoff)
            .await
        {
            debug!("Starting GPS channel for {}", addr);
            tokio::spawn(channel::run_gps_channel(
                registry.clone(),
                addr,
                ports.gps,
                cancel,
                seq,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_supervisor_waits_out_backoff() {
        // A port with nothing listening: every attempt fails fast
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        let registry = Arc::new(SensorRegistry::new());
        registry.add_sensor(addr, None).await;

        let ports = ChannelPorts { power: port, gps: port };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_supervisor(
            registry.clone(),
            ports,
            Duration::from_millis(10),
            Duration::from_secs(60),
            shutdown_rx,
        ));

        // Give the supervisor several ticks
        time::sleep(Duration::from_millis(200)).await;
        let first = registry
            .last_attempt(addr, ChannelKind::Power)
            .await
            .expect("an attempt was made");

        // Despite the channel staying disconnected on every tick, no second
        // attempt may start inside the back-off window
        time::sleep(Duration::from_millis(200)).await;
        let second = registry.last_attempt(addr, ChannelKind::Power).await.unwrap();
        assert_eq!(first, second);

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_supervisor_retries_after_backoff() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let addr: IpAddr = "127.0.0.1".parse().unwrap();

        let registry = Arc::new(SensorRegistry::new());
        registry.add_sensor(addr, None).await;

        let ports = ChannelPorts { power: port, gps: port };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_supervisor(
            registry.clone(),
            ports,
            Duration::from_millis(10),
            Duration::from_millis(50),
            shutdown_rx,
        ));

        time::sleep(Duration::from_millis(100)).await;
        let first = registry
            .last_attempt(addr, ChannelKind::Gps)
            .await
            .expect("an attempt was made");

        // After the back-off a fresh attempt must be stamped
        time::sleep(Duration::from_millis(300)).await;
        let later = registry.last_attempt(addr, ChannelKind::Gps).await.unwrap();
        assert!(later > first);

        shutdown_tx.send(true).unwrap();
        time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }
}

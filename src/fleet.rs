// Fleet lifecycle
// Glues registry, supervisor, and relay together behind start()/stop()

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::net::ntrip::NtripSession;
use crate::registry::{SensorRegistry, SensorSnapshot};
use crate::relay;
use crate::supervisor::{self, ChannelPorts};

/// Timing and port knobs for one fleet. Defaults are the domain values;
/// tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct FleetConfig {
    pub ports: ChannelPorts,
    pub supervisor_period: Duration,
    pub retry_backoff: Duration,
    pub relay_period: Duration,
    pub relay_cooldown: Duration,
    pub relay_write_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            ports: ChannelPorts::default(),
            supervisor_period: Duration::from_secs(crate::constants::SUPERVISOR_PERIOD_SECS),
            retry_backoff: Duration::from_secs(crate::constants::RETRY_BACKOFF_SECS),
            relay_period: Duration::from_secs(crate::constants::RELAY_PERIOD_SECS),
            relay_cooldown: Duration::from_secs(crate::constants::RELAY_COOLDOWN_SECS),
            relay_write_timeout: Duration::from_secs(crate::constants::RELAY_WRITE_TIMEOUT_SECS),
        }
    }
}

/// A running sensor fleet.
///
/// Owns the shutdown signal and the supervisor/relay task handles; channel
/// tasks are owned by their sensor records and cancelled through the
/// registry.
pub struct SensorFleet {
    config: FleetConfig,
    registry: Arc<SensorRegistry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SensorFleet {
    pub fn new(config: FleetConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        SensorFleet {
            config,
            registry: Arc::new(SensorRegistry::new()),
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Shared registry handle for readers and event subscribers.
    pub fn registry(&self) -> Arc<SensorRegistry> {
        self.registry.clone()
    }

    /// Add a sensor; connections begin on the supervisor's next tick.
    pub async fn add_sensor(&self, addr: IpAddr, label: Option<String>) -> bool {
        self.registry.add_sensor(addr, label).await
    }

    /// Remove a sensor and tear down both of its channels.
    pub async fn remove_sensor(&self, addr: IpAddr) {
        self.registry.remove_sensor(addr).await;
    }

    /// Read-only view of the whole fleet.
    pub async fn snapshot(&self) -> Vec<SensorSnapshot> {
        self.registry.snapshot().await
    }

    /// Start the supervisor, and the correction relay when a caster session
    /// is available. Without a session the fleet still does plain GPS
    /// tracking.
    pub async fn start(&self, ntrip: Option<NtripSession>) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(supervisor::run_supervisor(
            self.registry.clone(),
            self.config.ports,
            self.config.supervisor_period,
            self.config.retry_backoff,
            self.shutdown_rx.clone(),
        )));

        match ntrip {
            Some(session) => {
                tasks.push(tokio::spawn(relay::run_relay(
                    self.registry.clone(),
                    session,
                    self.config.relay_period,
                    self.config.relay_cooldown,
                    self.config.relay_write_timeout,
                    self.shutdown_rx.clone(),
                )));
            }
            None => info!("No correction session; running without RTK"),
        }
    }

    /// Periodically dump the registry snapshot as JSON for external
    /// consumers. Stops on the shutdown watch and is joined by `stop()`
    /// like the supervisor and relay.
    pub async fn start_state_writer(&self, path: PathBuf, period: Duration) {
        let registry = self.registry.clone();
        let mut shutdown = self.shutdown_rx.clone();
        self.tasks.lock().await.push(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        write_state(&registry, &path).await;
                    }
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }));
    }

    /// Signal shutdown, cancel every channel task, and join the long-running
    /// tasks with a bounded timeout.
    pub async fn stop(&self) {
        info!("Stopping fleet");
        let _ = self.shutdown_tx.send(true);
        self.registry.cancel_all().await;

        let join_bound = Duration::from_secs(crate::constants::SHUTDOWN_JOIN_SECS);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if time::timeout(join_bound, task).await.is_err() {
                warn!("Task did not stop within {:?}", join_bound);
            }
        }
    }
}

async fn write_state(registry: &Arc<SensorRegistry>, path: &Path) {
    let snapshot = registry.snapshot().await;
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => {
            if let Err(e) = tokio::fs::write(path, json).await {
                warn!("Failed to write state file {}: {}", path.display(), e);
            }
        }
        Err(e) => warn!("Failed to serialize state: {}", e),
    }
}

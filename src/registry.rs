// Sensor registry - shared state for all channel tasks, the supervisor,
// the relay, and external readers

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::codec::nmea::FixStatus;

/// Capacity of the outbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Tri-state power knowledge for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

/// The two logical channels every sensor exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Power,
    Gps,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Power => write!(f, "power"),
            ChannelKind::Gps => write!(f, "gps"),
        }
    }
}

/// Lifecycle of one (sensor, channel-kind) socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Decimal-degree position. Longitude first, matching the wire event order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub longitude: f64,
    pub latitude: f64,
}

/// Read-only view of one sensor for external consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub addr: IpAddr,
    pub label: String,
    pub power: PowerState,
    pub position: Option<Position>,
    pub fix: FixStatus,
    pub power_channel: ChannelState,
    pub gps_channel: ChannelState,
}

/// Events pushed to registry subscribers.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    SensorConnected { addr: IpAddr, label: String },
    PowerChanged { addr: IpAddr, power: PowerState },
    PositionUpdated { addr: IpAddr, position: Position },
    SensorRemoved { addr: IpAddr },
}

/// Shared handle to a GPS socket's write half, for correction broadcast.
pub type GpsWriter = Arc<Mutex<OwnedWriteHalf>>;

/// One channel's supervision bookkeeping.
#[derive(Debug)]
struct ChannelRuntime {
    state: ChannelState,
    /// Timestamp of the last connection attempt; the sole input to back-off.
    last_attempt: Option<Instant>,
    /// Increments per attempt so a cancelled task cannot clobber its
    /// successor's state.
    attempt_seq: u64,
}

impl ChannelRuntime {
    fn new() -> Self {
        ChannelRuntime {
            state: ChannelState::Idle,
            last_attempt: None,
            attempt_seq: 0,
        }
    }

    fn connectable(&self) -> bool {
        matches!(self.state, ChannelState::Idle | ChannelState::Closed)
    }
}

struct SensorEntry {
    label: String,
    power: PowerState,
    position: Option<Position>,
    fix: FixStatus,
    last_sentence: Option<String>,
    power_channel: ChannelRuntime,
    gps_channel: ChannelRuntime,
    gps_writer: Option<GpsWriter>,
    /// Flipped to true (or dropped with the entry) to cancel both channel tasks.
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl SensorEntry {
    fn new(label: String) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        SensorEntry {
            label,
            power: PowerState::Unknown,
            position: None,
            fix: FixStatus::None,
            last_sentence: None,
            power_channel: ChannelRuntime::new(),
            gps_channel: ChannelRuntime::new(),
            gps_writer: None,
            cancel_tx,
            cancel_rx,
        }
    }

    fn channel(&self, kind: ChannelKind) -> &ChannelRuntime {
        match kind {
            ChannelKind::Power => &self.power_channel,
            ChannelKind::Gps => &self.gps_channel,
        }
    }

    fn channel_mut(&mut self, kind: ChannelKind) -> &mut ChannelRuntime {
        match kind {
            ChannelKind::Power => &mut self.power_channel,
            ChannelKind::Gps => &mut self.gps_channel,
        }
    }
}

/// The set of known sensors and their latest observed state.
///
/// Owns all sensor records exclusively; channel tasks, the supervisor, and
/// external readers go through this type. Mutation is serialized by the inner
/// RwLock, and update methods for an address that has been removed are silent
/// no-ops, so a cancelled task cannot write past its sensor's removal.
pub struct SensorRegistry {
    sensors: RwLock<HashMap<IpAddr, SensorEntry>>,
    /// Last raw sentence seen on any GPS channel, last-write-wins. Read by
    /// the correction relay each cycle.
    latest_sentence: RwLock<Option<String>>,
    events: broadcast::Sender<SensorEvent>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        SensorRegistry {
            sensors: RwLock::new(HashMap::new()),
            latest_sentence: RwLock::new(None),
            events,
        }
    }

    /// Subscribe to sensor events. Decided at construction time; there is no
    /// runtime-mutable callback surface.
    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SensorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Add a sensor. Returns false (and warns) if the address already exists.
    /// With no label given, one is generated as `ch{max numeric suffix + 1}`.
    pub async fn add_sensor(&self, addr: IpAddr, label: Option<String>) -> bool {
        let mut sensors = self.sensors.write().await;
        if sensors.contains_key(&addr) {
            warn!("Sensor {} already exists, ignoring add", addr);
            return false;
        }
        let label = match label {
            Some(l) if !l.is_empty() => l,
            _ => {
                let max = sensors
                    .values()
                    .filter_map(|e| e.label.strip_prefix("ch"))
                    .filter_map(|suffix| suffix.parse::<u32>().ok())
                    .max()
                    .unwrap_or(0);
                format!("ch{}", max + 1)
            }
        };
        info!("Adding sensor {} ({})", addr, label);
        sensors.insert(addr, SensorEntry::new(label));
        true
    }

    /// Remove a sensor, cancelling both of its channel tasks and discarding
    /// all derived state. Idempotent.
    pub async fn remove_sensor(&self, addr: IpAddr) {
        let removed = self.sensors.write().await.remove(&addr);
        if let Some(entry) = removed {
            info!("Removing sensor {} ({})", addr, entry.label);
            // Wake both channel tasks; dropping the entry also drops the
            // watch sender, either of which unblocks them.
            let _ = entry.cancel_tx.send(true);
            self.emit(SensorEvent::SensorRemoved { addr });
        }
    }

    /// Addresses of all known sensors.
    pub async fn addrs(&self) -> Vec<IpAddr> {
        self.sensors.read().await.keys().copied().collect()
    }

    pub async fn contains(&self, addr: IpAddr) -> bool {
        self.sensors.read().await.contains_key(&addr)
    }

    /// Consistent read-only view of every sensor's current state.
    pub async fn snapshot(&self) -> Vec<SensorSnapshot> {
        let sensors = self.sensors.read().await;
        let mut out: Vec<SensorSnapshot> = sensors
            .iter()
            .map(|(&addr, e)| SensorSnapshot {
                addr,
                label: e.label.clone(),
                power: e.power,
                position: e.position,
                fix: e.fix,
                power_channel: e.power_channel.state,
                gps_channel: e.gps_channel.state,
            })
            .collect();
        out.sort_by_key(|s| s.addr);
        out
    }

    // --- supervision ---

    /// Atomically claim a connection attempt for (addr, kind).
    ///
    /// Succeeds only when the channel is Idle or Closed and the back-off
    /// since the last attempt has elapsed; the channel transitions to
    /// Connecting and the attempt timestamp is stamped. Returns the cancel
    /// receiver and the attempt sequence the task must present when it
    /// reports state changes. This check-and-set keeps the invariant of at
    /// most one live connection per (sensor, channel-kind).
    pub async fn begin_attempt(
        &self,
        addr: IpAddr,
        kind: ChannelKind,
        backoff: Duration,
    ) -> Option<(watch::Receiver<bool>, u64)> {
        let mut sensors = self.sensors.write().await;
        let entry = sensors.get_mut(&addr)?;
        let cancel = entry.cancel_rx.clone();
        let channel = entry.channel_mut(kind);
        if !channel.connectable() {
            return None;
        }
        if let Some(last) = channel.last_attempt {
            if last.elapsed() < backoff {
                return None;
            }
        }
        channel.state = ChannelState::Connecting;
        channel.last_attempt = Some(Instant::now());
        channel.attempt_seq += 1;
        Some((cancel, channel.attempt_seq))
    }

    /// Timestamp of the last connection attempt for (addr, kind).
    pub async fn last_attempt(&self, addr: IpAddr, kind: ChannelKind) -> Option<Instant> {
        let sensors = self.sensors.read().await;
        sensors.get(&addr).and_then(|e| e.channel(kind).last_attempt)
    }

    pub async fn channel_state(&self, addr: IpAddr, kind: ChannelKind) -> Option<ChannelState> {
        let sensors = self.sensors.read().await;
        sensors.get(&addr).map(|e| e.channel(kind).state)
    }

    /// Mark a power channel as connected. Ignored when `seq` is stale.
    pub async fn power_channel_connected(&self, addr: IpAddr, seq: u64) {
        let mut sensors = self.sensors.write().await;
        if let Some(entry) = sensors.get_mut(&addr) {
            let channel = entry.channel_mut(ChannelKind::Power);
            if channel.attempt_seq == seq {
                channel.state = ChannelState::Connected;
            }
        }
    }

    /// Mark a GPS channel as connected and register its write half for the
    /// correction broadcast. Ignored when `seq` is stale. Emits
    /// `SensorConnected`.
    pub async fn gps_channel_connected(&self, addr: IpAddr, seq: u64, writer: GpsWriter) {
        let label = {
            let mut sensors = self.sensors.write().await;
            let entry = match sensors.get_mut(&addr) {
                Some(e) => e,
                None => return,
            };
            let channel = entry.channel_mut(ChannelKind::Gps);
            if channel.attempt_seq != seq {
                return;
            }
            channel.state = ChannelState::Connected;
            entry.gps_writer = Some(writer);
            entry.label.clone()
        };
        self.emit(SensorEvent::SensorConnected { addr, label });
    }

    /// Mark a channel as closed. Ignored when `seq` is stale; a GPS close
    /// also drops the registered write half.
    pub async fn channel_closed(&self, addr: IpAddr, kind: ChannelKind, seq: u64) {
        let mut sensors = self.sensors.write().await;
        if let Some(entry) = sensors.get_mut(&addr) {
            let channel = entry.channel_mut(kind);
            if channel.attempt_seq != seq {
                return;
            }
            channel.state = ChannelState::Closed;
            if kind == ChannelKind::Gps {
                entry.gps_writer = None;
            }
        }
    }

    /// Write halves of every currently connected GPS channel.
    pub async fn gps_writers(&self) -> Vec<(IpAddr, GpsWriter)> {
        let sensors = self.sensors.read().await;
        sensors
            .iter()
            .filter(|(_, e)| e.gps_channel.state == ChannelState::Connected)
            .filter_map(|(&addr, e)| e.gps_writer.clone().map(|w| (addr, w)))
            .collect()
    }

    /// Cancel every sensor's channel tasks (fleet shutdown).
    pub async fn cancel_all(&self) {
        let sensors = self.sensors.read().await;
        for entry in sensors.values() {
            let _ = entry.cancel_tx.send(true);
        }
    }

    // --- updates, invoked only by the owning channel task ---

    /// Record a decoded power state. No-op once the sensor is removed.
    pub async fn set_power(&self, addr: IpAddr, power: PowerState) {
        let updated = {
            let mut sensors = self.sensors.write().await;
            match sensors.get_mut(&addr) {
                Some(entry) => {
                    entry.power = power;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(SensorEvent::PowerChanged { addr, power });
        }
    }

    /// Record a decoded position and its RTK fix status. No-op once the
    /// sensor is removed. The fix status is last-known: it persists across
    /// disconnects until a fresh fix replaces it.
    pub async fn set_position(&self, addr: IpAddr, position: Position, fix: FixStatus) {
        let updated = {
            let mut sensors = self.sensors.write().await;
            match sensors.get_mut(&addr) {
                Some(entry) => {
                    entry.position = Some(position);
                    entry.fix = fix;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.emit(SensorEvent::PositionUpdated { addr, position });
        }
    }

    /// Record a raw sentence, both per-sensor and in the registry-wide
    /// latest-sentence slot the relay reads. Every sentence type counts.
    pub async fn record_sentence(&self, addr: IpAddr, sentence: &str) {
        {
            let mut sensors = self.sensors.write().await;
            match sensors.get_mut(&addr) {
                Some(entry) => entry.last_sentence = Some(sentence.to_string()),
                None => return,
            }
        }
        *self.latest_sentence.write().await = Some(sentence.to_string());
    }

    /// Most recent raw sentence across all sensors, if any.
    pub async fn latest_sentence(&self) -> Option<String> {
        self.latest_sentence.read().await.clone()
    }

    /// Most recent raw sentence for one sensor.
    pub async fn last_sentence(&self, addr: IpAddr) -> Option<String> {
        let sensors = self.sensors.read().await;
        sensors.get(&addr).and_then(|e| e.last_sentence.clone())
    }
}

impl Default for SensorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[tokio::test]
    async fn test_add_and_duplicate() {
        let reg = SensorRegistry::new();
        assert!(reg.add_sensor(addr(1), Some("north".into())).await);
        assert!(!reg.add_sensor(addr(1), Some("other".into())).await);

        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].label, "north");
        assert_eq!(snap[0].power, PowerState::Unknown);
        assert_eq!(snap[0].fix, crate::codec::nmea::FixStatus::None);
    }

    #[tokio::test]
    async fn test_auto_label() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;
        reg.add_sensor(addr(2), Some("ch7".into())).await;
        reg.add_sensor(addr(3), None).await;

        let snap = reg.snapshot().await;
        let labels: Vec<&str> = snap.iter().map(|s| s.label.as_str()).collect();
        assert!(labels.contains(&"ch1"));
        assert!(labels.contains(&"ch7"));
        assert!(labels.contains(&"ch8"));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_discards_state() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;
        reg.set_power(addr(1), PowerState::On).await;

        reg.remove_sensor(addr(1)).await;
        reg.remove_sensor(addr(1)).await;
        assert!(reg.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_updates_after_remove_are_noops() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;
        reg.remove_sensor(addr(1)).await;

        reg.set_power(addr(1), PowerState::On).await;
        reg.set_position(
            addr(1),
            Position { longitude: 127.0, latitude: 37.6 },
            crate::codec::nmea::FixStatus::Fixed,
        )
        .await;
        reg.record_sentence(addr(1), "$GPGGA,1").await;

        assert!(reg.snapshot().await.is_empty());
        assert!(reg.latest_sentence().await.is_none());
    }

    #[tokio::test]
    async fn test_begin_attempt_respects_backoff() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;

        let first = reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::from_secs(60))
            .await;
        assert!(first.is_some());

        // Connecting: no concurrent second attempt
        assert!(reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::ZERO)
            .await
            .is_none());

        let (_, seq) = first.unwrap();
        reg.channel_closed(addr(1), ChannelKind::Power, seq).await;

        // Closed but within back-off
        assert!(reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::from_secs(60))
            .await
            .is_none());
        // Closed and back-off elapsed
        assert!(reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::ZERO)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_channels_back_off_independently() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;

        assert!(reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::from_secs(60))
            .await
            .is_some());
        // The held power attempt does not block the GPS channel
        assert!(reg
            .begin_attempt(addr(1), ChannelKind::Gps, Duration::from_secs(60))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_stale_seq_cannot_close_successor() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;

        let (_, seq1) = reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::ZERO)
            .await
            .unwrap();
        reg.channel_closed(addr(1), ChannelKind::Power, seq1).await;

        let (_, seq2) = reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::ZERO)
            .await
            .unwrap();
        reg.power_channel_connected(addr(1), seq2).await;

        // The earlier attempt reporting late must not demote the live one
        reg.channel_closed(addr(1), ChannelKind::Power, seq1).await;
        assert_eq!(
            reg.channel_state(addr(1), ChannelKind::Power).await,
            Some(ChannelState::Connected)
        );
    }

    #[tokio::test]
    async fn test_power_event_emitted() {
        let reg = SensorRegistry::new();
        let mut events = reg.subscribe();
        reg.add_sensor(addr(1), None).await;
        reg.set_power(addr(1), PowerState::On).await;

        match events.recv().await.unwrap() {
            SensorEvent::PowerChanged { addr: a, power } => {
                assert_eq!(a, addr(1));
                assert_eq!(power, PowerState::On);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_latest_sentence_last_write_wins() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;
        reg.add_sensor(addr(2), None).await;

        reg.record_sentence(addr(1), "$GPGGA,first").await;
        reg.record_sentence(addr(2), "$GPGGA,second").await;
        assert_eq!(
            reg.latest_sentence().await.as_deref(),
            Some("$GPGGA,second")
        );
        // Per-sensor history is kept alongside the shared slot
        assert_eq!(
            reg.last_sentence(addr(1)).await.as_deref(),
            Some("$GPGGA,first")
        );
    }

    #[tokio::test]
    async fn test_remove_cancels_channel_tasks() {
        let reg = SensorRegistry::new();
        reg.add_sensor(addr(1), None).await;
        let (mut cancel, _) = reg
            .begin_attempt(addr(1), ChannelKind::Power, Duration::ZERO)
            .await
            .unwrap();

        reg.remove_sensor(addr(1)).await;
        // Either the true value or the dropped sender wakes the task
        assert!(cancel.changed().await.is_ok() || cancel.has_changed().is_err());
        assert!(*cancel.borrow());
    }
}

// Shared domain constants for the sensor fleet

/// TCP port of a sensor's power-status channel.
pub const POWER_PORT: u16 = 23;

/// TCP port of a sensor's GPS/NMEA channel.
pub const GPS_PORT: u16 = 24;

/// Default NTRIP caster port.
pub const NTRIP_PORT: u16 = 2101;

/// Socket connect timeout (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Per-read timeout on channel sockets (seconds). A timed-out read is a
/// poll-cycle boundary, not an error.
pub const READ_TIMEOUT_SECS: u64 = 5;

/// Maximum length of the greeting a sensor sends right after accept.
pub const GREETING_LEN: usize = 20;

/// Reconnection supervisor scan period (seconds).
pub const SUPERVISOR_PERIOD_SECS: u64 = 1;

/// Minimum interval between connection attempts per (sensor, channel) pair (seconds).
pub const RETRY_BACKOFF_SECS: u64 = 5;

/// Correction relay cadence (seconds).
pub const RELAY_PERIOD_SECS: u64 = 1;

/// Cooldown after a failed relay iteration (seconds).
pub const RELAY_COOLDOWN_SECS: u64 = 5;

/// Bound on one correction write to a GPS socket (seconds). A peer that
/// stops draining must not stall the broadcast to the others.
pub const RELAY_WRITE_TIMEOUT_SECS: u64 = 5;

/// Cadence of the JSON state-file dump (seconds).
pub const STATE_WRITE_PERIOD_SECS: u64 = 1;

/// Read buffer for one RTCM correction chunk from the caster.
pub const CORRECTION_BUF_LEN: usize = 8192;

/// Read buffer for the caster's handshake response.
pub const NTRIP_RESPONSE_BUF_LEN: usize = 4096;

/// Start-of-frame marker on the power-status channel.
pub const POWER_STX: u8 = 0x02;

/// Opaque trailing bytes after the power payload, discarded unexamined.
pub const POWER_TRAILER_LEN: usize = 3;

/// Guard against runaway NMEA sentences (bytes, including the `$`).
pub const MAX_SENTENCE_LEN: usize = 1024;

/// Bound on joining the supervisor/relay tasks during shutdown (seconds).
pub const SHUTDOWN_JOIN_SECS: u64 = 2;

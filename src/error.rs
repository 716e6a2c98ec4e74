// Error types for the sensor fleet

use std::time::Duration;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Fleet error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket connect did not complete within the timeout
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Correction source answered the handshake with something other than success
    #[error("correction source rejected handshake: {0}")]
    HandshakeRejected(String),

    /// Correction source returned zero bytes; the session is broken
    #[error("correction stream closed by peer")]
    CorrectionStreamClosed,

    /// Sentence is not a GGA fix sentence
    #[error("not a GGA sentence: {0:?}")]
    NotGga(String),

    /// GGA sentence has too few comma-separated fields
    #[error("truncated GGA sentence: {0} fields")]
    TruncatedSentence(usize),

    /// Coordinate field did not parse as DDMM.MMMM
    #[error("bad coordinate field: {0:?}")]
    BadCoordinate(String),

    /// Fix quality field was not a number
    #[error("bad fix quality field: {0:?}")]
    BadFixQuality(String),

    /// Sensor argument was not `ip` or `ip=label`
    #[error("invalid sensor spec: {0:?}")]
    BadSensorSpec(String),
}

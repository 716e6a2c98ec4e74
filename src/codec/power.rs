// Power-status frame decoder
// Frame layout: STX 0x02, two ASCII payload bytes ("01" on / "00" off),
// three trailing bytes of unspecified format that are discarded unexamined.

use crate::constants::{POWER_STX, POWER_TRAILER_LEN};

/// Decoded power-status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    On,
    Off,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Scanning for the STX marker.
    Hunting,
    /// Collecting the 2-byte payload.
    Payload { bytes: [u8; 2], got: usize },
    /// Consuming the opaque trailer; `event` is None for unrecognized payloads.
    Trailer {
        remaining: usize,
        event: Option<PowerEvent>,
    },
}

/// Incremental decoder for the power-status byte stream.
///
/// Fed arbitrary slices as they arrive off the socket; partial frames pend
/// across calls, so short reads never lose framing.
#[derive(Debug)]
pub struct PowerFrameDecoder {
    state: DecodeState,
}

impl PowerFrameDecoder {
    pub fn new() -> Self {
        PowerFrameDecoder {
            state: DecodeState::Hunting,
        }
    }

    /// Feed raw bytes, returning every event completed by this chunk.
    ///
    /// Frames with an unrecognized payload are consumed whole (trailer
    /// included) and emit nothing.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<PowerEvent> {
        let mut events = Vec::new();
        for &b in bytes {
            if let Some(ev) = self.step(b) {
                events.push(ev);
            }
        }
        events
    }

    fn step(&mut self, byte: u8) -> Option<PowerEvent> {
        match self.state {
            DecodeState::Hunting => {
                if byte == POWER_STX {
                    self.state = DecodeState::Payload {
                        bytes: [0; 2],
                        got: 0,
                    };
                }
                None
            }
            DecodeState::Payload { mut bytes, got } => {
                bytes[got] = byte;
                if got + 1 < 2 {
                    self.state = DecodeState::Payload { bytes, got: got + 1 };
                    return None;
                }
                let event = match &bytes {
                    b"01" => Some(PowerEvent::On),
                    b"00" => Some(PowerEvent::Off),
                    _ => None,
                };
                self.state = DecodeState::Trailer {
                    remaining: POWER_TRAILER_LEN,
                    event,
                };
                None
            }
            DecodeState::Trailer { remaining, event } => {
                if remaining > 1 {
                    self.state = DecodeState::Trailer {
                        remaining: remaining - 1,
                        event,
                    };
                    return None;
                }
                self.state = DecodeState::Hunting;
                event
            }
        }
    }
}

impl Default for PowerFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// Channel connections
// One task per (sensor, channel-kind) socket: connect, greeting, read loop

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time;
use tracing::{debug, info, warn};

use crate::codec::nmea::{self, SentenceAccumulator};
use crate::codec::power::{PowerEvent, PowerFrameDecoder};
use crate::constants::{CONNECT_TIMEOUT_SECS, GREETING_LEN, READ_TIMEOUT_SECS};
use crate::error::Error;
use crate::registry::{ChannelKind, Position, PowerState, SensorRegistry};

/// Why the read loop ended.
enum LoopExit {
    /// Peer closed the connection cleanly.
    PeerClosed,
    /// I/O error other than a read timeout.
    IoError,
}

/// Run the power channel for one sensor until cancellation or socket death.
///
/// The task owns its socket: every exit path, including cancellation, drops
/// the stream and reports the channel closed with the attempt sequence it was
/// given, so a stale task can never clobber a successor's state.
pub async fn run_power_channel(
    registry: Arc<SensorRegistry>,
    addr: IpAddr,
    port: u16,
    mut cancel: watch::Receiver<bool>,
    seq: u64,
) {
    tokio::select! {
        _ = power_channel(&registry, addr, port, seq) => {}
        _ = cancelled(&mut cancel) => {
            debug!("Power channel {} cancelled", addr);
        }
    }
    registry.channel_closed(addr, ChannelKind::Power, seq).await;
}

/// Run the GPS channel for one sensor until cancellation or socket death.
pub async fn run_gps_channel(
    registry: Arc<SensorRegistry>,
    addr: IpAddr,
    port: u16,
    mut cancel: watch::Receiver<bool>,
    seq: u64,
) {
    tokio::select! {
        _ = gps_channel(&registry, addr, port, seq) => {}
        _ = cancelled(&mut cancel) => {
            debug!("GPS channel {} cancelled", addr);
        }
    }
    registry.channel_closed(addr, ChannelKind::Gps, seq).await;
}

/// Resolves when the sensor is removed or the fleet shuts down. A dropped
/// sender (entry removed from the registry) counts as cancellation.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

async fn power_channel(registry: &SensorRegistry, addr: IpAddr, port: u16, seq: u64) {
    let mut stream = match open_channel(addr, port).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Power channel {}:{} connect failed: {}", addr, port, e);
            return;
        }
    };
    info!("Power channel connected: {}:{}", addr, port);
    registry.power_channel_connected(addr, seq).await;

    let mut decoder = PowerFrameDecoder::new();
    let mut buf = [0u8; 256];
    let exit = loop {
        let n = match read_chunk(&mut stream, &mut buf).await {
            ReadOutcome::Data(n) => n,
            ReadOutcome::Timeout => continue,
            ReadOutcome::Eof => break LoopExit::PeerClosed,
            ReadOutcome::Error(e) => {
                warn!("Power channel {} read error: {}", addr, e);
                break LoopExit::IoError;
            }
        };
        for event in decoder.feed(&buf[..n]) {
            let power = match event {
                PowerEvent::On => PowerState::On,
                PowerEvent::Off => PowerState::Off,
            };
            debug!("Power {:?} from {}", power, addr);
            registry.set_power(addr, power).await;
        }
    };

    if matches!(exit, LoopExit::PeerClosed) {
        info!("Power channel closed by peer: {}", addr);
        // Loss of the channel means loss of knowledge, not a false OFF
        registry.set_power(addr, PowerState::Unknown).await;
    }
}

async fn gps_channel(registry: &SensorRegistry, addr: IpAddr, port: u16, seq: u64) {
    let stream = match open_channel(addr, port).await {
        Ok(s) => s,
        Err(e) => {
            warn!("GPS channel {}:{} connect failed: {}", addr, port, e);
            return;
        }
    };
    info!("GPS channel connected: {}:{}", addr, port);

    let (mut reader, writer) = stream.into_split();
    registry
        .gps_channel_connected(addr, seq, Arc::new(Mutex::new(writer)))
        .await;

    let mut acc = SentenceAccumulator::new();
    let mut buf = [0u8; 512];
    loop {
        let n = match read_chunk(&mut reader, &mut buf).await {
            ReadOutcome::Data(n) => n,
            ReadOutcome::Timeout => continue,
            ReadOutcome::Eof => {
                info!("GPS channel closed by peer: {}", addr);
                break;
            }
            ReadOutcome::Error(e) => {
                warn!("GPS channel {} read error: {}", addr, e);
                break;
            }
        };
        for sentence in acc.feed(&buf[..n]) {
            // Every sentence type feeds the relay's latest-sentence slot
            registry.record_sentence(addr, &sentence).await;
            if !nmea::is_gga(&sentence) {
                continue;
            }
            match nmea::parse_gga(&sentence) {
                Ok(fix) => {
                    registry
                        .set_position(
                            addr,
                            Position {
                                longitude: fix.longitude,
                                latitude: fix.latitude,
                            },
                            fix.fix,
                        )
                        .await;
                }
                Err(e) => {
                    // Bad sentence: discard, keep the stored state and the connection
                    debug!("GPS parse error from {}: {}", addr, e);
                }
            }
        }
    }
}

enum ReadOutcome {
    Data(usize),
    Timeout,
    Eof,
    Error(std::io::Error),
}

/// One bounded read. Timeouts are poll-cycle boundaries so cancellation and
/// shutdown stay responsive even on a silent socket.
async fn read_chunk<R: AsyncReadExt + Unpin>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    match time::timeout(Duration::from_secs(READ_TIMEOUT_SECS), reader.read(buf)).await {
        Err(_) => ReadOutcome::Timeout,
        Ok(Ok(0)) => ReadOutcome::Eof,
        Ok(Ok(n)) => ReadOutcome::Data(n),
        Ok(Err(e)) => ReadOutcome::Error(e),
    }
}

/// Connect with a bounded timeout, then read and discard the peer's greeting.
async fn open_channel(addr: IpAddr, port: u16) -> crate::Result<TcpStream> {
    let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
    let mut stream = time::timeout(connect_timeout, TcpStream::connect((addr, port)))
        .await
        .map_err(|_| Error::ConnectTimeout(connect_timeout))??;

    // Sensors send a short banner right after accept; its content is unused.
    let mut greeting = [0u8; GREETING_LEN];
    match time::timeout(
        Duration::from_secs(READ_TIMEOUT_SECS),
        stream.read(&mut greeting),
    )
    .await
    {
        Ok(Ok(n)) => debug!("Greeting from {}:{} ({} bytes)", addr, port, n),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => debug!("No greeting from {}:{}", addr, port),
    }
    Ok(stream)
}

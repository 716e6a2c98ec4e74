// Correction relay
// Forwards the latest position sentence to the caster and fans the returned
// RTCM bytes out to every connected GPS channel

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use crate::net::ntrip::NtripSession;
use crate::registry::SensorRegistry;
use crate::Result;

/// Run the relay until the shutdown signal flips.
///
/// Each cycle: latest sentence → caster → one correction read → broadcast.
/// A failed cycle is logged and followed by the longer cooldown; the loop
/// never exits on error, only on shutdown.
pub async fn run_relay(
    registry: Arc<SensorRegistry>,
    mut session: NtripSession,
    period: Duration,
    cooldown: Duration,
    write_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Correction relay running (period {:?})", period);
    loop {
        let pause = match relay_cycle(&registry, &mut session, write_timeout).await {
            Ok(()) => period,
            Err(e) => {
                warn!("Relay cycle failed: {}", e);
                cooldown
            }
        };
        tokio::select! {
            _ = time::sleep(pause) => {}
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown
                if changed.is_err() || *shutdown.borrow() {
                    info!("Correction relay stopping");
                    return;
                }
            }
        }
    }
}

async fn relay_cycle(
    registry: &Arc<SensorRegistry>,
    session: &mut NtripSession,
    write_timeout: Duration,
) -> Result<()> {
    let sentence = match registry.latest_sentence().await {
        Some(s) => s,
        // Nothing received from any sensor yet
        None => return Ok(()),
    };

    session.send_position(&sentence).await?;
    let chunk = session.receive_correction().await?;
    if !chunk.is_empty() {
        broadcast_correction(registry, &chunk, write_timeout).await;
    }
    Ok(())
}

/// Write a correction chunk to every connected GPS socket. Per-socket
/// failures and timeouts are logged and skipped; the owning channel task
/// will notice the dead socket on its next read. The per-write bound keeps
/// a peer with a full socket buffer from stalling the whole broadcast.
async fn broadcast_correction(
    registry: &Arc<SensorRegistry>,
    chunk: &[u8],
    write_timeout: Duration,
) {
    for (addr, writer) in registry.gps_writers().await {
        let mut guard = writer.lock().await;
        match time::timeout(write_timeout, guard.write_all(chunk)).await {
            Ok(Ok(())) => debug!("Sent {} correction bytes to {}", chunk.len(), addr),
            Ok(Err(e)) => warn!("Correction write to {} failed: {}", addr, e),
            Err(_) => warn!(
                "Correction write to {} timed out after {:?}",
                addr, write_timeout
            ),
        }
    }
}

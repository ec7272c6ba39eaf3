//! Flight-log endpoint.
//!
//! Appends every frame the router routes to it to a `.tlog` file: an 8-byte
//! big-endian microsecond timestamp followed by the raw frame bytes, the
//! format ground stations replay. The router drops this endpoint first on
//! exit so the buffered tail is flushed before the tracked-handle sweep.

use crate::endpoint::{EndpointState, SharedState};
use bytes::Bytes;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Writes routed frames to a fresh tlog file in `dir` until the queue
/// closes or the router cancels.
pub async fn run(
    dir: PathBuf,
    mut outbound: mpsc::Receiver<Bytes>,
    state: SharedState,
    token: CancellationToken,
) {
    if let Err(e) = fs::create_dir_all(&dir).await {
        error!("failed to create log directory {}: {e}", dir.display());
        state.set(EndpointState::Broken);
        return;
    }

    let started_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    let path = dir.join(format!("flight_{started_us}.tlog"));

    let file = match File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("failed to create log file {}: {e}", path.display());
            state.set(EndpointState::Broken);
            return;
        }
    };
    let mut writer = BufWriter::new(file);
    state.set(EndpointState::Connected);
    info!("logging telemetry to {}", path.display());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            msg = outbound.recv() => match msg {
                Some(bytes) => {
                    let timestamp_us = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_micros() as u64;
                    if let Err(e) = write_record(&mut writer, timestamp_us, &bytes).await {
                        error!("tlog write error: {e}");
                        state.set(EndpointState::Broken);
                        return;
                    }
                }
                None => break,
            },
        }
    }

    state.set(EndpointState::Draining);
    if let Err(e) = writer.flush().await {
        error!("tlog flush error: {e}");
    }
    info!("telemetry log {} closed", path.display());
}

async fn write_record(
    writer: &mut BufWriter<File>,
    timestamp_us: u64,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&timestamp_us.to_be_bytes()).await?;
    writer.write_all(bytes).await
}

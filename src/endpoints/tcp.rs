//! TCP endpoints.
//!
//! Outbound clients connect on startup and reconnect with the configured
//! retry interval; a retry interval of zero means a lost connection is
//! final — the task reports closure and the router prunes the endpoint.
//! Server-side clients come from the router-owned listener and are never
//! retried: their lifetime ends when the peer disconnects.

use crate::endpoint::{EndpointIngress, EndpointState, SharedState};
use crate::frame::StreamParser;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum StreamOutcome {
    Cancelled,
    PeerGone,
}

/// Connects to `addr`, reconnecting every `retry_ms` until cancelled.
pub async fn run_client(
    addr: String,
    retry_ms: u64,
    ingress: EndpointIngress,
    mut outbound: mpsc::Receiver<Bytes>,
    state: SharedState,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }
        state.set(EndpointState::Opening);

        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(endpoint = %ingress.name, %addr, "TCP connected");
                state.set(EndpointState::Connected);
                ingress.stats.on_connected();

                let outcome = run_stream(stream, &ingress, &mut outbound, &token).await;
                ingress.stats.on_disconnected();
                if matches!(outcome, StreamOutcome::Cancelled) {
                    break;
                }
                warn!(endpoint = %ingress.name, %addr, "TCP connection lost");
            }
            Err(e) => {
                debug!(endpoint = %ingress.name, %addr, "TCP connect failed: {e}");
            }
        }

        if retry_ms == 0 {
            state.set(EndpointState::Broken);
            ingress.report_closed().await;
            break;
        }

        state.set(EndpointState::Broken);
        ingress.stats.on_reconnect();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(retry_ms)) => {}
            _ = token.cancelled() => break,
        }
    }
}

/// Drives one accepted server-side connection; no retry.
pub async fn run_accepted(
    stream: TcpStream,
    ingress: EndpointIngress,
    mut outbound: mpsc::Receiver<Bytes>,
    state: SharedState,
    token: CancellationToken,
) {
    state.set(EndpointState::Connected);
    ingress.stats.on_connected();

    let outcome = run_stream(stream, &ingress, &mut outbound, &token).await;
    ingress.stats.on_disconnected();
    state.set(EndpointState::Broken);

    if matches!(outcome, StreamOutcome::PeerGone) {
        ingress.report_closed().await;
    }
}

async fn run_stream(
    stream: TcpStream,
    ingress: &EndpointIngress,
    outbound: &mut mpsc::Receiver<Bytes>,
    token: &CancellationToken,
) -> StreamOutcome {
    let (mut reader, mut writer) = stream.into_split();
    let mut parser = StreamParser::new();
    let mut buf = [0u8; 4096];

    loop {
        tokio::select! {
            _ = token.cancelled() => return StreamOutcome::Cancelled,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return StreamOutcome::PeerGone, // EOF
                Ok(n) => ingress.feed(&mut parser, &buf[..n]).await,
                Err(e) => {
                    debug!(endpoint = %ingress.name, "TCP read error: {e}");
                    return StreamOutcome::PeerGone;
                }
            },
            msg = outbound.recv() => match msg {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(endpoint = %ingress.name, "TCP write error: {e}");
                        return StreamOutcome::PeerGone;
                    }
                    ingress.stats.on_frame_written(bytes.len());
                }
                None => return StreamOutcome::Cancelled,
            },
        }
    }
}

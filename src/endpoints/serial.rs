//! UART endpoints.
//!
//! A UART endpoint scans its configured baudrate list: if no valid frame
//! arrives within the auto-baud window the next candidate rate is tried,
//! wrapping around. Once a frame is seen the scan stops for the life of
//! the connection. Hardware errors close and reopen the device after a
//! short backoff, keeping the scan position.

use crate::endpoint::{EndpointIngress, EndpointState, SharedState};
use crate::frame::StreamParser;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const AUTOBAUD_TIMEOUT: Duration = Duration::from_secs(3);
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);

enum PortOutcome {
    Cancelled,
    /// Auto-baud window expired without a valid frame.
    Rotate,
    /// I/O failed; reopen after backoff.
    Failed,
}

/// Drives the serial device until cancellation, rotating baudrates and
/// reopening after failures.
pub async fn run(
    device: String,
    baudrates: Vec<u32>,
    flow_control: bool,
    ingress: EndpointIngress,
    mut outbound: mpsc::Receiver<Bytes>,
    state: SharedState,
    token: CancellationToken,
) {
    if baudrates.is_empty() {
        warn!(endpoint = %ingress.name, "no baudrates configured");
        state.set(EndpointState::Broken);
        return;
    }
    let mut baud_idx = 0usize;

    loop {
        if token.is_cancelled() {
            break;
        }
        state.set(EndpointState::Opening);
        let baud = baudrates[baud_idx % baudrates.len()];

        match open_port(&device, baud, flow_control) {
            Ok(port) => {
                info!(endpoint = %ingress.name, %device, baud, "serial port opened");
                state.set(EndpointState::Connected);
                ingress.stats.on_connected();

                // Only scan while more than one candidate rate exists
                let scanning = baudrates.len() > 1;
                let outcome = run_port(port, &ingress, &mut outbound, &token, scanning).await;
                ingress.stats.on_disconnected();

                match outcome {
                    PortOutcome::Cancelled => break,
                    PortOutcome::Rotate => {
                        baud_idx += 1;
                        ingress.stats.on_baud_change();
                        info!(
                            endpoint = %ingress.name,
                            next_baud = baudrates[baud_idx % baudrates.len()],
                            "no frames at {baud} baud, rotating"
                        );
                    }
                    PortOutcome::Failed => {
                        state.set(EndpointState::Broken);
                        ingress.stats.on_reconnect();
                    }
                }
            }
            Err(e) => {
                state.set(EndpointState::Broken);
                warn!(endpoint = %ingress.name, %device, "failed to open serial port: {e}");
                ingress.stats.on_reconnect();
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(REOPEN_BACKOFF) => {}
            _ = token.cancelled() => break,
        }
    }
}

fn open_port(device: &str, baud: u32, flow_control: bool) -> tokio_serial::Result<SerialStream> {
    let flow = if flow_control {
        tokio_serial::FlowControl::Hardware
    } else {
        tokio_serial::FlowControl::None
    };

    #[allow(unused_mut)]
    let mut port = tokio_serial::new(device, baud)
        .flow_control(flow)
        .open_native_async()?;

    #[cfg(unix)]
    port.set_exclusive(false).ok();

    Ok(port)
}

async fn run_port(
    port: SerialStream,
    ingress: &EndpointIngress,
    outbound: &mut mpsc::Receiver<Bytes>,
    token: &CancellationToken,
    scanning: bool,
) -> PortOutcome {
    let (mut reader, mut writer) = tokio::io::split(port);
    let mut parser = StreamParser::new();
    let mut buf = [0u8; 4096];

    let baseline = ingress.stats.rx_messages();
    let autobaud_deadline = tokio::time::Instant::now() + AUTOBAUD_TIMEOUT;
    let mut synced = !scanning;

    loop {
        tokio::select! {
            _ = token.cancelled() => return PortOutcome::Cancelled,
            _ = tokio::time::sleep_until(autobaud_deadline), if !synced => {
                if ingress.stats.rx_messages() > baseline {
                    synced = true;
                } else {
                    return PortOutcome::Rotate;
                }
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => return PortOutcome::Failed,
                Ok(n) => {
                    ingress.feed(&mut parser, &buf[..n]).await;
                    if !synced && ingress.stats.rx_messages() > baseline {
                        synced = true;
                    }
                }
                Err(e) => {
                    debug!(endpoint = %ingress.name, "serial read error: {e}");
                    ingress.stats.on_hw_error();
                    return PortOutcome::Failed;
                }
            },
            msg = outbound.recv() => match msg {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(endpoint = %ingress.name, "serial write error: {e}");
                        ingress.stats.on_hw_error();
                        return PortOutcome::Failed;
                    }
                    ingress.stats.on_frame_written(bytes.len());
                }
                None => return PortOutcome::Cancelled,
            },
        }
    }
}

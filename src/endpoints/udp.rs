//! UDP endpoints.
//!
//! A client endpoint has a fixed peer: the socket is connected, reads come
//! from that peer and writes go to it. A server endpoint is bound locally
//! and learns its peer from inbound datagrams — the most recent sender
//! wins; until one is learned, outbound frames are dropped and counted.

use crate::endpoint::{EndpointIngress, EndpointState, SharedState};
use crate::frame::StreamParser;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const MAX_DATAGRAM: usize = 65535;

/// Drives a connected (client-mode) UDP socket until cancellation.
pub async fn run_client(
    socket: UdpSocket,
    ingress: EndpointIngress,
    mut outbound: mpsc::Receiver<Bytes>,
    state: SharedState,
    token: CancellationToken,
) {
    state.set(EndpointState::Connected);
    ingress.stats.on_connected();

    let mut parser = StreamParser::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv(&mut buf) => match received {
                Ok(n) => ingress.feed(&mut parser, &buf[..n]).await,
                Err(e) => {
                    // Connected UDP sockets surface ICMP errors here;
                    // nothing to reconnect, just avoid spinning
                    debug!(endpoint = %ingress.name, "UDP recv error: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            msg = outbound.recv() => match msg {
                Some(bytes) => match socket.send(&bytes).await {
                    Ok(_) => ingress.stats.on_frame_written(bytes.len()),
                    Err(e) => debug!(endpoint = %ingress.name, "UDP send error: {e}"),
                },
                None => break,
            },
        }
    }
    state.set(EndpointState::Draining);
}

/// Drives a bound (server-mode) UDP socket until cancellation.
pub async fn run_server(
    socket: UdpSocket,
    ingress: EndpointIngress,
    mut outbound: mpsc::Receiver<Bytes>,
    state: SharedState,
    token: CancellationToken,
) {
    state.set(EndpointState::Connected);
    ingress.stats.on_connected();

    let mut parser = StreamParser::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut peer: Option<SocketAddr> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, addr)) => {
                    if peer != Some(addr) {
                        if peer.is_some() {
                            ingress.stats.on_peer_change();
                        }
                        info!(endpoint = %ingress.name, %addr, "UDP peer learned");
                        peer = Some(addr);
                    }
                    ingress.feed(&mut parser, &buf[..n]).await;
                }
                Err(e) => {
                    debug!(endpoint = %ingress.name, "UDP recv error: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            msg = outbound.recv() => match msg {
                Some(bytes) => match peer {
                    Some(addr) => match socket.send_to(&bytes, addr).await {
                        Ok(_) => ingress.stats.on_frame_written(bytes.len()),
                        Err(e) => debug!(endpoint = %ingress.name, "UDP send error: {e}"),
                    },
                    // No peer yet: drop and count
                    None => ingress.stats.on_no_peer_drop(),
                },
                None => break,
            },
        }
    }
    state.set(EndpointState::Draining);
}

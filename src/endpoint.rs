//! Router-side endpoint records and the shared ingress path.
//!
//! The router owns its endpoints as an arena (`Vec<Endpoint>`); endpoints
//! never reference each other directly — group peers are stored as index
//! lists. Each record pairs the routing-relevant state (filters, group,
//! kind, learned-route id) with the write half of the endpoint task's tx
//! queue.
//!
//! Reader tasks share one ingress path: parse, count, apply inbound
//! filters, then hand the frame to the owning router's event inbox.

use crate::filter::EndpointFilters;
use crate::frame::{Frame, StreamParser};
use crate::router::RouterEvent;
use crate::routing::RoutingTable;
use crate::stats::{Direction, EndpointStats};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Decision of an endpoint about one outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptState {
    /// The frame should be written to this endpoint.
    Accepted,
    /// A filter intentionally dropped the frame (counted).
    Filtered,
    /// This endpoint is not a valid destination for the frame.
    Rejected,
}

/// Transport category of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Uart,
    UdpClient,
    UdpServer,
    TcpClient,
    /// Connection produced by the router's TCP listener; never retried.
    TcpAccepted,
    /// Flight-log writer; same contract, archives everything.
    Log,
}

impl EndpointKind {
    /// Endpoints that reconnect on their own and must survive the hangup
    /// sweep.
    pub fn reconnects(&self) -> bool {
        matches!(
            self,
            EndpointKind::Uart | EndpointKind::UdpClient | EndpointKind::UdpServer
        )
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointKind::Uart => "uart",
            EndpointKind::UdpClient => "udp-client",
            EndpointKind::UdpServer => "udp-server",
            EndpointKind::TcpClient => "tcp-client",
            EndpointKind::TcpAccepted => "tcp-accepted",
            EndpointKind::Log => "log",
        };
        f.write_str(s)
    }
}

/// Connection state of an endpoint, shared between its task and the
/// router for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EndpointState {
    Opening = 0,
    Connected = 1,
    Draining = 2,
    Broken = 3,
}

/// Cheap shared cell for [`EndpointState`].
#[derive(Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: EndpointState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn set(&self, state: EndpointState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> EndpointState {
        match self.0.load(Ordering::Relaxed) {
            0 => EndpointState::Opening,
            1 => EndpointState::Connected,
            2 => EndpointState::Draining,
            _ => EndpointState::Broken,
        }
    }
}

/// One endpoint as the router sees it.
pub struct Endpoint {
    /// Index into the router's endpoint arena; also the learned-route key.
    pub id: usize,
    /// Configured name (dynamic TCP clients get a synthesized one).
    pub name: String,
    /// Opaque group tag; members are linked through `peers`.
    pub group: Option<String>,
    /// Transport category.
    pub kind: EndpointKind,
    /// Outbound filters (inbound filtering happens at ingress).
    pub filters: EndpointFilters,
    /// Write half of the endpoint task's tx queue (raw wire bytes).
    pub tx: mpsc::Sender<Bytes>,
    /// Shared counters.
    pub stats: Arc<EndpointStats>,
    /// Connection state published by the endpoint task.
    pub state: SharedState,
    /// Arena indices of same-group endpoints.
    pub peers: Vec<usize>,
    /// TCP client retry interval; 0 means prune on hangup.
    pub retry_ms: u64,
    /// Set when the endpoint task reported that its transport is gone.
    pub closed: bool,
}

impl Endpoint {
    /// Decides whether `frame` should be written to this endpoint.
    ///
    /// Order: outbound filters, the sniffer rule, echo suppression toward
    /// the source network, then destination lookup (broadcast, learned
    /// route, group eligibility).
    pub fn accept_msg(
        &self,
        frame: &Frame,
        routing: &RoutingTable,
        sniffer_sysid: Option<u8>,
    ) -> AcceptState {
        if let Some(reason) = self.filters.check_outgoing(frame) {
            self.stats.on_filtered(Direction::Out, reason);
            return AcceptState::Filtered;
        }

        // Endpoints in front of the sniffer system get everything
        if let Some(sniffer) = sniffer_sysid {
            if routing.sees_system(self.id, sniffer) {
                return AcceptState::Accepted;
            }
        }

        // Never send a frame back toward the network it came from
        if routing.owns(self.id, frame.src_sysid(), frame.src_compid()) {
            trace!(
                endpoint = %self.name,
                src_sys = frame.src_sysid(),
                src_comp = frame.src_compid(),
                "rejecting echo toward source network"
            );
            return AcceptState::Rejected;
        }

        // The log endpoint archives everything that passed the filter
        if self.kind == EndpointKind::Log {
            return AcceptState::Accepted;
        }

        if frame.is_broadcast()
            || routing.should_send(self.id, frame.target_sysid, frame.target_compid)
        {
            return AcceptState::Accepted;
        }

        // Group eligibility: destination known behind a same-group member
        for &peer in &self.peers {
            if routing.should_send(peer, frame.target_sysid, frame.target_compid) {
                return AcceptState::Accepted;
            }
        }

        AcceptState::Rejected
    }

    /// True until the endpoint task reports an unrecoverable transport.
    pub fn is_valid(&self) -> bool {
        !self.closed
    }
}

/// Ingress half shared by every endpoint reader task: inbound filter,
/// stats and the handoff into the owning router's inbox.
#[derive(Clone)]
pub struct EndpointIngress {
    /// Arena index of the endpoint this ingress feeds.
    pub id: usize,
    /// Endpoint name for logging.
    pub name: String,
    /// Inbound-direction filters.
    pub filters: EndpointFilters,
    /// Shared counters.
    pub stats: Arc<EndpointStats>,
    /// The owning router's event inbox.
    pub events: mpsc::Sender<RouterEvent>,
}

impl EndpointIngress {
    /// Runs one parsed frame through stats and inbound filters, then
    /// forwards it to the router.
    pub async fn handle_frame(&self, frame: Frame) {
        self.stats.on_frame_received(frame.len(), frame.is_v2());

        if let Some(reason) = self.filters.check_incoming(&frame) {
            self.stats.on_filtered(Direction::In, reason);
            return;
        }

        // Send failure means the router is tearing down; the task's
        // cancellation token stops the loop.
        let _ = self
            .events
            .send(RouterEvent::Frame {
                source: self.id,
                frame,
            })
            .await;
    }

    /// Feeds raw bytes through `parser` and forwards every complete frame.
    pub async fn feed(&self, parser: &mut StreamParser, data: &[u8]) {
        parser.push(data);
        while let Some(frame) = parser.parse_next() {
            self.handle_frame(frame).await;
        }
        self.stats.on_malformed(parser.take_garbage_bytes());
    }

    /// Tells the router this endpoint's transport is gone for good.
    pub async fn report_closed(&self) {
        let _ = self
            .events
            .send(RouterEvent::EndpointClosed { id: self.id })
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::frame::NO_TARGET;
    use mavlink::{MavHeader, MavlinkVersion};
    use std::collections::HashSet;

    fn test_frame(msg_id: u32, src: (u8, u8), target: (i16, i16)) -> Frame {
        Frame {
            raw: Bytes::from_static(&[0u8; 12]),
            header: MavHeader {
                system_id: src.0,
                component_id: src.1,
                sequence: 0,
            },
            msg_id,
            version: MavlinkVersion::V2,
            target_sysid: target.0,
            target_compid: target.1,
        }
    }

    fn test_endpoint(id: usize, kind: EndpointKind, filters: EndpointFilters) -> Endpoint {
        let (tx, _rx) = mpsc::channel(8);
        Endpoint {
            id,
            name: format!("ep-{id}"),
            group: None,
            kind,
            filters,
            tx,
            stats: Arc::new(EndpointStats::new()),
            state: SharedState::new(EndpointState::Connected),
            peers: Vec::new(),
            retry_ms: 0,
            closed: false,
        }
    }

    #[test]
    fn test_broadcast_accepted_by_default() {
        let ep = test_endpoint(0, EndpointKind::UdpClient, EndpointFilters::default());
        let rt = RoutingTable::new();
        let frame = test_frame(0, (1, 1), (NO_TARGET, NO_TARGET));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Accepted);
    }

    #[test]
    fn test_filtered_msg_id_counts() {
        let filters = EndpointFilters {
            block_msg_id_out: HashSet::from([42]),
            ..Default::default()
        };
        let ep = test_endpoint(0, EndpointKind::UdpClient, filters);
        let rt = RoutingTable::new();

        let frame = test_frame(42, (1, 1), (NO_TARGET, NO_TARGET));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Filtered);
        assert_eq!(ep.stats.filtered_out_msg_id(), 1);
    }

    #[test]
    fn test_echo_toward_source_network_rejected() {
        let ep = test_endpoint(0, EndpointKind::UdpClient, EndpointFilters::default());
        let mut rt = RoutingTable::new();
        // Endpoint 0 owns system 7/1
        rt.learn(0, 7, 1);

        let frame = test_frame(0, (7, 1), (NO_TARGET, NO_TARGET));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Rejected);
    }

    #[test]
    fn test_targeted_frame_needs_learned_route() {
        let ep = test_endpoint(0, EndpointKind::UdpClient, EndpointFilters::default());
        let mut rt = RoutingTable::new();

        let frame = test_frame(76, (255, 190), (7, 1));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Rejected);

        rt.learn(0, 7, 1);
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Accepted);
    }

    #[test]
    fn test_group_peer_makes_destination_eligible() {
        let mut ep = test_endpoint(0, EndpointKind::UdpClient, EndpointFilters::default());
        ep.peers = vec![1];
        let mut rt = RoutingTable::new();
        // Only the group peer has seen the target system
        rt.learn(1, 7, 1);

        let frame = test_frame(76, (255, 190), (7, 1));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Accepted);
    }

    #[test]
    fn test_sniffer_endpoint_gets_everything() {
        let ep = test_endpoint(0, EndpointKind::UdpClient, EndpointFilters::default());
        let mut rt = RoutingTable::new();
        rt.learn(0, 254, 1); // the sniffer system sits behind endpoint 0

        // Targeted at an unknown system: normally rejected
        let frame = test_frame(76, (1, 1), (99, 1));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Rejected);
        assert_eq!(ep.accept_msg(&frame, &rt, Some(254)), AcceptState::Accepted);
    }

    #[test]
    fn test_sniffer_does_not_override_filters() {
        let filters = EndpointFilters {
            block_msg_id_out: HashSet::from([76]),
            ..Default::default()
        };
        let ep = test_endpoint(0, EndpointKind::UdpClient, filters);
        let mut rt = RoutingTable::new();
        rt.learn(0, 254, 1);

        let frame = test_frame(76, (1, 1), (99, 1));
        assert_eq!(ep.accept_msg(&frame, &rt, Some(254)), AcceptState::Filtered);
    }

    #[test]
    fn test_log_endpoint_accepts_all_unfiltered() {
        let ep = test_endpoint(0, EndpointKind::Log, EndpointFilters::default());
        let rt = RoutingTable::new();

        // Even a targeted frame with no learned route is archived
        let frame = test_frame(76, (1, 1), (99, 1));
        assert_eq!(ep.accept_msg(&frame, &rt, None), AcceptState::Accepted);
    }

    #[tokio::test]
    async fn test_ingress_applies_inbound_filter() {
        let (tx, mut rx) = mpsc::channel(8);
        let ingress = EndpointIngress {
            id: 3,
            name: "test".to_string(),
            filters: EndpointFilters {
                block_msg_id_in: HashSet::from([5]),
                ..Default::default()
            },
            stats: Arc::new(EndpointStats::new()),
            events: tx,
        };

        ingress.handle_frame(test_frame(5, (1, 1), (NO_TARGET, NO_TARGET))).await;
        ingress.handle_frame(test_frame(6, (1, 1), (NO_TARGET, NO_TARGET))).await;

        let event = rx.recv().await.expect("one frame passes");
        match event {
            RouterEvent::Frame { source, frame } => {
                assert_eq!(source, 3);
                assert_eq!(frame.msg_id, 6);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(ingress.stats.rx_messages(), 2);
    }
}

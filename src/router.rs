//! The router instance and its event loop.
//!
//! A [`RouterInstance`] is a complete, owned router: endpoint arena, dedup
//! cache, learned-route table, timeout list, tracked-handle map and its own
//! exit flag. Nothing about it is global — the process runs one instance
//! per router thread (the primary plus one per extension) and stopping one
//! never touches another.
//!
//! The event loop waits on the instance's inbox with a mandatory bounded
//! timeout so `request_exit` is observed within one ready-wait even when no
//! traffic flows. Endpoint reader tasks feed the inbox; routing, hangup
//! sweeps and timeout dispatch all happen on the router thread, so the
//! route table and the endpoint arena need no locks.

use crate::config::{Configuration, GeneralConfig};
use crate::dedup::{DedupCache, PacketStatus};
use crate::endpoint::{
    AcceptState, Endpoint, EndpointIngress, EndpointKind, EndpointState, SharedState,
};
use crate::error::{Result, RouterError};
use crate::frame::Frame;
use crate::routing::RoutingTable;
use crate::stats::{new_registry, EndpointStats, EndpointStatsHandle, StatsRegistry};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Upper bound of one ready-wait. Bounds how late `request_exit` can be
/// observed.
pub const READY_WAIT: Duration = Duration::from_millis(100);

const INBOX_DEPTH: usize = 1024;
const TX_QUEUE_DEPTH: usize = 512;
const LOG_AGGREGATE_INTERVAL: Duration = Duration::from_secs(5);
const ROUTE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const ROUTE_TTL: Duration = Duration::from_secs(300);

/// Events delivered to a router instance's inbox.
#[derive(Debug)]
pub enum RouterEvent {
    /// A frame parsed by an endpoint reader, already past inbound filters.
    Frame {
        /// Arena index of the reading endpoint.
        source: usize,
        /// The parsed frame.
        frame: Frame,
    },
    /// An endpoint task gave up on its transport for good.
    EndpointClosed {
        /// Arena index of the endpoint.
        id: usize,
    },
    /// The router-owned TCP listener accepted a connection.
    TcpAccepted {
        /// The accepted stream.
        stream: TcpStream,
        /// Peer address, used for the dynamic endpoint's name.
        peer: SocketAddr,
    },
}

/// Cloneable control surface of one router instance: the per-instance exit
/// flag, retcode and cancellation token. `request_exit` only ever affects
/// the instance this control belongs to.
#[derive(Clone)]
pub struct RouterControl {
    name: Arc<str>,
    should_exit: Arc<AtomicBool>,
    retcode: Arc<AtomicI32>,
    cancel: CancellationToken,
}

impl RouterControl {
    fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            should_exit: Arc::new(AtomicBool::new(false)),
            retcode: Arc::new(AtomicI32::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Asks this instance's loop to exit with `retcode`. Thread-safe.
    pub fn request_exit(&self, retcode: i32) {
        self.retcode.store(retcode, Ordering::Relaxed);
        self.should_exit.store(true, Ordering::Relaxed);
        self.cancel.cancel();
        debug!(router = %self.name, retcode, "exit requested");
    }

    /// True once `request_exit` was called.
    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::Relaxed)
    }

    /// The retcode the loop will return.
    pub fn retcode(&self) -> i32 {
        self.retcode.load(Ordering::Relaxed)
    }

    /// Cancellation token endpoint tasks select on.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Router name this control belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct TrackedEntry {
    description: String,
    abort: Option<tokio::task::AbortHandle>,
}

/// Map of every live handle a router instance opened, keyed by a stable
/// id, each with a human-readable description. Entries are inserted before
/// a handle is used and removed on deliberate close; teardown force-closes
/// whatever is left. Catches leaks from aborted `add_endpoints` calls and
/// exceptional thread exits.
#[derive(Default)]
pub struct TrackedHandles {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, TrackedEntry>>,
}

impl TrackedHandles {
    /// Registers a handle, returning its tracking id.
    pub fn track(&self, description: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let description = description.into();
        trace!(id, %description, "tracking handle");
        self.entries.lock().insert(
            id,
            TrackedEntry {
                description,
                abort: None,
            },
        );
        id
    }

    /// Associates the task owning the handle, so force-close can abort it.
    pub fn attach_task(&self, id: u64, handle: &tokio::task::JoinHandle<()>) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.abort = Some(handle.abort_handle());
        }
    }

    /// Removes a deliberately closed handle.
    pub fn untrack(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    /// Number of still-open handles.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Descriptions of everything still open, for diagnostics.
    pub fn descriptions(&self) -> Vec<String> {
        self.entries
            .lock()
            .values()
            .map(|e| e.description.clone())
            .collect()
    }

    /// Aborts owning tasks and clears the map. Runs on every teardown
    /// path, including panics in an extension thread.
    pub fn force_close_all(&self) {
        let mut entries = self.entries.lock();
        for (id, entry) in entries.drain() {
            debug!(id, description = %entry.description, "force-closing tracked handle");
            if let Some(abort) = entry.abort {
                abort.abort();
            }
        }
    }
}

type TimeoutCallback = Box<dyn FnMut(&mut RouterInstance) -> bool + Send>;

/// A periodic callback anchored to the router loop. Returning `false`
/// flags it for removal; removal is deferred out of the dispatch walk.
struct Timeout {
    interval: Duration,
    next_due: Instant,
    removed: bool,
    callback: Option<TimeoutCallback>,
}

/// One complete router: endpoints, routing state, dedup cache, timeouts,
/// tracked handles and the per-instance exit flag.
pub struct RouterInstance {
    name: String,
    control: RouterControl,
    dedup: DedupCache,
    routing: RoutingTable,
    endpoints: Vec<Option<Endpoint>>,
    stats_registry: StatsRegistry,
    tracked: Arc<TrackedHandles>,
    sniffer_sysid: Option<u8>,
    /// Tracking id of the handle each endpoint slot owns.
    endpoint_tracking: HashMap<usize, u64>,
    inbox: Option<mpsc::Receiver<RouterEvent>>,
    events_tx: Option<mpsc::Sender<RouterEvent>>,
    timeouts: Vec<Timeout>,
    msg_to_unknown: u64,
    should_process_hangups: bool,
}

impl RouterInstance {
    /// Builds a closed instance from the general settings: fresh dedup
    /// cache, fresh exit flag, fresh tracked-handle map.
    pub fn new(name: impl Into<String>, general: &GeneralConfig) -> Self {
        let name = name.into();
        Self {
            control: RouterControl::new(&name),
            dedup: DedupCache::new(Duration::from_millis(general.deduplication_period_ms)),
            routing: RoutingTable::new(),
            endpoints: Vec::new(),
            stats_registry: new_registry(),
            tracked: Arc::new(TrackedHandles::default()),
            sniffer_sysid: general.sniffer_sysid,
            endpoint_tracking: HashMap::new(),
            inbox: None,
            events_tx: None,
            timeouts: Vec::new(),
            msg_to_unknown: 0,
            should_process_hangups: false,
            name,
        }
    }

    /// This instance's control surface.
    pub fn control(&self) -> RouterControl {
        self.control.clone()
    }

    /// Shared registry of live endpoint stats, for the statistics worker.
    pub fn stats_registry(&self) -> StatsRegistry {
        self.stats_registry.clone()
    }

    /// The tracked-handle map, shared so a guarded thread scope can
    /// force-close after a panic.
    pub fn tracked_handles(&self) -> Arc<TrackedHandles> {
        self.tracked.clone()
    }

    /// Number of live endpoints.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.iter().flatten().count()
    }

    /// Asks the loop to exit. Operates only on this instance.
    pub fn request_exit(&self, retcode: i32) {
        self.control.request_exit(retcode);
    }

    /// Allocates the event inbox. Fails with `Busy` when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.events_tx.is_some() {
            return Err(RouterError::Busy(self.name.clone()));
        }
        let (tx, rx) = mpsc::channel(INBOX_DEPTH);
        self.events_tx = Some(tx);
        self.inbox = Some(rx);
        info!(router = %self.name, "router opened");
        Ok(())
    }

    fn events_tx(&self) -> Result<mpsc::Sender<RouterEvent>> {
        self.events_tx
            .clone()
            .ok_or_else(|| RouterError::internal("router not open"))
    }

    /// Materialises every endpoint of `config`.
    ///
    /// UDP sockets and the TCP listener are bound eagerly; the first bind
    /// failure fails the whole call, leaving already-opened handles in the
    /// tracked map for the caller's teardown. UART devices and outbound
    /// TCP connections are opened by their tasks with retry.
    pub async fn add_endpoints(&mut self, config: &Configuration) -> Result<()> {
        let events = self.events_tx()?;

        for uart in &config.uart_endpoints {
            let (endpoint, ingress, outbound, state) = self.new_endpoint(
                &uart.name,
                uart.group.clone(),
                EndpointKind::Uart,
                uart.filters.clone(),
                0,
                &events,
            );
            let tracked_id = self.tracked.track(format!("uart:{}", uart.device));
            let task = tokio::spawn(crate::endpoints::serial::run(
                uart.device.clone(),
                uart.baudrates.clone(),
                uart.flow_control,
                ingress,
                outbound,
                state,
                self.control.cancel_token(),
            ));
            self.tracked.attach_task(tracked_id, &task);
            self.install_endpoint(endpoint, tracked_id);
        }

        for udp in &config.udp_endpoints {
            let kind = match udp.mode {
                crate::config::UdpMode::Client => EndpointKind::UdpClient,
                crate::config::UdpMode::Server => EndpointKind::UdpServer,
            };
            let socket = self.bind_udp(udp, kind).await?;
            let (endpoint, ingress, outbound, state) = self.new_endpoint(
                &udp.name,
                udp.group.clone(),
                kind,
                udp.filters.clone(),
                0,
                &events,
            );
            let tracked_id = self.tracked.track(format!("udp:{}", udp.socket_addr()));
            let task = match kind {
                EndpointKind::UdpClient => tokio::spawn(crate::endpoints::udp::run_client(
                    socket,
                    ingress,
                    outbound,
                    state,
                    self.control.cancel_token(),
                )),
                _ => tokio::spawn(crate::endpoints::udp::run_server(
                    socket,
                    ingress,
                    outbound,
                    state,
                    self.control.cancel_token(),
                )),
            };
            self.tracked.attach_task(tracked_id, &task);
            self.install_endpoint(endpoint, tracked_id);
        }

        for tcp in &config.tcp_endpoints {
            let (endpoint, ingress, outbound, state) = self.new_endpoint(
                &tcp.name,
                tcp.group.clone(),
                EndpointKind::TcpClient,
                tcp.filters.clone(),
                tcp.retry_timeout_ms,
                &events,
            );
            let tracked_id = self.tracked.track(format!("tcp:{}", tcp.socket_addr()));
            let task = tokio::spawn(crate::endpoints::tcp::run_client(
                tcp.socket_addr(),
                tcp.retry_timeout_ms,
                ingress,
                outbound,
                state,
                self.control.cancel_token(),
            ));
            self.tracked.attach_task(tracked_id, &task);
            self.install_endpoint(endpoint, tracked_id);
        }

        if let Some(port) = config.general.tcp_server_port {
            self.open_tcp_server(port, &events).await?;
        }

        if config.log.telemetry {
            if let Some(dir) = &config.log.dir {
                let (endpoint, _ingress, outbound, state) = self.new_endpoint(
                    "log",
                    None,
                    EndpointKind::Log,
                    Default::default(),
                    0,
                    &events,
                );
                let tracked_id = self.tracked.track(format!("tlog:{}", dir.display()));
                let task = tokio::spawn(crate::endpoints::tlog::run(
                    dir.clone(),
                    outbound,
                    state,
                    self.control.cancel_token(),
                ));
                self.tracked.attach_task(tracked_id, &task);
                self.install_endpoint(endpoint, tracked_id);
            }
        }

        self.rebuild_group_peers();

        info!(
            router = %self.name,
            endpoints = self.endpoint_count(),
            "endpoints added"
        );
        Ok(())
    }

    async fn bind_udp(
        &self,
        udp: &crate::config::UdpEndpointConfig,
        kind: EndpointKind,
    ) -> Result<UdpSocket> {
        match kind {
            EndpointKind::UdpServer => UdpSocket::bind(udp.socket_addr()).await.map_err(|e| {
                RouterError::endpoint_init("udp", &udp.name, format!("bind failed: {e}"))
            }),
            _ => {
                let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
                    RouterError::endpoint_init("udp", &udp.name, format!("bind failed: {e}"))
                })?;
                socket.connect(udp.socket_addr()).await.map_err(|e| {
                    RouterError::endpoint_init("udp", &udp.name, format!("connect failed: {e}"))
                })?;
                Ok(socket)
            }
        }
    }

    async fn open_tcp_server(&mut self, port: u16, events: &mpsc::Sender<RouterEvent>) -> Result<()> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            RouterError::endpoint_init("tcp-server", &addr, format!("bind failed: {e}"))
        })?;
        info!(router = %self.name, %addr, "TCP server listening");

        let tracked_id = self.tracked.track(format!("tcp-server:{addr}"));
        let events = events.clone();
        let token = self.control.cancel_token();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if events
                                .send(RouterEvent::TcpAccepted { stream, peer })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => error!("TCP accept error: {e}"),
                    },
                }
            }
        });
        self.tracked.attach_task(tracked_id, &task);
        Ok(())
    }

    /// Builds an endpoint record plus the pieces its task needs. The
    /// record is not yet in the arena; `install_endpoint` finishes it.
    fn new_endpoint(
        &mut self,
        name: &str,
        group: Option<String>,
        kind: EndpointKind,
        filters: crate::filter::EndpointFilters,
        retry_ms: u64,
        events: &mpsc::Sender<RouterEvent>,
    ) -> (
        Endpoint,
        EndpointIngress,
        mpsc::Receiver<Bytes>,
        SharedState,
    ) {
        let id = self
            .endpoints
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or(self.endpoints.len());
        let (tx, rx) = mpsc::channel(TX_QUEUE_DEPTH);
        let stats = Arc::new(EndpointStats::new());
        let state = SharedState::new(EndpointState::Opening);

        let ingress = EndpointIngress {
            id,
            name: name.to_string(),
            filters: filters.clone(),
            stats: stats.clone(),
            events: events.clone(),
        };
        let endpoint = Endpoint {
            id,
            name: name.to_string(),
            group,
            kind,
            filters,
            tx,
            stats,
            state: state.clone(),
            peers: Vec::new(),
            retry_ms,
            closed: false,
        };
        (endpoint, ingress, rx, state)
    }

    fn install_endpoint(&mut self, endpoint: Endpoint, tracked_id: u64) {
        self.stats_registry.write().push(EndpointStatsHandle {
            name: endpoint.name.clone(),
            stats: endpoint.stats.clone(),
        });
        let id = endpoint.id;
        self.endpoint_tracking.insert(id, tracked_id);
        if id == self.endpoints.len() {
            self.endpoints.push(Some(endpoint));
        } else {
            self.endpoints[id] = Some(endpoint);
        }
    }

    fn rebuild_group_peers(&mut self) {
        let tags: Vec<(usize, Option<String>)> = self
            .endpoints
            .iter()
            .flatten()
            .map(|ep| (ep.id, ep.group.clone()))
            .collect();

        for slot in self.endpoints.iter_mut() {
            let Some(ep) = slot else { continue };
            ep.peers = match &ep.group {
                Some(group) => tags
                    .iter()
                    .filter(|(id, tag)| *id != ep.id && tag.as_deref() == Some(group))
                    .map(|(id, _)| *id)
                    .collect(),
                None => Vec::new(),
            };
        }
    }

    /// Registers a periodic callback fired between ready-wait iterations.
    pub fn add_timeout(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&mut RouterInstance) -> bool + Send + 'static,
    ) {
        self.timeouts.push(Timeout {
            interval,
            next_due: Instant::now() + interval,
            removed: false,
            callback: Some(Box::new(callback)),
        });
    }

    fn fire_timeouts(&mut self) {
        let now = Instant::now();
        let mut timeouts = std::mem::take(&mut self.timeouts);
        for timeout in timeouts.iter_mut() {
            if timeout.removed || timeout.next_due > now {
                continue;
            }
            if let Some(mut callback) = timeout.callback.take() {
                let rearm = callback(self);
                timeout.callback = Some(callback);
                if rearm {
                    timeout.next_due = now + timeout.interval;
                } else {
                    timeout.removed = true;
                }
            }
        }
        // Callbacks may have registered new timeouts
        timeouts.append(&mut self.timeouts);
        timeouts.retain(|t| !t.removed);
        self.timeouts = timeouts;
    }

    /// Runs the ready-wait loop until `request_exit`, then tears down.
    /// Returns the requested retcode.
    pub async fn run(&mut self) -> i32 {
        let Some(mut inbox) = self.inbox.take() else {
            error!(router = %self.name, "loop started before open()");
            return 1;
        };

        self.add_timeout(LOG_AGGREGATE_INTERVAL, |router| {
            router.log_aggregate();
            true
        });
        self.add_timeout(ROUTE_PRUNE_INTERVAL, |router| {
            router.routing.prune(ROUTE_TTL);
            true
        });

        let cancel = self.control.cancel_token();
        info!(router = %self.name, "router loop running");

        loop {
            if self.control.should_exit() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout(READY_WAIT, inbox.recv()) => match received {
                    Ok(Some(event)) => {
                        self.handle_event(event);
                        // Drain whatever else is already queued
                        while let Ok(event) = inbox.try_recv() {
                            self.handle_event(event);
                            if self.control.should_exit() {
                                break;
                            }
                        }
                    }
                    // The inbox is this instance's only critical handle
                    Ok(None) => {
                        error!(router = %self.name, "event inbox closed, exiting");
                        self.control.request_exit(1);
                    }
                    Err(_elapsed) => {}
                }
            }

            if self.should_process_hangups {
                self.process_hangups();
            }
            self.fire_timeouts();
        }

        self.teardown().await;
        let retcode = self.control.retcode();
        info!(router = %self.name, retcode, "router loop exited");
        retcode
    }

    /// Builds a current-thread runtime and blocks on [`Self::run`]. This
    /// is what router threads call.
    pub fn run_blocking(mut self) -> i32 {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(router = %self.name, "failed to build runtime: {e}");
                return 1;
            }
        };
        runtime.block_on(self.run())
    }

    fn handle_event(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Frame { source, frame } => {
                // Learn the source route even for duplicates
                self.routing
                    .learn(source, frame.src_sysid(), frame.src_compid());

                if self.dedup.check_packet(&frame.raw) == PacketStatus::Duplicate {
                    trace!(router = %self.name, msg_id = frame.msg_id, "duplicate frame dropped");
                    return;
                }
                self.route_msg(source, &frame);
            }
            RouterEvent::EndpointClosed { id } => {
                if let Some(ep) = self.endpoints.get_mut(id).and_then(Option::as_mut) {
                    debug!(router = %self.name, endpoint = %ep.name, "endpoint reported closed");
                    ep.closed = true;
                    ep.state.set(EndpointState::Broken);
                    self.should_process_hangups = true;
                }
            }
            RouterEvent::TcpAccepted { stream, peer } => {
                self.add_accepted_tcp(stream, peer);
            }
        }
    }

    /// Offers `frame` to every endpoint except its source and submits it
    /// to those that accept. A frame nobody accepted or filtered counts
    /// into the unknown-destination aggregate.
    fn route_msg(&mut self, source: usize, frame: &Frame) {
        let mut unknown = true;

        for idx in 0..self.endpoints.len() {
            if idx == source {
                continue;
            }
            let mut hangup = false;
            {
                let Some(ep) = self.endpoints[idx].as_ref() else {
                    continue;
                };
                if ep.closed {
                    continue;
                }
                match ep.accept_msg(frame, &self.routing, self.sniffer_sysid) {
                    AcceptState::Accepted => {
                        unknown = false;
                        match ep.tx.try_send(frame.raw.clone()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                // Flow control: the writer is behind
                                ep.stats.on_tx_dropped();
                            }
                            Err(TrySendError::Closed(_)) => {
                                hangup = true;
                            }
                        }
                    }
                    AcceptState::Filtered => {
                        unknown = false;
                    }
                    AcceptState::Rejected => {}
                }
            }
            if hangup {
                if let Some(ep) = self.endpoints[idx].as_mut() {
                    ep.closed = true;
                    ep.state.set(EndpointState::Broken);
                }
                self.should_process_hangups = true;
            }
        }

        if unknown {
            self.msg_to_unknown += 1;
            trace!(
                router = %self.name,
                msg_id = frame.msg_id,
                target_sys = frame.target_sysid,
                target_comp = frame.target_compid,
                "message to unknown destination"
            );
        }
    }

    fn add_accepted_tcp(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Ok(events) = self.events_tx() else {
            return;
        };
        info!(router = %self.name, %peer, "accepted TCP client");

        let name = format!("tcp-client:{peer}");
        let (endpoint, ingress, outbound, state) = self.new_endpoint(
            &name,
            None,
            EndpointKind::TcpAccepted,
            Default::default(),
            0,
            &events,
        );
        let tracked_id = self.tracked.track(name.clone());
        let task = tokio::spawn(crate::endpoints::tcp::run_accepted(
            stream,
            ingress,
            outbound,
            state,
            self.control.cancel_token(),
        ));
        self.tracked.attach_task(tracked_id, &task);
        self.install_endpoint(endpoint, tracked_id);
        self.rebuild_group_peers();
    }

    /// Removes endpoints whose transport is gone and whose policy says
    /// not to retry. Reconnecting kinds stay in place.
    fn process_hangups(&mut self) {
        let mut removed = false;
        for idx in 0..self.endpoints.len() {
            let Some(ep) = self.endpoints[idx].as_ref() else {
                continue;
            };
            if !ep.closed || ep.kind.reconnects() {
                continue;
            }
            info!(router = %self.name, endpoint = %ep.name, kind = %ep.kind, "removing hung-up endpoint");
            let stats = ep.stats.clone();
            self.routing.remove_endpoint(idx);
            self.stats_registry
                .write()
                .retain(|h| !Arc::ptr_eq(&h.stats, &stats));
            if let Some(tracked_id) = self.endpoint_tracking.remove(&idx) {
                self.tracked.untrack(tracked_id);
            }
            self.endpoints[idx] = None;
            removed = true;
        }
        if removed {
            self.rebuild_group_peers();
        }
        self.should_process_hangups = false;
    }

    fn log_aggregate(&mut self) {
        if self.msg_to_unknown > 0 {
            warn!(
                router = %self.name,
                count = self.msg_to_unknown,
                interval_secs = LOG_AGGREGATE_INTERVAL.as_secs(),
                "messages to unknown destinations"
            );
            self.msg_to_unknown = 0;
        }
    }

    /// Final cleanup: the log endpoint stops first so its file flushes,
    /// endpoints are dropped, timeouts freed, every still-tracked handle
    /// force-closed. Safe to call more than once.
    pub async fn teardown(&mut self) {
        // Dropping the log endpoint's queue lets the writer flush and exit
        for slot in self.endpoints.iter_mut() {
            if matches!(slot, Some(ep) if ep.kind == EndpointKind::Log) {
                *slot = None;
            }
        }

        self.control.cancel.cancel();
        self.endpoints.clear();
        self.endpoint_tracking.clear();
        self.stats_registry.write().clear();
        self.timeouts.clear();
        self.inbox = None;
        self.events_tx = None;

        // Give tasks one scheduling round to observe cancellation
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.tracked.force_close_all();
        info!(router = %self.name, "router torn down");
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn test_config(toml: &str) -> Configuration {
        Configuration::from_toml_str(toml).expect("valid test config")
    }

    #[test]
    fn test_open_twice_is_busy() {
        let config = Configuration::default();
        let mut router = RouterInstance::new("test", &config.general);
        router.open().expect("first open");
        assert!(matches!(router.open(), Err(RouterError::Busy(_))));
    }

    #[test]
    fn test_request_exit_is_per_instance() {
        let config = Configuration::default();
        let a = RouterInstance::new("a", &config.general);
        let b = RouterInstance::new("b", &config.general);

        a.request_exit(7);
        assert!(a.control().should_exit());
        assert_eq!(a.control().retcode(), 7);
        assert!(!b.control().should_exit());
    }

    #[tokio::test]
    async fn test_run_returns_promptly_after_request_exit() {
        let config = Configuration::default();
        let mut router = RouterInstance::new("prompt", &config.general);
        router.open().expect("open");
        let control = router.control();

        let start = Instant::now();
        let handle = tokio::spawn(async move { router.run().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        control.request_exit(0);

        let retcode = handle.await.expect("join");
        assert_eq!(retcode, 0);
        // One ready-wait plus teardown slack
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_add_endpoints_partial_failure_keeps_tracked_handles() {
        // Three good client endpoints and a bad fourth
        let mut config = test_config(
            r#"
[[udp_endpoints]]
name = "a"
address = "127.0.0.1"
port = 24661
mode = "client"

[[udp_endpoints]]
name = "b"
address = "127.0.0.1"
port = 24662
mode = "client"

[[udp_endpoints]]
name = "c"
address = "127.0.0.1"
port = 24663
mode = "client"
"#,
        );
        config.udp_endpoints.push(crate::config::UdpEndpointConfig {
            name: "bad".to_string(),
            address: "definitely-not-a-host.invalid".to_string(),
            port: 1,
            mode: crate::config::UdpMode::Client,
            group: None,
            filters: Default::default(),
        });

        let mut router = RouterInstance::new("sweep", &config.general);
        router.open().expect("open");
        let tracked = router.tracked_handles();

        let result = router.add_endpoints(&config).await;
        assert!(result.is_err(), "fourth endpoint must fail the call");
        assert_eq!(tracked.len(), 3, "three opened handles stay tracked");

        router.teardown().await;
        assert!(tracked.is_empty(), "teardown closes every tracked handle");
    }

    #[tokio::test]
    async fn test_timeout_removed_when_callback_returns_false() {
        let config = Configuration::default();
        let mut router = RouterInstance::new("timeouts", &config.general);
        router.open().expect("open");

        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = fired.clone();
        router.add_timeout(Duration::from_millis(10), move |_| {
            fired_cb.fetch_add(1, Ordering::Relaxed) == 0
        });

        let control = router.control();
        let handle = tokio::spawn(async move { router.run().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        control.request_exit(0);
        handle.await.expect("join");

        // First firing rearms once, second removes; never a third
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_endpoint_count_and_group_peers() {
        let config = test_config(
            r#"
[[udp_endpoints]]
name = "a"
address = "127.0.0.1"
port = 24671
mode = "server"
group = "wing"

[[udp_endpoints]]
name = "b"
address = "127.0.0.1"
port = 24672
mode = "server"
group = "wing"

[[udp_endpoints]]
name = "c"
address = "127.0.0.1"
port = 24673
mode = "server"
"#,
        );
        let mut router = RouterInstance::new("groups", &config.general);
        router.open().expect("open");
        router.add_endpoints(&config).await.expect("add endpoints");

        assert_eq!(router.endpoint_count(), 3);
        let a = router.endpoints[0].as_ref().expect("endpoint a");
        assert_eq!(a.peers, vec![1]);
        let c = router.endpoints[2].as_ref().expect("endpoint c");
        assert!(c.peers.is_empty());

        router.teardown().await;
    }

    #[test]
    fn test_tracked_handles_bookkeeping() {
        let tracked = TrackedHandles::default();
        let a = tracked.track("socket-a");
        let b = tracked.track("socket-b");
        assert_eq!(tracked.len(), 2);

        tracked.untrack(a);
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked.descriptions(), vec!["socket-b".to_string()]);

        tracked.force_close_all();
        assert!(tracked.is_empty());
        // Untracking an unknown id is a no-op
        tracked.untrack(b);
    }
}

//! Per-endpoint statistics.
//!
//! Scalar counters are lock-free atomics bumped from the endpoint tasks and
//! the router thread; the rolling rate windows sit behind their own short
//! critical sections. A snapshot of everything is serialisable so the
//! statistics worker can log a periodic summary and optionally mirror the
//! numbers to a JSON file.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::filter::FilterReason;

/// Direction of a filtered message, for per-criterion accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Message arriving from the endpoint's transport.
    In,
    /// Message leaving toward the endpoint's transport.
    Out,
}

/// Sliding-window event rate, events per second over the last window.
struct RateWindow {
    events: VecDeque<(Instant, u64)>,
    window: Duration,
    total: u64,
}

impl RateWindow {
    fn new(window: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            window,
            total: 0,
        }
    }

    fn add(&mut self, count: u64) {
        self.events.push_back((Instant::now(), count));
        self.total += count;
        self.evict();
    }

    fn rate(&mut self) -> f64 {
        self.evict();
        self.total as f64 / self.window.as_secs_f64()
    }

    fn evict(&mut self) {
        let cutoff = Instant::now() - self.window;
        while let Some(&(t, n)) = self.events.front() {
            if t < cutoff {
                self.total -= n;
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Default)]
struct FilterCounters {
    msg_id_in: AtomicU64,
    src_sys_in: AtomicU64,
    src_comp_in: AtomicU64,
    msg_id_out: AtomicU64,
    src_sys_out: AtomicU64,
    src_comp_out: AtomicU64,
}

struct Rolling {
    message_rate: RateWindow,
    byte_rate: RateWindow,
    connected_since: Option<Instant>,
}

/// Counters for one endpoint. Cheap to share: endpoint task, router thread
/// and statistics worker all hold the same `Arc<EndpointStats>`.
pub struct EndpointStats {
    rx_messages: AtomicU64,
    tx_messages: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    v1_frames: AtomicU64,
    v2_frames: AtomicU64,
    malformed_bytes: AtomicU64,
    tx_dropped: AtomicU64,
    // Transport-specific
    no_peer_drops: AtomicU64,
    peer_changes: AtomicU64,
    reconnects: AtomicU64,
    baud_changes: AtomicU64,
    hw_errors: AtomicU64,
    filtered: FilterCounters,
    rolling: Mutex<Rolling>,
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointStats {
    /// Creates zeroed counters with a 5 s rate window.
    pub fn new() -> Self {
        Self {
            rx_messages: AtomicU64::new(0),
            tx_messages: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            v1_frames: AtomicU64::new(0),
            v2_frames: AtomicU64::new(0),
            malformed_bytes: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
            no_peer_drops: AtomicU64::new(0),
            peer_changes: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            baud_changes: AtomicU64::new(0),
            hw_errors: AtomicU64::new(0),
            filtered: FilterCounters::default(),
            rolling: Mutex::new(Rolling {
                message_rate: RateWindow::new(Duration::from_secs(5)),
                byte_rate: RateWindow::new(Duration::from_secs(5)),
                connected_since: None,
            }),
        }
    }

    /// A frame was parsed off this endpoint's transport.
    pub fn on_frame_received(&self, len: usize, is_v2: bool) {
        self.rx_messages.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);
        if is_v2 {
            self.v2_frames.fetch_add(1, Ordering::Relaxed);
        } else {
            self.v1_frames.fetch_add(1, Ordering::Relaxed);
        }
        let mut rolling = self.rolling.lock();
        rolling.message_rate.add(1);
        rolling.byte_rate.add(len as u64);
    }

    /// A frame left through this endpoint's transport.
    pub fn on_frame_written(&self, len: usize) {
        self.tx_messages.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Bytes discarded by the stream parser as garbage.
    pub fn on_malformed(&self, bytes: usize) {
        if bytes > 0 {
            self.malformed_bytes
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    /// The endpoint's tx queue was full; the frame was dropped.
    pub fn on_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A message was dropped by a filter.
    pub fn on_filtered(&self, direction: Direction, reason: FilterReason) {
        let counter = match (direction, reason) {
            (Direction::In, FilterReason::MsgId) => &self.filtered.msg_id_in,
            (Direction::In, FilterReason::SrcSys) => &self.filtered.src_sys_in,
            (Direction::In, FilterReason::SrcComp) => &self.filtered.src_comp_in,
            (Direction::Out, FilterReason::MsgId) => &self.filtered.msg_id_out,
            (Direction::Out, FilterReason::SrcSys) => &self.filtered.src_sys_out,
            (Direction::Out, FilterReason::SrcComp) => &self.filtered.src_comp_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// UDP server: write dropped because no peer was learned yet.
    pub fn on_no_peer_drop(&self) {
        self.no_peer_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// UDP server: the learned peer address changed.
    pub fn on_peer_change(&self) {
        self.peer_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// A reconnect attempt was made (TCP client, UART reopen).
    pub fn on_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// UART auto-baud moved to the next candidate rate.
    pub fn on_baud_change(&self) {
        self.baud_changes.fetch_add(1, Ordering::Relaxed);
    }

    /// UART hardware error observed.
    pub fn on_hw_error(&self) {
        self.hw_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// The transport reached its connected state.
    pub fn on_connected(&self) {
        self.rolling.lock().connected_since = Some(Instant::now());
    }

    /// The transport lost its connection.
    pub fn on_disconnected(&self) {
        self.rolling.lock().connected_since = None;
    }

    /// Messages dropped by the outgoing message-id filter. Used by tests
    /// and the summary.
    pub fn filtered_out_msg_id(&self) -> u64 {
        self.filtered.msg_id_out.load(Ordering::Relaxed)
    }

    /// Messages received so far.
    pub fn rx_messages(&self) -> u64 {
        self.rx_messages.load(Ordering::Relaxed)
    }

    /// Messages written so far.
    pub fn tx_messages(&self) -> u64 {
        self.tx_messages.load(Ordering::Relaxed)
    }

    /// Messages dropped because the tx queue was full.
    pub fn tx_dropped(&self) -> u64 {
        self.tx_dropped.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter plus derived rates.
    pub fn snapshot(&self) -> StatsSnapshot {
        let (message_rate, byte_rate, connection_secs) = {
            let mut rolling = self.rolling.lock();
            let msg = rolling.message_rate.rate();
            let bytes = rolling.byte_rate.rate();
            let conn = rolling
                .connected_since
                .map(|t| t.elapsed().as_secs_f64());
            (msg, bytes, conn)
        };
        let v1 = self.v1_frames.load(Ordering::Relaxed);
        let v2 = self.v2_frames.load(Ordering::Relaxed);

        StatsSnapshot {
            rx_messages: self.rx_messages.load(Ordering::Relaxed),
            tx_messages: self.tx_messages.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            v1_frames: v1,
            v2_frames: v2,
            v2_ratio: if v1 + v2 > 0 {
                v2 as f64 / (v1 + v2) as f64
            } else {
                0.0
            },
            malformed_bytes: self.malformed_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            no_peer_drops: self.no_peer_drops.load(Ordering::Relaxed),
            peer_changes: self.peer_changes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            baud_changes: self.baud_changes.load(Ordering::Relaxed),
            hw_errors: self.hw_errors.load(Ordering::Relaxed),
            filtered: FilteredSnapshot {
                msg_id_in: self.filtered.msg_id_in.load(Ordering::Relaxed),
                src_sys_in: self.filtered.src_sys_in.load(Ordering::Relaxed),
                src_comp_in: self.filtered.src_comp_in.load(Ordering::Relaxed),
                msg_id_out: self.filtered.msg_id_out.load(Ordering::Relaxed),
                src_sys_out: self.filtered.src_sys_out.load(Ordering::Relaxed),
                src_comp_out: self.filtered.src_comp_out.load(Ordering::Relaxed),
            },
            message_rate,
            byte_rate,
            connection_secs,
        }
    }
}

/// Serialisable copy of one endpoint's counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub rx_messages: u64,
    pub tx_messages: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub v1_frames: u64,
    pub v2_frames: u64,
    pub v2_ratio: f64,
    pub malformed_bytes: u64,
    pub tx_dropped: u64,
    pub no_peer_drops: u64,
    pub peer_changes: u64,
    pub reconnects: u64,
    pub baud_changes: u64,
    pub hw_errors: u64,
    pub filtered: FilteredSnapshot,
    pub message_rate: f64,
    pub byte_rate: f64,
    pub connection_secs: Option<f64>,
}

/// Per-criterion filter hit counts.
#[derive(Debug, Clone, Serialize)]
pub struct FilteredSnapshot {
    pub msg_id_in: u64,
    pub src_sys_in: u64,
    pub src_comp_in: u64,
    pub msg_id_out: u64,
    pub src_sys_out: u64,
    pub src_comp_out: u64,
}

/// Name + counters of one live endpoint, published by its router.
#[derive(Clone)]
pub struct EndpointStatsHandle {
    /// Configured endpoint name.
    pub name: String,
    /// Shared counters.
    pub stats: Arc<EndpointStats>,
}

/// Registry of live endpoints a router maintains for the statistics
/// worker. Endpoints are added by `add_endpoints` / dynamic TCP accepts
/// and removed by the hangup sweep.
pub type StatsRegistry = Arc<RwLock<Vec<EndpointStatsHandle>>>;

/// Creates an empty registry.
pub fn new_registry() -> StatsRegistry {
    Arc::new(RwLock::new(Vec::new()))
}

/// Process resource snapshot. Only populated on Linux; elsewhere both
/// readings come back `None`.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub rss_bytes: Option<u64>,
    pub open_fds: Option<u64>,
    pub fd_soft_limit: Option<u64>,
    pub near_fd_limit: bool,
}

impl ResourceUsage {
    /// Samples current process usage.
    pub fn sample() -> Self {
        let rss_bytes = read_rss_bytes();
        let open_fds = count_open_fds();
        let fd_soft_limit = read_fd_soft_limit();
        let near_fd_limit = match (open_fds, fd_soft_limit) {
            (Some(open), Some(limit)) if limit > 0 => open * 10 >= limit * 9,
            _ => false,
        };
        Self {
            rss_bytes,
            open_fds,
            fd_soft_limit,
            near_fd_limit,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn count_open_fds() -> Option<u64> {
    Some(std::fs::read_dir("/proc/self/fd").ok()?.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn count_open_fds() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_fd_soft_limit() -> Option<u64> {
    let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
    let line = limits.lines().find(|l| l.starts_with("Max open files"))?;
    line.split_whitespace().nth(3)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn read_fd_soft_limit() -> Option<u64> {
    None
}

/// Logs a one-line summary per endpoint.
pub fn log_summary(registry: &StatsRegistry) {
    for handle in registry.read().iter() {
        let snap = handle.stats.snapshot();
        info!(
            endpoint = %handle.name,
            rx = snap.rx_messages,
            tx = snap.tx_messages,
            rate_per_sec = snap.message_rate,
            dropped = snap.tx_dropped,
            malformed = snap.malformed_bytes,
            "endpoint statistics"
        );
    }
}

/// Serialises every endpoint snapshot plus a resource sample to `path`.
pub fn write_json_snapshot(registry: &StatsRegistry, path: &Path) -> crate::error::Result<()> {
    #[derive(Serialize)]
    struct FileSnapshot {
        endpoints: Vec<NamedSnapshot>,
        resources: ResourceUsage,
    }
    #[derive(Serialize)]
    struct NamedSnapshot {
        name: String,
        #[serde(flatten)]
        stats: StatsSnapshot,
    }

    let endpoints = registry
        .read()
        .iter()
        .map(|h| NamedSnapshot {
            name: h.name.clone(),
            stats: h.stats.snapshot(),
        })
        .collect();

    let snapshot = FileSnapshot {
        endpoints,
        resources: ResourceUsage::sample(),
    };

    let file = std::fs::File::create(path)
        .map_err(|e| crate::error::RouterError::filesystem(path.display().to_string(), e))?;
    serde_json::to_writer_pretty(file, &snapshot)
        .map_err(|e| crate::error::RouterError::internal(e.to_string()))?;
    Ok(())
}

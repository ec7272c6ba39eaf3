//! Extension routers: secondary router instances in their own threads.
//!
//! The primary configuration reserves endpoint slots named
//! `internal-router-point-N`, `udp-extension-point-N` or
//! `tcp-extension-point-N`. Creating an extension claims the first free
//! slot of the matching pool, synthesises a secondary router configuration
//! bridging the slot to the caller's peer, and launches a thread that owns
//! an independent [`RouterInstance`] — its own dedup cache, exit flag and
//! tracked-handle map. Stopping an extension signals exactly that
//! instance; the primary router is never touched.
//!
//! Every extension is persisted to `<conf_dir>/extension_<name>.json` and
//! reloaded on startup by scanning the directory.

use crate::config::{
    Configuration, GeneralConfig, TcpEndpointConfig, UdpEndpointConfig, UdpMode,
};
use crate::error::{Result, RouterError};
use crate::router::{RouterControl, RouterInstance};
use crate::threads::{ThreadContext, ThreadManager};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Name prefix of internal extension-point slots (UDP pool).
pub const INTERNAL_POINT_PREFIX: &str = "internal-router-point";
/// Name prefix of UDP extension-point slots.
pub const UDP_POINT_PREFIX: &str = "udp-extension-point";
/// Name prefix of TCP extension-point slots.
pub const TCP_POINT_PREFIX: &str = "tcp-extension-point";

const INSTANCE_WAIT_ATTEMPTS: u32 = 20;
const INSTANCE_WAIT_SLICE: Duration = Duration::from_millis(50);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const FORCE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_PEER_RETRY_MS: u64 = 5000;

/// Kind of extension, selecting the slot pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionType {
    Internal,
    Tcp,
    Udp,
}

impl ExtensionType {
    fn pool_prefix(&self) -> &'static str {
        match self {
            ExtensionType::Internal => INTERNAL_POINT_PREFIX,
            ExtensionType::Tcp => TCP_POINT_PREFIX,
            ExtensionType::Udp => UDP_POINT_PREFIX,
        }
    }

    /// Lowercase name used in persistence and the management plane.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionType::Internal => "internal",
            ExtensionType::Tcp => "tcp",
            ExtensionType::Udp => "udp",
        }
    }
}

/// Persisted extension description, the content of
/// `extension_<name>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Unique extension name.
    pub name: String,
    /// Pool-selecting kind.
    #[serde(rename = "type")]
    pub kind: ExtensionType,
    /// Peer address the secondary router uplinks to.
    pub address: String,
    /// Peer port.
    pub port: u16,
    /// Claimed slot name; always auto-assigned, client input is ignored.
    #[serde(default)]
    pub assigned_extension_point: String,
    /// Full configuration of the secondary router thread.
    #[serde(default)]
    pub extension_thread_config: ExtensionThreadConfig,
}

/// Endpoint layout of the secondary router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionThreadConfig {
    /// `general` block of the secondary router.
    #[serde(default)]
    pub general: ExtensionGeneral,
    /// UDP endpoints (slot in server mode + peer client).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub udp_endpoints: Vec<UdpEndpointConfig>,
    /// TCP endpoints (slot + peer client with retry).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tcp_endpoints: Vec<TcpEndpointConfig>,
}

/// `general` block of the secondary router's configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionGeneral {
    /// Random listener port drawn from [50000, 60000).
    #[serde(default, alias = "tcpServerPort")]
    pub tcp_server_port: Option<u16>,
}

impl ExtensionThreadConfig {
    fn to_configuration(&self) -> Configuration {
        Configuration {
            general: GeneralConfig {
                tcp_server_port: self.general.tcp_server_port,
                ..GeneralConfig::default()
            },
            udp_endpoints: self.udp_endpoints.clone(),
            tcp_endpoints: self.tcp_endpoints.clone(),
            ..Configuration::default()
        }
    }
}

/// In-memory record of one extension.
pub struct ExtensionRecord {
    /// The persisted configuration, kept for restarts.
    pub config: ExtensionConfig,
    /// Thread-manager id of the current (or last) thread.
    pub thread_id: u32,
    /// True while the extension thread is supposed to run.
    pub running: bool,
    /// Control of the thread's router instance, published by the thread
    /// itself before it enters its loop.
    pub control: Option<RouterControl>,
}

/// Management-plane view of one extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionStatus {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExtensionType,
    pub address: String,
    pub port: u16,
    pub assigned_extension_point: String,
    pub thread_id: u32,
    pub running: bool,
}

type ExtensionMap = Arc<Mutex<HashMap<String, ExtensionRecord>>>;

/// Owns the set of extension routers.
pub struct ExtensionManager {
    thread_manager: Arc<ThreadManager>,
    extensions: ExtensionMap,
    conf_dir: Mutex<PathBuf>,
    global_config: Mutex<Option<Arc<Configuration>>>,
}

impl ExtensionManager {
    /// Creates a manager with no extensions.
    pub fn new(thread_manager: Arc<ThreadManager>) -> Self {
        Self {
            thread_manager,
            extensions: Arc::new(Mutex::new(HashMap::new())),
            conf_dir: Mutex::new(PathBuf::from("config")),
            global_config: Mutex::new(None),
        }
    }

    /// Sets the directory persisted configs live in.
    pub fn set_conf_dir(&self, dir: impl Into<PathBuf>) {
        *self.conf_dir.lock() = dir.into();
    }

    /// Sets the primary router's configuration, the source of the
    /// extension-point pools.
    pub fn set_global_config(&self, config: Arc<Configuration>) {
        *self.global_config.lock() = Some(config);
    }

    fn config_file_path(&self, name: &str) -> PathBuf {
        self.conf_dir.lock().join(format!("extension_{name}.json"))
    }

    /// Picks the first slot of the pool matching `kind` that no existing
    /// extension has claimed.
    fn assign_extension_point(
        global: &Configuration,
        used: &HashSet<String>,
        kind: ExtensionType,
    ) -> Option<String> {
        let prefix = kind.pool_prefix();
        match kind {
            ExtensionType::Tcp => global
                .tcp_endpoints
                .iter()
                .map(|ep| &ep.name)
                .find(|name| name.contains(prefix) && !used.contains(*name))
                .cloned(),
            _ => global
                .udp_endpoints
                .iter()
                .map(|ep| &ep.name)
                .find(|name| name.contains(prefix) && !used.contains(*name))
                .cloned(),
        }
    }

    /// Creates, launches and persists a new extension. The supplied
    /// `assigned_extension_point` is ignored; a slot is always
    /// auto-assigned from the pool of the extension's type.
    pub fn create_extension(&self, config: ExtensionConfig) -> Result<ExtensionStatus> {
        let global = self
            .global_config
            .lock()
            .clone()
            .ok_or_else(|| RouterError::extension("global configuration not set"))?;

        if config.name.is_empty() || config.address.is_empty() || config.port == 0 {
            return Err(RouterError::extension(
                "extension needs a name, an address and a non-zero port",
            ));
        }

        let mut extensions = self.extensions.lock();
        if extensions.contains_key(&config.name) {
            return Err(RouterError::extension(format!(
                "extension '{}' already exists",
                config.name
            )));
        }

        if !config.assigned_extension_point.is_empty() {
            info!(
                extension = %config.name,
                supplied = %config.assigned_extension_point,
                "ignoring client-supplied extension point, auto-assigning"
            );
        }

        let used: HashSet<String> = extensions
            .values()
            .map(|r| r.config.assigned_extension_point.clone())
            .filter(|p| !p.is_empty())
            .collect();

        let point = Self::assign_extension_point(&global, &used, config.kind).ok_or_else(
            || RouterError::NoAvailableExtensionPoints(config.kind.as_str().to_string()),
        )?;

        let mut config = config;
        config.assigned_extension_point = point.clone();
        config.extension_thread_config =
            Self::build_thread_config(&global, &config, &point)?;

        info!(
            extension = %config.name,
            point = %point,
            kind = config.kind.as_str(),
            "extension point assigned"
        );

        // Insert the record before launching so the thread can publish
        // its instance control into it
        extensions.insert(
            config.name.clone(),
            ExtensionRecord {
                config: config.clone(),
                thread_id: 0,
                running: false,
                control: None,
            },
        );

        let thread_id = self.launch_extension_thread(&config)?;
        let record = extensions
            .get_mut(&config.name)
            .ok_or_else(|| RouterError::internal("extension record vanished"))?;
        record.thread_id = thread_id;
        record.running = true;
        let status = record_status(record);

        self.persist_locked(&config)?;
        Ok(status)
    }

    fn build_thread_config(
        global: &Configuration,
        config: &ExtensionConfig,
        point: &str,
    ) -> Result<ExtensionThreadConfig> {
        let listener_port = rand::thread_rng().gen_range(50000..60000u16);
        let mut thread_config = ExtensionThreadConfig {
            general: ExtensionGeneral {
                tcp_server_port: Some(listener_port),
            },
            ..Default::default()
        };

        match config.kind {
            ExtensionType::Internal | ExtensionType::Udp => {
                let slot = global.find_udp(point).ok_or_else(|| {
                    RouterError::extension(format!("extension point '{point}' not in configuration"))
                })?;
                // The slot listens inside the secondary router
                let mut slot = slot.clone();
                slot.mode = UdpMode::Server;
                thread_config.udp_endpoints.push(slot);
                // The uplink to the extension peer
                thread_config.udp_endpoints.push(UdpEndpointConfig {
                    name: config.name.clone(),
                    address: config.address.clone(),
                    port: config.port,
                    mode: UdpMode::Client,
                    group: None,
                    filters: Default::default(),
                });
            }
            ExtensionType::Tcp => {
                let slot = global.find_tcp(point).ok_or_else(|| {
                    RouterError::extension(format!("extension point '{point}' not in configuration"))
                })?;
                thread_config.tcp_endpoints.push(slot.clone());
                thread_config.tcp_endpoints.push(TcpEndpointConfig {
                    name: config.name.clone(),
                    address: config.address.clone(),
                    port: config.port,
                    retry_timeout_ms: TCP_PEER_RETRY_MS,
                    group: None,
                    filters: Default::default(),
                });
            }
        }

        Ok(thread_config)
    }

    fn launch_extension_thread(&self, config: &ExtensionConfig) -> Result<u32> {
        let name = config.name.clone();
        let thread_config = config.extension_thread_config.to_configuration();
        let extensions = self.extensions.clone();

        let thread_id = self
            .thread_manager
            .create_thread(move |ctx| run_extension_thread(name, thread_config, extensions, ctx))?;
        self.thread_manager
            .register_thread(thread_id, format!("extension_{}", config.name))?;
        info!(extension = %config.name, thread_id, "extension thread launched");
        Ok(thread_id)
    }

    /// Stops an extension: waits (bounded) for the thread to have
    /// published its instance control, signals exit on that specific
    /// instance, joins the thread and unregisters it.
    pub fn stop_extension(&self, name: &str) -> Result<()> {
        let mut control = None;
        let mut thread_id = 0;

        for attempt in 0..INSTANCE_WAIT_ATTEMPTS {
            {
                let extensions = self.extensions.lock();
                let record = extensions.get(name).ok_or_else(|| {
                    RouterError::extension(format!("extension '{name}' not found"))
                })?;
                if !record.running {
                    return Ok(());
                }
                thread_id = record.thread_id;
                if let Some(c) = &record.control {
                    control = Some(c.clone());
                }
            }
            if control.is_some() {
                break;
            }
            // Released the map around the sleep so other callers proceed
            if attempt + 1 < INSTANCE_WAIT_ATTEMPTS {
                std::thread::sleep(INSTANCE_WAIT_SLICE);
            }
        }

        match &control {
            Some(control) => {
                // Exit signal for this specific instance only
                info!(extension = name, "requesting extension router exit");
                control.request_exit(0);
                match self.thread_manager.join_thread(thread_id, STOP_JOIN_TIMEOUT) {
                    Ok(true) => info!(extension = name, "extension thread exited"),
                    Ok(false) => {
                        warn!(extension = name, "extension thread did not exit within timeout")
                    }
                    Err(e) => warn!(extension = name, "join failed: {e}"),
                }
            }
            None => {
                warn!(
                    extension = name,
                    "instance control never published, forcing thread stop"
                );
                let _ = self.thread_manager.stop_thread(thread_id);
                let _ = self
                    .thread_manager
                    .join_thread(thread_id, FORCE_JOIN_TIMEOUT);
            }
        }

        let _ = self
            .thread_manager
            .unregister_thread(&format!("extension_{name}"));

        let mut extensions = self.extensions.lock();
        if let Some(record) = extensions.get_mut(name) {
            record.running = false;
            record.control = None;
        }
        Ok(())
    }

    /// Relaunches a previously stopped extension with its retained
    /// configuration.
    pub fn start_extension(&self, name: &str) -> Result<ExtensionStatus> {
        let config = {
            let extensions = self.extensions.lock();
            let record = extensions
                .get(name)
                .ok_or_else(|| RouterError::extension(format!("extension '{name}' not found")))?;
            if record.running {
                return Ok(record_status(record));
            }
            record.config.clone()
        };

        // Best-effort cleanup of the previous thread registration
        let _ = self
            .thread_manager
            .unregister_thread(&format!("extension_{name}"));

        let thread_id = self.launch_extension_thread(&config)?;
        let mut extensions = self.extensions.lock();
        let record = extensions
            .get_mut(name)
            .ok_or_else(|| RouterError::extension(format!("extension '{name}' not found")))?;
        record.thread_id = thread_id;
        record.running = true;
        Ok(record_status(record))
    }

    /// Stops the extension, removes its persisted config and forgets it.
    pub fn delete_extension(&self, name: &str) -> Result<()> {
        self.stop_extension(name)?;

        let path = self.config_file_path(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(extension = name, "could not remove {}: {e}", path.display());
            }
        }

        self.extensions.lock().remove(name);
        info!(extension = name, "extension deleted");
        Ok(())
    }

    /// Status of one extension.
    pub fn status(&self, name: &str) -> Result<ExtensionStatus> {
        let extensions = self.extensions.lock();
        let record = extensions
            .get(name)
            .ok_or_else(|| RouterError::extension(format!("extension '{name}' not found")))?;
        Ok(record_status(record))
    }

    /// Status of every extension, sorted by name.
    pub fn status_all(&self) -> Vec<ExtensionStatus> {
        let mut all: Vec<ExtensionStatus> =
            self.extensions.lock().values().map(record_status).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Control of a running extension's router instance, mainly for tests.
    pub fn instance_control(&self, name: &str) -> Option<RouterControl> {
        self.extensions.lock().get(name)?.control.clone()
    }

    fn persist_locked(&self, config: &ExtensionConfig) -> Result<()> {
        let path = self.config_file_path(&config.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RouterError::filesystem(parent.display().to_string(), e))?;
        }
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| RouterError::internal(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| RouterError::filesystem(path.display().to_string(), e))?;
        info!(extension = %config.name, "saved {}", path.display());
        Ok(())
    }

    /// Scans `dir` for `extension_*.json` files and recreates each one.
    /// Returns how many were loaded; individual failures are logged and
    /// skipped.
    pub fn load_extension_configs(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot open extension config directory {}: {e}", dir.display());
                return Ok(0);
            }
        };

        let mut loaded = 0;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("extension_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| RouterError::filesystem(path.display().to_string(), e))
                .and_then(|content| {
                    serde_json::from_str::<ExtensionConfig>(&content)
                        .map_err(|e| RouterError::config(e.to_string()))
                });
            match parsed {
                Ok(config) => match self.create_extension(config) {
                    Ok(status) => {
                        info!(extension = %status.name, "extension loaded from {}", path.display());
                        loaded += 1;
                    }
                    Err(e) => error!("could not recreate extension from {}: {e}", path.display()),
                },
                Err(e) => error!("could not parse {}: {e}", path.display()),
            }
        }
        Ok(loaded)
    }

    /// Stops every running extension. Used at process shutdown.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.extensions.lock().keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop_extension(&name) {
                warn!(extension = %name, "stop failed: {e}");
            }
        }
    }
}

fn record_status(record: &ExtensionRecord) -> ExtensionStatus {
    ExtensionStatus {
        name: record.config.name.clone(),
        kind: record.config.kind,
        address: record.config.address.clone(),
        port: record.config.port,
        assigned_extension_point: record.config.assigned_extension_point.clone(),
        thread_id: record.thread_id,
        running: record.running,
    }
}

/// Body of an extension thread.
///
/// Creates an independent router instance, publishes its control into the
/// extension record, then opens it, adds endpoints and enters the loop.
/// The outer scope is guarded: whatever way the inner body terminates —
/// normal exit, error or panic — the tracked-handle sweep runs and the
/// record is marked stopped. The primary router is never involved.
fn run_extension_thread(
    name: String,
    config: Configuration,
    extensions: ExtensionMap,
    ctx: ThreadContext,
) {
    info!(extension = %name, "extension thread starting");

    let mut router = RouterInstance::new(format!("extension-{name}"), &config.general);
    let control = router.control();
    let tracked = router.tracked_handles();

    {
        let mut map = extensions.lock();
        if let Some(record) = map.get_mut(&name) {
            record.control = Some(control.clone());
        } else {
            error!(extension = %name, "record missing, control not published");
        }
    }

    let ctx_control = control.clone();
    let result = std::panic::catch_unwind(AssertUnwindSafe(move || -> Result<i32> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RouterError::internal(format!("runtime build failed: {e}")))?;

        runtime.block_on(async move {
            router.open()?;
            router.add_endpoints(&config).await?;

            // Mirror the thread-manager stop flag onto this instance
            let watcher_ctx = ctx.clone();
            let watcher_control = ctx_control.clone();
            let watcher = tokio::spawn(async move {
                loop {
                    if watcher_ctx.should_stop() {
                        watcher_control.request_exit(0);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });

            let retcode = router.run().await;
            watcher.abort();
            Ok(retcode)
        })
    }));

    match result {
        Ok(Ok(retcode)) => info!(extension = %name, retcode, "extension loop exited"),
        Ok(Err(e)) => error!(extension = %name, "extension failed: {e}"),
        Err(_) => error!(extension = %name, "extension thread panicked"),
    }

    // Unconditional final cleanup: whatever is still open gets closed
    tracked.force_close_all();
    {
        let mut map = extensions.lock();
        if let Some(record) = map.get_mut(&name) {
            record.control = None;
            record.running = false;
        }
    }
    info!(extension = %name, "extension thread finished");
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn pool_config() -> Arc<Configuration> {
        let toml = r#"
[[udp_endpoints]]
name = "internal-router-point-1"
address = "127.0.0.1"
port = 25101
mode = "client"

[[udp_endpoints]]
name = "udp-extension-point-1"
address = "127.0.0.1"
port = 25111
mode = "client"

[[udp_endpoints]]
name = "udp-extension-point-2"
address = "127.0.0.1"
port = 25112
mode = "client"

[[tcp_endpoints]]
name = "tcp-extension-point-1"
address = "127.0.0.1"
port = 25121
retry_timeout_ms = 0
"#;
        Arc::new(Configuration::from_toml_str(toml).expect("pool config"))
    }

    fn manager_with_pool(dir: &Path) -> ExtensionManager {
        let manager = ExtensionManager::new(Arc::new(ThreadManager::new()));
        manager.set_conf_dir(dir);
        manager.set_global_config(pool_config());
        manager
    }

    fn udp_extension(name: &str, port: u16) -> ExtensionConfig {
        ExtensionConfig {
            name: name.to_string(),
            kind: ExtensionType::Udp,
            address: "127.0.0.1".to_string(),
            port,
            assigned_extension_point: String::new(),
            extension_thread_config: Default::default(),
        }
    }

    #[test]
    fn test_auto_assignment_never_shares_points() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_pool(dir.path());

        let first = manager
            .create_extension(udp_extension("x1", 20001))
            .expect("create x1");
        let second = manager
            .create_extension(udp_extension("x2", 20002))
            .expect("create x2");

        assert_ne!(
            first.assigned_extension_point,
            second.assigned_extension_point
        );
        assert!(first.assigned_extension_point.starts_with(UDP_POINT_PREFIX));

        // Pool exhausted on the third
        let third = manager.create_extension(udp_extension("x3", 20003));
        assert!(matches!(
            third,
            Err(RouterError::NoAvailableExtensionPoints(_))
        ));

        manager.stop_all();
    }

    #[test]
    fn test_client_supplied_point_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_pool(dir.path());

        let mut config = udp_extension("pushy", 20010);
        config.assigned_extension_point = "udp-extension-point-2".to_string();
        let status = manager.create_extension(config).expect("create");

        // First free slot wins, not the requested one
        assert_eq!(status.assigned_extension_point, "udp-extension-point-1");
        manager.stop_all();
    }

    #[test]
    fn test_internal_uses_internal_pool_and_builds_udp_bridge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_pool(dir.path());

        let config = ExtensionConfig {
            name: "bridge".to_string(),
            kind: ExtensionType::Internal,
            address: "127.0.0.1".to_string(),
            port: 20020,
            assigned_extension_point: String::new(),
            extension_thread_config: Default::default(),
        };
        let status = manager.create_extension(config).expect("create");
        assert_eq!(status.assigned_extension_point, "internal-router-point-1");

        let record_config = manager
            .extensions
            .lock()
            .get("bridge")
            .expect("record")
            .config
            .clone();
        let thread_cfg = &record_config.extension_thread_config;
        assert_eq!(thread_cfg.udp_endpoints.len(), 2);
        assert_eq!(thread_cfg.udp_endpoints[0].mode, UdpMode::Server);
        assert_eq!(thread_cfg.udp_endpoints[1].mode, UdpMode::Client);
        assert_eq!(thread_cfg.udp_endpoints[1].port, 20020);
        let listener = thread_cfg.general.tcp_server_port.expect("random port");
        assert!((50000..60000).contains(&listener));

        manager.stop_all();
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_pool(dir.path());

        let status = manager
            .create_extension(udp_extension("persisted", 20030))
            .expect("create");
        manager.stop_extension("persisted").expect("stop");

        let path = dir.path().join("extension_persisted.json");
        let content = std::fs::read_to_string(&path).expect("file exists");
        let reloaded: ExtensionConfig = serde_json::from_str(&content).expect("parse");

        assert_eq!(reloaded.name, "persisted");
        assert_eq!(reloaded.kind, ExtensionType::Udp);
        assert_eq!(reloaded.port, 20030);
        assert_eq!(
            reloaded.assigned_extension_point,
            status.assigned_extension_point
        );
        assert_eq!(reloaded.extension_thread_config.udp_endpoints.len(), 2);

        // A fresh manager recreates the same extension from disk
        let manager2 = manager_with_pool(dir.path());
        let loaded = manager2
            .load_extension_configs(dir.path())
            .expect("load configs");
        assert_eq!(loaded, 1);
        let status2 = manager2.status("persisted").expect("status");
        assert_eq!(
            status2.assigned_extension_point,
            status.assigned_extension_point
        );
        manager2.stop_all();
    }

    #[test]
    fn test_delete_removes_record_and_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_pool(dir.path());

        manager
            .create_extension(udp_extension("gone", 20040))
            .expect("create");
        let path = dir.path().join("extension_gone.json");
        assert!(path.exists());

        manager.delete_extension("gone").expect("delete");
        assert!(!path.exists());
        assert!(manager.status("gone").is_err());

        // The freed slot is assignable again
        let status = manager
            .create_extension(udp_extension("next", 20041))
            .expect("create after delete");
        assert_eq!(status.assigned_extension_point, "udp-extension-point-1");
        manager.stop_all();
    }

    #[test]
    fn test_unknown_extension_operations_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = manager_with_pool(dir.path());
        assert!(manager.stop_extension("ghost").is_err());
        assert!(manager.status("ghost").is_err());
        assert!(manager.start_extension("ghost").is_err());
    }
}

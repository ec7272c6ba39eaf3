//! RPC-shaped command surface over the thread manager.
//!
//! The controller translates symbolic operations (`start|stop|pause|resume|
//! restart|status`) on symbolic targets (`mainloop|http_server|statistics|
//! all`) into thread-manager calls. It holds the name registry, the
//! attachment map, the restart callbacks, and the per-name
//! [`RouterControl`]s — all behind one mutex.
//!
//! Stopping a router thread goes through the control registered under that
//! exact name: there is no ambient or singleton router to confuse it with.
//! Stopping `all` spares `http_server`, keeping the management plane
//! reachable.

use crate::error::Result;
use crate::router::RouterControl;
use crate::threads::{ThreadManager, ThreadState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Name of the primary router thread.
pub const MAINLOOP: &str = "mainloop";
/// Name of the management-plane thread; exempt from `stop all`.
pub const HTTP_SERVER: &str = "http_server";
/// Name of the statistics thread.
pub const STATISTICS: &str = "statistics";

const RESTART_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const CLEANUP_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A symbolic command operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
    Status,
}

/// A symbolic command target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Mainloop,
    HttpServer,
    Statistics,
    All,
}

impl Target {
    /// The registry name for a specific target, `None` for `All`.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Target::Mainloop => Some(MAINLOOP),
            Target::HttpServer => Some(HTTP_SERVER),
            Target::Statistics => Some(STATISTICS),
            Target::All => None,
        }
    }
}

impl std::str::FromStr for Target {
    type Err = crate::error::RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainloop" => Ok(Target::Mainloop),
            "http_server" => Ok(Target::HttpServer),
            "statistics" => Ok(Target::Statistics),
            "all" => Ok(Target::All),
            other => Err(crate::error::RouterError::config(format!(
                "unknown target '{other}'"
            ))),
        }
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Failed,
    ThreadNotFound,
    InvalidOperation,
    AlreadyInState,
    Timeout,
}

/// Point-in-time view of one registered thread.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSnapshot {
    pub thread_id: u32,
    pub state: ThreadState,
    pub is_alive: bool,
    pub attachment_id: String,
}

/// Response envelope of every command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub status: OperationStatus,
    pub message: String,
    pub threads: BTreeMap<String, ThreadSnapshot>,
}

impl CommandResponse {
    fn new(status: OperationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            threads: BTreeMap::new(),
        }
    }
}

/// What a restart callback reports after spawning a fresh thread.
pub struct SpawnedThread {
    /// Thread-manager id of the new thread.
    pub thread_id: u32,
    /// Attachment id registered with the thread manager.
    pub attachment: String,
    /// Control of the router instance the thread owns, if it owns one.
    pub control: Option<RouterControl>,
}

type RestartCallback = Box<dyn Fn() -> Result<SpawnedThread> + Send>;

#[derive(Default)]
struct Registry {
    threads: HashMap<String, u32>,
    attachments: HashMap<String, String>,
    restart_callbacks: HashMap<String, RestartCallback>,
    controls: HashMap<String, RouterControl>,
}

/// Translates management commands into thread-manager operations.
pub struct Controller {
    thread_manager: Arc<ThreadManager>,
    registry: Mutex<Registry>,
}

impl Controller {
    /// Creates a controller over `thread_manager`.
    pub fn new(thread_manager: Arc<ThreadManager>) -> Self {
        Self {
            thread_manager,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Registers a thread under a symbolic name.
    pub fn register_thread(
        &self,
        name: &str,
        thread_id: u32,
        attachment: &str,
        control: Option<RouterControl>,
    ) -> Result<()> {
        self.thread_manager.register_thread(thread_id, attachment)?;
        let mut registry = self.registry.lock();
        registry.threads.insert(name.to_string(), thread_id);
        registry
            .attachments
            .insert(name.to_string(), attachment.to_string());
        if let Some(control) = control {
            registry.controls.insert(name.to_string(), control);
        }
        info!(name, thread_id, attachment, "thread registered");
        Ok(())
    }

    /// Registers the callback used to (re)create the named thread.
    pub fn register_restart_callback(
        &self,
        name: &str,
        callback: impl Fn() -> Result<SpawnedThread> + Send + 'static,
    ) {
        self.registry
            .lock()
            .restart_callbacks
            .insert(name.to_string(), Box::new(callback));
        info!(name, "restart callback registered");
    }

    /// Drops all bookkeeping for a name (best-effort on the attachment).
    pub fn unregister_thread(&self, name: &str) {
        let mut registry = self.registry.lock();
        registry.threads.remove(name);
        registry.controls.remove(name);
        if let Some(attachment) = registry.attachments.remove(name) {
            if let Err(e) = self.thread_manager.unregister_thread(&attachment) {
                warn!(name, "could not unregister attachment: {e}");
            }
        }
    }

    /// Executes `operation` on `target` and reports the outcome with
    /// per-thread snapshots.
    pub fn execute(&self, operation: Operation, target: Target) -> CommandResponse {
        let mut names = self.names_for_target(target);
        if operation == Operation::Stop && target == Target::All {
            // The management plane must stay available
            names.retain(|n| n != HTTP_SERVER);
        }

        if names.is_empty() {
            return CommandResponse::new(
                OperationStatus::ThreadNotFound,
                "no threads found for target",
            );
        }

        if names.len() == 1 {
            return self.execute_on(&names[0], operation);
        }

        let mut merged = CommandResponse::new(OperationStatus::Success, "operation completed");
        let mut failures = Vec::new();
        for name in &names {
            let response = self.execute_on(name, operation);
            if !matches!(
                response.status,
                OperationStatus::Success | OperationStatus::AlreadyInState
            ) {
                failures.push(format!("{name}: {}", response.message));
            }
            merged.threads.extend(response.threads);
        }
        if !failures.is_empty() {
            merged.status = OperationStatus::Failed;
            merged.message = failures.join("; ");
        }
        merged
    }

    fn names_for_target(&self, target: Target) -> Vec<String> {
        let registry = self.registry.lock();
        match target.name() {
            Some(name) => {
                if registry.threads.contains_key(name)
                    || registry.restart_callbacks.contains_key(name)
                {
                    vec![name.to_string()]
                } else {
                    Vec::new()
                }
            }
            None => {
                let mut names: Vec<String> = registry.threads.keys().cloned().collect();
                for name in registry.restart_callbacks.keys() {
                    if !registry.threads.contains_key(name) {
                        names.push(name.clone());
                    }
                }
                names.sort();
                names
            }
        }
    }

    fn execute_on(&self, name: &str, operation: Operation) -> CommandResponse {
        let mut response = match operation {
            Operation::Start => self.start_thread(name),
            Operation::Stop => self.stop_thread(name),
            Operation::Pause => self.flag_thread(name, true),
            Operation::Resume => self.flag_thread(name, false),
            Operation::Restart => self.restart_thread(name),
            Operation::Status => CommandResponse::new(OperationStatus::Success, "status"),
        };

        if matches!(
            response.status,
            OperationStatus::Success | OperationStatus::AlreadyInState
        ) {
            if let Some(snapshot) = self.snapshot(name) {
                response.threads.insert(name.to_string(), snapshot);
            }
        }
        response
    }

    /// Snapshot of a registered thread, `None` when unregistered.
    pub fn snapshot(&self, name: &str) -> Option<ThreadSnapshot> {
        let registry = self.registry.lock();
        let thread_id = *registry.threads.get(name)?;
        let attachment_id = registry.attachments.get(name).cloned().unwrap_or_default();
        let state = self
            .thread_manager
            .get_state(thread_id)
            .unwrap_or(ThreadState::Error);
        let is_alive = self.thread_manager.is_alive(thread_id).unwrap_or(false);
        Some(ThreadSnapshot {
            thread_id,
            state,
            is_alive,
            attachment_id,
        })
    }

    /// Snapshots of every registered thread.
    pub fn status_all(&self) -> CommandResponse {
        let names: Vec<String> = self.registry.lock().threads.keys().cloned().collect();
        let mut response = CommandResponse::new(OperationStatus::Success, "status");
        for name in names {
            if let Some(snapshot) = self.snapshot(&name) {
                response.threads.insert(name, snapshot);
            }
        }
        response
    }

    fn start_thread(&self, name: &str) -> CommandResponse {
        let existing = {
            let registry = self.registry.lock();
            registry.threads.get(name).copied()
        };

        if let Some(thread_id) = existing {
            if self.thread_manager.is_alive(thread_id).unwrap_or(false) {
                return CommandResponse::new(
                    OperationStatus::AlreadyInState,
                    "thread is already running",
                );
            }
            // Dead registration: clean it up before recreating
            info!(name, thread_id, "thread not alive, cleaning up old registration");
            let _ = self.thread_manager.stop_thread(thread_id);
            let _ = self
                .thread_manager
                .join_thread(thread_id, CLEANUP_JOIN_TIMEOUT);
            self.unregister_thread(name);
        }

        self.invoke_restart_callback(name)
    }

    fn invoke_restart_callback(&self, name: &str) -> CommandResponse {
        // The callback must run without any controller lock held; take it
        // out of the map for the duration of the call
        let Some(callback) = self.registry.lock().restart_callbacks.remove(name) else {
            return CommandResponse::new(
                OperationStatus::Failed,
                "thread is not alive and no restart callback is registered",
            );
        };
        let spawned = callback();
        self.registry
            .lock()
            .restart_callbacks
            .insert(name.to_string(), callback);

        match spawned {
            Ok(spawned) => {
                let message = format!("thread created with id {}", spawned.thread_id);
                if let Err(e) = self.register_thread(
                    name,
                    spawned.thread_id,
                    &spawned.attachment,
                    spawned.control,
                ) {
                    return CommandResponse::new(
                        OperationStatus::Failed,
                        format!("spawned but could not register: {e}"),
                    );
                }
                CommandResponse::new(OperationStatus::Success, message)
            }
            Err(e) => {
                CommandResponse::new(OperationStatus::Failed, format!("restart failed: {e}"))
            }
        }
    }

    fn stop_thread(&self, name: &str) -> CommandResponse {
        let (thread_id, control) = {
            let registry = self.registry.lock();
            (
                registry.threads.get(name).copied(),
                registry.controls.get(name).cloned(),
            )
        };

        let Some(thread_id) = thread_id else {
            return CommandResponse::new(OperationStatus::ThreadNotFound, "thread not found");
        };

        if let Some(control) = control {
            // Stop the instance owned by this name; the thread terminates
            // on its own schedule, no join here
            control.request_exit(0);
            return CommandResponse::new(OperationStatus::Success, "router stop requested");
        }

        match self.thread_manager.stop_thread(thread_id) {
            Ok(()) => CommandResponse::new(OperationStatus::Success, "thread stop requested"),
            Err(crate::error::RouterError::ThreadNotFound(_)) => {
                CommandResponse::new(OperationStatus::ThreadNotFound, "thread not found")
            }
            Err(e) => CommandResponse::new(OperationStatus::Failed, e.to_string()),
        }
    }

    fn flag_thread(&self, name: &str, pause: bool) -> CommandResponse {
        let thread_id = self.registry.lock().threads.get(name).copied();
        let Some(thread_id) = thread_id else {
            return CommandResponse::new(OperationStatus::ThreadNotFound, "thread not found");
        };

        let result = if pause {
            self.thread_manager.pause_thread(thread_id)
        } else {
            self.thread_manager.resume_thread(thread_id)
        };
        match result {
            Ok(()) => CommandResponse::new(
                OperationStatus::Success,
                if pause { "thread paused" } else { "thread resumed" },
            ),
            Err(crate::error::RouterError::ThreadNotFound(_)) => {
                CommandResponse::new(OperationStatus::ThreadNotFound, "thread not found")
            }
            Err(e) => CommandResponse::new(OperationStatus::Failed, e.to_string()),
        }
    }

    fn restart_thread(&self, name: &str) -> CommandResponse {
        let (thread_id, control) = {
            let registry = self.registry.lock();
            (
                registry.threads.get(name).copied(),
                registry.controls.get(name).cloned(),
            )
        };
        let Some(thread_id) = thread_id else {
            return CommandResponse::new(OperationStatus::ThreadNotFound, "thread not found");
        };

        if let Some(control) = control {
            control.request_exit(0);
        } else if let Err(e) = self.thread_manager.stop_thread(thread_id) {
            return CommandResponse::new(OperationStatus::Failed, e.to_string());
        }

        match self
            .thread_manager
            .join_thread(thread_id, RESTART_JOIN_TIMEOUT)
        {
            Ok(true) => CommandResponse::new(
                OperationStatus::Success,
                "thread stopped, ready for restart",
            ),
            Ok(false) => CommandResponse::new(
                OperationStatus::Timeout,
                "thread did not stop within timeout",
            ),
            Err(e) => CommandResponse::new(OperationStatus::Failed, e.to_string()),
        }
    }
}

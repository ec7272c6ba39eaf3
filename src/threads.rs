//! Supervised worker threads.
//!
//! The [`ThreadManager`] owns a table of OS threads keyed by stable numeric
//! ids. Stop and pause are cooperative: flags the worker polls through its
//! [`ThreadContext`]. Workers stay responsive by pairing blocking waits
//! with bounded timeouts, the way the router loop does. Joins are bounded
//! by caller-supplied deadlines; nothing here interrupts blocking I/O.

use crate::error::{Result, RouterError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const JOIN_POLL: Duration = Duration::from_millis(10);
const PAUSE_POLL: Duration = Duration::from_millis(50);

/// Lifecycle state of a managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadState {
    Created,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

#[derive(Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new(state: ThreadState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    fn set(&self, state: ThreadState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    fn get(&self) -> ThreadState {
        match self.0.load(Ordering::Relaxed) {
            0 => ThreadState::Created,
            1 => ThreadState::Running,
            2 => ThreadState::Paused,
            3 => ThreadState::Stopping,
            4 => ThreadState::Stopped,
            _ => ThreadState::Error,
        }
    }
}

/// Handed to every worker; the worker is required to poll it.
#[derive(Clone)]
pub struct ThreadContext {
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl ThreadContext {
    /// True once a cooperative stop was requested.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// True while the thread is asked to hold.
    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Blocks in bounded slices while paused; returns early on stop.
    pub fn wait_if_paused(&self) {
        while self.is_paused() && !self.should_stop() {
            std::thread::sleep(PAUSE_POLL);
        }
    }
}

struct ThreadEntry {
    handle: Option<JoinHandle<()>>,
    state: StateCell,
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    attachment: Option<String>,
}

/// Table of supervised threads. All operations return typed errors;
/// unknown ids produce [`RouterError::ThreadNotFound`].
#[derive(Default)]
pub struct ThreadManager {
    next_id: AtomicU32,
    table: Mutex<HashMap<u32, ThreadEntry>>,
}

impl ThreadManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a thread executing `work` and returns its id. The worker
    /// receives a [`ThreadContext`] it must poll for stop and pause.
    pub fn create_thread(
        &self,
        work: impl FnOnce(ThreadContext) + Send + 'static,
    ) -> Result<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let stop = Arc::new(AtomicBool::new(false));
        let pause = Arc::new(AtomicBool::new(false));
        let state = StateCell::new(ThreadState::Created);

        let context = ThreadContext {
            stop: stop.clone(),
            pause: pause.clone(),
        };
        let state_in_thread = state.clone();

        let handle = std::thread::Builder::new()
            .name(format!("mavhub-worker-{id}"))
            .spawn(move || {
                state_in_thread.set(ThreadState::Running);
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| work(context)));
                match result {
                    Ok(()) => state_in_thread.set(ThreadState::Stopped),
                    Err(_) => {
                        error!(thread_id = id, "worker thread panicked");
                        state_in_thread.set(ThreadState::Error);
                    }
                }
            })
            .map_err(|e| RouterError::internal(format!("failed to spawn thread: {e}")))?;

        self.table.lock().insert(
            id,
            ThreadEntry {
                handle: Some(handle),
                state,
                stop,
                pause,
                attachment: None,
            },
        );
        debug!(thread_id = id, "thread created");
        Ok(id)
    }

    /// Associates a human-readable attachment id with a thread.
    pub fn register_thread(&self, id: u32, attachment: impl Into<String>) -> Result<()> {
        let mut table = self.table.lock();
        let entry = table.get_mut(&id).ok_or(RouterError::ThreadNotFound(id))?;
        entry.attachment = Some(attachment.into());
        Ok(())
    }

    /// Removes the registration carrying `attachment`. Entries of threads
    /// that already finished are dropped from the table entirely.
    pub fn unregister_thread(&self, attachment: &str) -> Result<()> {
        let mut table = self.table.lock();
        let id = table
            .iter()
            .find(|(_, e)| e.attachment.as_deref() == Some(attachment))
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                RouterError::internal(format!("no thread with attachment '{attachment}'"))
            })?;

        let finished = table
            .get(&id)
            .and_then(|e| e.handle.as_ref())
            .map(|h| h.is_finished())
            .unwrap_or(true);
        if finished {
            table.remove(&id);
        } else if let Some(entry) = table.get_mut(&id) {
            entry.attachment = None;
        }
        info!(thread_id = id, attachment, "thread unregistered");
        Ok(())
    }

    /// Looks up a thread id by its attachment.
    pub fn find_by_attachment(&self, attachment: &str) -> Option<u32> {
        self.table
            .lock()
            .iter()
            .find(|(_, e)| e.attachment.as_deref() == Some(attachment))
            .map(|(id, _)| *id)
    }

    /// Current lifecycle state of a thread.
    pub fn get_state(&self, id: u32) -> Result<ThreadState> {
        let table = self.table.lock();
        let entry = table.get(&id).ok_or(RouterError::ThreadNotFound(id))?;
        Ok(entry.state.get())
    }

    /// True while the thread has not terminated.
    pub fn is_alive(&self, id: u32) -> Result<bool> {
        let table = self.table.lock();
        let entry = table.get(&id).ok_or(RouterError::ThreadNotFound(id))?;
        Ok(entry
            .handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false))
    }

    /// Requests a cooperative stop: sets the stop flag (and releases a
    /// pause, so a held worker can observe it). Does not join.
    pub fn stop_thread(&self, id: u32) -> Result<()> {
        let table = self.table.lock();
        let entry = table.get(&id).ok_or(RouterError::ThreadNotFound(id))?;
        entry.stop.store(true, Ordering::Relaxed);
        entry.pause.store(false, Ordering::Relaxed);
        if matches!(entry.state.get(), ThreadState::Running | ThreadState::Paused) {
            entry.state.set(ThreadState::Stopping);
        }
        debug!(thread_id = id, "stop requested");
        Ok(())
    }

    /// Sets the cooperative pause flag.
    pub fn pause_thread(&self, id: u32) -> Result<()> {
        let table = self.table.lock();
        let entry = table.get(&id).ok_or(RouterError::ThreadNotFound(id))?;
        entry.pause.store(true, Ordering::Relaxed);
        if entry.state.get() == ThreadState::Running {
            entry.state.set(ThreadState::Paused);
        }
        Ok(())
    }

    /// Clears the pause flag.
    pub fn resume_thread(&self, id: u32) -> Result<()> {
        let table = self.table.lock();
        let entry = table.get(&id).ok_or(RouterError::ThreadNotFound(id))?;
        entry.pause.store(false, Ordering::Relaxed);
        if entry.state.get() == ThreadState::Paused {
            entry.state.set(ThreadState::Running);
        }
        Ok(())
    }

    /// Waits up to `timeout` for the thread to terminate. Returns `true`
    /// iff it did. The table lock is never held across a sleep.
    pub fn join_thread(&self, id: u32, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut table = self.table.lock();
                let entry = table.get_mut(&id).ok_or(RouterError::ThreadNotFound(id))?;
                match &entry.handle {
                    None => return Ok(true), // already joined
                    Some(handle) if handle.is_finished() => {
                        if let Some(handle) = entry.handle.take() {
                            // Panic already recorded as ThreadState::Error
                            let _ = handle.join();
                        }
                        return Ok(true);
                    }
                    Some(_) => {}
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(JOIN_POLL);
        }
    }

    /// Ids of every thread in the table.
    pub fn thread_ids(&self) -> Vec<u32> {
        self.table.lock().keys().copied().collect()
    }

    /// Number of threads in the table.
    pub fn thread_count(&self) -> usize {
        self.table.lock().len()
    }
}

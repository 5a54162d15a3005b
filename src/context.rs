//! Process-wide shared state.
//!
//! One [`Context`] is constructed in `main` and passed by `Arc` to every
//! thread. The cycle counter and shutdown flag are the only fields mutated
//! after startup, both atomically. Per-job state never lives here: workers
//! own their job descriptors and pass them to logging explicitly.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::concurrency::ConcurrencyManager;
use crate::env::EnvConfig;
use crate::secrets::SecretStore;

/// A live external tool spawned by the subprocess runner. Each child runs in
/// its own process group (pgid == pid), so shutdown can signal the group.
#[derive(Debug, Clone)]
pub struct TrackedChild {
    pub pid: u32,
    pub args: String,
    pub repo_key: Option<String>,
}

pub struct Context {
    pub env: EnvConfig,
    pub secrets: SecretStore,
    pub limits: ConcurrencyManager,
    pub start_time: DateTime<Local>,
    pub container_id: String,
    cycle: AtomicU64,
    start_instant: Instant,
    shutdown: AtomicBool,
    children: Mutex<BTreeMap<u32, TrackedChild>>,
}

impl Context {
    pub fn new(env: EnvConfig) -> Self {
        let limits = ConcurrencyManager::new(&env);
        Context {
            env,
            secrets: SecretStore::new(),
            limits,
            start_time: Local::now(),
            container_id: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            cycle: AtomicU64::new(0),
            start_instant: Instant::now(),
            shutdown: AtomicBool::new(false),
            children: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    pub fn next_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uptime(&self) -> Duration {
        self.start_instant.elapsed()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Set the shutdown flag. Returns true if this call was the one that
    /// flipped it, so signal handling runs the shutdown sequence exactly once.
    pub fn request_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    pub fn register_child(&self, child: TrackedChild) {
        self.children
            .lock()
            .expect("child registry lock poisoned")
            .insert(child.pid, child);
    }

    pub fn unregister_child(&self, pid: u32) {
        self.children
            .lock()
            .expect("child registry lock poisoned")
            .remove(&pid);
    }

    pub fn tracked_children(&self) -> Vec<TrackedChild> {
        self.children
            .lock()
            .expect("child registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

//! Two-level concurrency admission control.
//!
//! Every conversion job must hold two permits before it runs: one from its
//! origin server's semaphore and one from the global semaphore. On top of
//! the permits sit three registries (active jobs, queued jobs, and the
//! per-server semaphores themselves), each behind its own mutex, so the
//! status monitor can take a consistent snapshot without stopping admission.
//!
//! Per-repository mutual exclusion is enforced here too: a repo with a job
//! already in the active registry is refused immediately rather than queued,
//! because a second fetch into the same clone can only corrupt it.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};

use crate::context::Context;
use crate::env::EnvConfig;
use crate::job::Job;
use crate::logging::{self, Level, LogExtra};

/// How long `status()` will wait for any one registry lock before settling
/// for a partial snapshot. The monitor must never block the workers.
const STATUS_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            cvar: Condvar::new(),
        }
    }

    pub fn available(&self) -> usize {
        *self.permits.lock().expect("semaphore lock poisoned")
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        while *permits == 0 {
            permits = self.cvar.wait(permits).expect("semaphore lock poisoned");
        }
        *permits -= 1;
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        *permits += 1;
        self.cvar.notify_one();
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    trace: String,
    repo_key: String,
    timestamp: i64,
}

impl Slot {
    fn for_job(job: &Job) -> Self {
        Slot {
            trace: job.trace.clone(),
            repo_key: job.config.repo_key.clone(),
            timestamp: Utc::now().timestamp(),
        }
    }

    fn matches(&self, job: &Job) -> bool {
        self.trace == job.trace && self.repo_key == job.config.repo_key
    }
}

type SlotRegistry = Mutex<BTreeMap<String, Vec<Slot>>>;

pub struct ConcurrencyManager {
    global_limit: usize,
    per_server_limit: usize,
    global: Semaphore,
    /// Created lazily: the inventory can grow new servers while the
    /// container is running.
    servers: Mutex<BTreeMap<String, Arc<Semaphore>>>,
    active: SlotRegistry,
    queued: SlotRegistry,
}

impl ConcurrencyManager {
    pub fn new(env: &EnvConfig) -> Self {
        ConcurrencyManager {
            global_limit: env.max_concurrent_conversions_global,
            per_server_limit: env.max_concurrent_conversions_per_server,
            global: Semaphore::new(env.max_concurrent_conversions_global),
            servers: Mutex::new(BTreeMap::new()),
            active: Mutex::new(BTreeMap::new()),
            queued: Mutex::new(BTreeMap::new()),
        }
    }

    /// Admit a job: per-repo exclusion, queue-depth bound, then both
    /// semaphores, blocking. Returns false if the job was refused; the
    /// caller skips the repo for this cycle.
    pub fn acquire(&self, ctx: &Context, job: &mut Job) -> bool {
        let server_name = job.config.server_name.clone();
        let repo_key = job.config.repo_key.clone();

        // Per-repo mutual exclusion.
        {
            let active = self.active.lock().expect("active jobs lock poisoned");
            if let Some(slot) = active
                .get(&server_name)
                .and_then(|slots| slots.iter().find(|s| s.repo_key == repo_key))
            {
                let running_for = Utc::now().timestamp().saturating_sub(slot.timestamp);
                let started_at = slot.timestamp;
                let trace = slot.trace.clone();
                drop(active);

                job.set_result("skipped", "Repo job already in progress", false);
                logging::log(
                    ctx,
                    Level::Info,
                    &format!(
                        "Skipping; Repo job already in progress; started at: {started_at}; \
                         trace: {trace}; running for: {running_for} seconds"
                    ),
                    LogExtra {
                        job: Some(job),
                        ..LogExtra::default()
                    },
                );
                return false;
            }
        }

        let server_semaphore = self.server_semaphore(ctx, job, &server_name);

        // Both levels exhausted and the server already has a full queue of
        // waiters: refuse rather than grow an unbounded queue. The next
        // cycle re-derives the job from the inventory anyway.
        if server_semaphore.available() == 0 && self.global.available() == 0 {
            let queued = self.queued.lock().expect("queued jobs lock poisoned");
            let depth = queued.get(&server_name).map_or(0, Vec::len);
            drop(queued);

            if depth >= self.per_server_limit {
                job.set_result("skipped", "Concurrency queue full for this server", false);
                logging::log(
                    ctx,
                    Level::Info,
                    &format!(
                        "Skipping; {depth} jobs already queued for this server with no free \
                         slots at either level"
                    ),
                    LogExtra {
                        job: Some(job),
                        ..LogExtra::default()
                    },
                );
                return false;
            }
        }

        // Visible to the monitor while the blocking acquires below wait.
        {
            let mut queued = self.queued.lock().expect("queued jobs lock poisoned");
            queued
                .entry(server_name.clone())
                .or_default()
                .push(Slot::for_job(job));
        }

        if server_semaphore.available() == 0 {
            logging::log(
                ctx,
                Level::Info,
                &format!(
                    "Hit per-server concurrency limit; MAX_CONCURRENT_CONVERSIONS_PER_SERVER={}, \
                     waiting for a server slot",
                    self.per_server_limit
                ),
                LogExtra {
                    job: Some(job),
                    ..LogExtra::default()
                },
            );
        }

        if self.global.available() == 0 {
            logging::log(
                ctx,
                Level::Info,
                &format!(
                    "Hit global concurrency limit; MAX_CONCURRENT_CONVERSIONS_GLOBAL={}, \
                     waiting for a slot",
                    self.global_limit
                ),
                LogExtra {
                    job: Some(job),
                    ..LogExtra::default()
                },
            );
        }

        server_semaphore.acquire();
        self.global.acquire();

        // Both permits held: move the entry from queued to active.
        let slot = Slot::for_job(job);
        job.result.start_timestamp = Some(slot.timestamp);
        {
            let mut active = self.active.lock().expect("active jobs lock poisoned");
            active
                .entry(server_name.clone())
                .or_default()
                .push(slot);
        }
        {
            let mut queued = self.queued.lock().expect("queued jobs lock poisoned");
            if let Some(slots) = queued.get_mut(&server_name) {
                slots.retain(|s| !s.matches(job));
            }
        }

        true
    }

    /// Release both permits. Safe to call when `acquire` never completed:
    /// the release is gated on the job being present in the active registry.
    pub fn release(&self, ctx: &Context, job: &mut Job) {
        let server_name = job.config.server_name.clone();
        let server_semaphore = self.server_semaphore(ctx, job, &server_name);

        let was_active = {
            let mut active = self.active.lock().expect("active jobs lock poisoned");
            match active.get_mut(&server_name) {
                Some(slots) => {
                    let before = slots.len();
                    slots.retain(|s| !s.matches(job));
                    slots.len() < before
                }
                None => false,
            }
        };

        if was_active {
            server_semaphore.release();
            self.global.release();

            let end = Utc::now().timestamp();
            job.result.end_timestamp = Some(end);
            if let Some(start) = job.result.start_timestamp {
                job.result.execution_time = Some(end.saturating_sub(start));
            }
        } else {
            // The job may still sit in the queued registry if admission was
            // refused or interrupted.
            let mut queued = self.queued.lock().expect("queued jobs lock poisoned");
            if let Some(slots) = queued.get_mut(&server_name) {
                slots.retain(|s| !s.matches(job));
            }
        }
    }

    fn server_semaphore(&self, ctx: &Context, job: &Job, server_name: &str) -> Arc<Semaphore> {
        let mut servers = self.servers.lock().expect("server semaphores lock poisoned");
        if let Some(semaphore) = servers.get(server_name) {
            return Arc::clone(semaphore);
        }

        let semaphore = Arc::new(Semaphore::new(self.per_server_limit));
        servers.insert(server_name.to_string(), Arc::clone(&semaphore));
        drop(servers);

        logging::log(
            ctx,
            Level::Debug,
            &format!(
                "Created concurrency limit semaphore for server {server_name} with limit {}",
                self.per_server_limit
            ),
            LogExtra {
                job: Some(job),
                ..LogExtra::default()
            },
        );
        semaphore
    }

    /// A best-effort snapshot for the status monitor. Registry locks are
    /// taken with a timeout; whatever cannot be read in time is omitted and
    /// noted at warning, so this can never wedge the workers.
    pub fn status(&self, ctx: &Context) -> Value {
        let now = Utc::now().timestamp();

        let mut status = json!({
            "global": {
                "limit": self.global_limit,
                "active": self.global_limit.saturating_sub(self.global.available()),
                "available": self.global.available(),
            },
            "servers": {},
            "active_jobs_count": 0,
            "active_jobs": {},
            "queued_jobs_count": 0,
            "queued_jobs": {},
        });

        match lock_timeout(&self.servers, STATUS_LOCK_TIMEOUT) {
            Some(servers) => {
                let mut server_status = serde_json::Map::new();
                for (server_name, semaphore) in servers.iter() {
                    let available = semaphore.available();
                    server_status.insert(
                        server_name.clone(),
                        json!({
                            "limit": self.per_server_limit,
                            "active": self.per_server_limit.saturating_sub(available),
                            "available": available,
                        }),
                    );
                }
                status["servers"] = Value::Object(server_status);
            }
            None => logging::warning(
                ctx,
                "Could not acquire server semaphores lock for status, skipping server status",
            ),
        }

        match lock_timeout(&self.active, STATUS_LOCK_TIMEOUT) {
            Some(active) => {
                let (jobs, count) = snapshot_jobs(&active, now, "started_at", "running_time_seconds");
                status["active_jobs"] = jobs;
                status["active_jobs_count"] = json!(count);
            }
            None => logging::warning(
                ctx,
                "Could not acquire active jobs lock for status, skipping active jobs",
            ),
        }

        match lock_timeout(&self.queued, STATUS_LOCK_TIMEOUT) {
            Some(queued) => {
                let (jobs, count) = snapshot_jobs(&queued, now, "queued_at", "queue_wait_time");
                status["queued_jobs"] = jobs;
                status["queued_jobs_count"] = json!(count);
            }
            None => logging::warning(
                ctx,
                "Could not acquire queued jobs lock for status, skipping queued jobs",
            ),
        }

        status
    }
}

fn snapshot_jobs(
    registry: &BTreeMap<String, Vec<Slot>>,
    now: i64,
    at_field: &str,
    elapsed_field: &str,
) -> (Value, usize) {
    let mut output = serde_json::Map::new();
    let mut count = 0;

    for (server_name, slots) in registry {
        if slots.is_empty() {
            continue;
        }
        count += slots.len();
        let jobs: Vec<Value> = slots
            .iter()
            .map(|slot| {
                json!({
                    "repo": slot.repo_key,
                    "trace": slot.trace,
                    at_field: slot.timestamp,
                    elapsed_field: now.saturating_sub(slot.timestamp),
                })
            })
            .collect();
        output.insert(server_name.clone(), Value::Array(jobs));
    }

    (Value::Object(output), count)
}

fn lock_timeout<'a, T>(mutex: &'a Mutex<T>, timeout: Duration) -> Option<MutexGuard<'a, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn context_with_limits(global: usize, per_server: usize) -> Arc<Context> {
        let mut env = EnvConfig::default();
        env.max_concurrent_conversions_global = global;
        env.max_concurrent_conversions_per_server = per_server;
        Arc::new(Context::new(env))
    }

    fn job(repo: &str, server: &str) -> Job {
        Job::new(repo, "svn", server, format!("/tmp/{repo}"))
    }

    #[test]
    fn semaphore_counts_permits() {
        let semaphore = Semaphore::new(2);
        assert_eq!(semaphore.available(), 2);
        semaphore.acquire();
        semaphore.acquire();
        assert_eq!(semaphore.available(), 0);
        semaphore.release();
        assert_eq!(semaphore.available(), 1);
    }

    #[test]
    fn semaphore_blocks_until_released() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.acquire();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || {
                semaphore.acquire();
                semaphore.release();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        semaphore.release();
        waiter.join().unwrap();
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let ctx = context_with_limits(10, 10);
        let mut job = job("svn.example.org/proj", "svn.example.org");

        assert!(ctx.limits.acquire(&ctx, &mut job));
        assert!(job.result.start_timestamp.is_some());

        ctx.limits.release(&ctx, &mut job);
        assert!(job.result.end_timestamp.is_some());
        assert!(job.result.execution_time.is_some());
        assert_eq!(ctx.limits.global.available(), 10);
    }

    #[test]
    fn duplicate_repo_refused() {
        let ctx = context_with_limits(10, 10);
        let mut first = job("svn.example.org/proj", "svn.example.org");
        let mut second = job("svn.example.org/proj", "svn.example.org");

        assert!(ctx.limits.acquire(&ctx, &mut first));
        assert!(!ctx.limits.acquire(&ctx, &mut second));
        assert_eq!(second.result.action.as_deref(), Some("skipped"));
        assert_eq!(
            second.result.reason.as_deref(),
            Some("Repo job already in progress")
        );
        assert_eq!(second.result.success, Some(false));

        // Releasing the refused job must not free a permit it never held.
        ctx.limits.release(&ctx, &mut second);
        assert_eq!(ctx.limits.global.available(), 9);

        ctx.limits.release(&ctx, &mut first);
        assert_eq!(ctx.limits.global.available(), 10);
    }

    #[test]
    fn release_without_acquire_is_harmless() {
        let ctx = context_with_limits(3, 3);
        let mut orphan = job("svn.example.org/never", "svn.example.org");
        ctx.limits.release(&ctx, &mut orphan);
        assert_eq!(ctx.limits.global.available(), 3);
    }

    #[test]
    fn per_server_limit_of_one_serializes() {
        let ctx = context_with_limits(10, 1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let mut job = job(&format!("svn.example.org/repo{i}"), "svn.example.org");
                    assert!(ctx.limits.acquire(&ctx, &mut job));

                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);

                    ctx.limits.release(&ctx, &mut job);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.limits.global.available(), 10);
    }

    #[test]
    fn global_limit_caps_across_servers() {
        let ctx = context_with_limits(2, 10);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let ctx = Arc::clone(&ctx);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let server = format!("server{}.example.org", i % 3);
                    let mut job = job(&format!("{server}/repo{i}"), &server);
                    assert!(ctx.limits.acquire(&ctx, &mut job));

                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);

                    ctx.limits.release(&ctx, &mut job);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(ctx.limits.global.available(), 2);
    }

    #[test]
    fn full_queue_refuses_new_jobs() {
        let ctx = context_with_limits(1, 1);
        let mut holder = job("svn.example.org/held", "svn.example.org");
        assert!(ctx.limits.acquire(&ctx, &mut holder));

        // One waiter blocks inside acquire, filling the queue.
        let waiter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                let mut queued = job("svn.example.org/waiting", "svn.example.org");
                assert!(ctx.limits.acquire(&ctx, &mut queued));
                ctx.limits.release(&ctx, &mut queued);
            })
        };
        thread::sleep(Duration::from_millis(100));

        let mut refused = job("svn.example.org/overflow", "svn.example.org");
        assert!(!ctx.limits.acquire(&ctx, &mut refused));
        assert_eq!(
            refused.result.reason.as_deref(),
            Some("Concurrency queue full for this server")
        );

        ctx.limits.release(&ctx, &mut holder);
        waiter.join().unwrap();
        assert_eq!(ctx.limits.global.available(), 1);
    }

    #[test]
    fn status_reports_active_and_queued_jobs() {
        let ctx = context_with_limits(5, 5);
        let mut job = job("svn.example.org/proj", "svn.example.org");
        assert!(ctx.limits.acquire(&ctx, &mut job));

        let status = ctx.limits.status(&ctx);
        assert_eq!(status["global"]["limit"], 5);
        assert_eq!(status["global"]["active"], 1);
        assert_eq!(status["global"]["available"], 4);
        assert_eq!(status["active_jobs_count"], 1);
        assert_eq!(status["servers"]["svn.example.org"]["active"], 1);

        let entries = status["active_jobs"]["svn.example.org"].as_array().unwrap();
        assert_eq!(entries[0]["repo"], "svn.example.org/proj");
        assert_eq!(entries[0]["trace"].as_str().unwrap().len(), 8);

        ctx.limits.release(&ctx, &mut job);
        let status = ctx.limits.status(&ctx);
        assert_eq!(status["active_jobs_count"], 0);
    }
}

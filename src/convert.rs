//! Per-cycle job fan-out.
//!
//! Each cycle walks the inventory and starts one worker thread per admitted
//! repository. Workers are fire-and-forget: no handles are kept, completion
//! is observed through the concurrency registries and the child-process
//! reaping machinery. A repository still converting when the next cycle
//! arrives is simply skipped by admission until it finishes.

use std::sync::Arc;
use std::thread;

use crate::context::Context;
use crate::inventory::{Inventory, RepoConfig};
use crate::job::Job;
use crate::logging::{self, Level, LogExtra};
use crate::svn;

/// Walk the inventory once and spawn a worker for every admitted job.
pub fn fan_out(ctx: &Arc<Context>, inventory: &Inventory) {
    for (repo_key, repo) in inventory {
        if ctx.shutdown_requested() {
            return;
        }

        let repo_type = repo.repo_type.to_ascii_lowercase();
        if !matches!(repo_type.as_str(), "svn" | "subversion") {
            logging::error(
                ctx,
                &format!("{repo_key}; Repo type not implemented: {repo_type}"),
            );
            continue;
        }

        let mut job = Job::new(
            repo_key.clone(),
            repo_type,
            repo.server_name.clone(),
            repo.local_repo_path.display().to_string(),
        );

        // Blocks until both semaphores are held, or refuses (duplicate repo,
        // full queue); refusals move on to the next entry.
        if !ctx.limits.acquire(ctx, &mut job) {
            logging::log(
                ctx,
                Level::Debug,
                "Could not acquire concurrency slot, skipping",
                LogExtra {
                    job: Some(&job),
                    concurrency: true,
                    ..LogExtra::default()
                },
            );
            continue;
        }

        spawn_worker(ctx, job, repo.clone());
    }
}

fn spawn_worker(ctx: &Arc<Context>, job: Job, repo: RepoConfig) {
    let worker_ctx = Arc::clone(ctx);
    let thread_name = format!("convert_{}_{}", job.config.repo_type, job.config.repo_key);

    let spawned = thread::Builder::new().name(thread_name).spawn(move || {
        let mut guard = WorkerGuard {
            ctx: &worker_ctx,
            job: Some(job),
        };
        let job = guard.job.as_mut().expect("job present until drop");

        logging::log(
            &worker_ctx,
            Level::Debug,
            "Starting repo conversion job",
            LogExtra {
                job: Some(job),
                ..LogExtra::default()
            },
        );

        match job.config.repo_type.as_str() {
            "svn" | "subversion" => svn::convert(&worker_ctx, job, &repo),
            other => {
                logging::error(&worker_ctx, &format!("Repo type not implemented: {other}"));
            }
        }
        // The guard's Drop releases the slot and logs completion, on panic
        // paths included.
    });

    if let Err(err) = spawned {
        logging::error(ctx, &format!("Failed to spawn conversion worker: {err}"));
    }
}

/// Releases the job's concurrency slot and emits the completion record on
/// every worker exit path.
struct WorkerGuard<'a> {
    ctx: &'a Arc<Context>,
    job: Option<Job>,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut job) = self.job.take() {
            self.ctx.limits.release(self.ctx, &mut job);
            logging::log(
                self.ctx,
                Level::Info,
                "Finishing repo conversion job",
                LogExtra {
                    job: Some(&job),
                    ..LogExtra::default()
                },
            );
        }
    }
}

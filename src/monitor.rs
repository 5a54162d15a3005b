//! Background status monitor.
//!
//! A thread in the main process that periodically reaps zombie descendants
//! and emits one debug record with the full concurrency snapshot. It holds
//! no locks while sleeping and exits promptly once the shutdown flag is set.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::context::Context;
use crate::logging::{self, Level, LogExtra};
use crate::procs;

/// Start the monitor thread. Returns `None` when the interval is configured
/// to zero (monitor disabled).
pub fn start(ctx: &Arc<Context>) -> Option<thread::JoinHandle<()>> {
    let interval = ctx.env.status_monitor_interval;
    if interval == 0 {
        return None;
    }

    let ctx = Arc::clone(ctx);
    let handle = thread::Builder::new()
        .name("status_monitor".to_string())
        .spawn(move || monitor_loop(&ctx, interval))
        .ok()?;

    Some(handle)
}

fn monitor_loop(ctx: &Context, interval: u64) {
    while !ctx.shutdown_requested() {
        sleep_interruptibly(ctx, interval);
        if ctx.shutdown_requested() {
            break;
        }

        procs::reap_descendants(ctx);

        logging::log(
            ctx,
            Level::Debug,
            "Concurrency status",
            LogExtra {
                concurrency: true,
                ..LogExtra::default()
            },
        );
    }
}

/// Sleep in one-second slices so a shutdown does not wait out the interval.
fn sleep_interruptibly(ctx: &Context, seconds: u64) {
    for _ in 0..seconds {
        if ctx.shutdown_requested() {
            return;
        }
        thread::sleep(Duration::from_secs(1));
    }
}

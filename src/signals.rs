//! Signal handling: orderly shutdown and the SIGCHLD fast reaper.
//!
//! A dedicated thread consumes signals through `signal-hook`'s iterator.
//! SIGCHLD reaps exited direct children immediately, which matters most when
//! the daemon runs as PID 1. SIGINT and SIGTERM run the shutdown sequence:
//! signal every tracked child's process group, wait out a bounded budget,
//! SIGKILL the stragglers, take a final reaping pass, and exit 0.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::context::Context;
use crate::logging;
use crate::procs;

/// Overall time budget for the shutdown sequence.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(15);

/// Pause after SIGKILL before the final reaping pass.
const KILL_SETTLE: Duration = Duration::from_millis(500);

/// Register the signal-handling thread. Must be called before the first
/// worker spawns so no child outlives an unhandled SIGTERM window.
pub fn register(ctx: &Arc<Context>) -> anyhow::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGCHLD])?;
    let ctx = Arc::clone(ctx);

    thread::Builder::new()
        .name("signal_handler".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGCHLD => procs::fast_reap(&ctx),
                    SIGINT | SIGTERM => {
                        // The group-wide SIGTERM below comes back to this
                        // process too; only the first delivery runs the
                        // sequence.
                        if ctx.request_shutdown() {
                            orderly_shutdown(&ctx, signal);
                        }
                    }
                    _ => {}
                }
            }
        })?;

    Ok(())
}

fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

/// Terminate all conversion work and exit 0.
fn orderly_shutdown(ctx: &Context, signal: i32) -> ! {
    let name = signal_name(signal);
    logging::info(
        ctx,
        &format!("Received signal {name} ({signal}), initiating graceful shutdown"),
    );

    // First pass: SIGTERM to every tracked child's process group. Children
    // are their own group leaders, so each group covers the tool and any
    // helpers it forked.
    let children = ctx.tracked_children();
    logging::info(
        ctx,
        &format!("Terminating {} tracked child processes", children.len()),
    );
    for child in &children {
        match killpg(Pid::from_raw(child.pid as i32), Signal::SIGTERM) {
            Ok(()) => logging::info(
                ctx,
                &format!("Sent SIGTERM to process group {} ({})", child.pid, child.args),
            ),
            Err(nix::errno::Errno::ESRCH) => {
                logging::debug(ctx, &format!("Process group {} already gone", child.pid));
            }
            Err(err) => logging::error(
                ctx,
                &format!("Error terminating process group {}: {err}", child.pid),
            ),
        }
    }

    // The runner threads unregister children as their waits return; poll the
    // registry against the budget instead of joining threads.
    let deadline = Instant::now() + SHUTDOWN_BUDGET;
    while !ctx.tracked_children().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(200));
    }

    // Force-kill whatever is left.
    let stragglers = ctx.tracked_children();
    for child in &stragglers {
        logging::warning(
            ctx,
            &format!("Force killing unresponsive process group {} ({})", child.pid, child.args),
        );
        let _ = killpg(Pid::from_raw(child.pid as i32), Signal::SIGKILL);
    }
    if !stragglers.is_empty() {
        thread::sleep(KILL_SETTLE);
    }

    // Final pass so nothing is left for the kernel's init inheritance.
    procs::reap_descendants(ctx);

    logging::info(ctx, &format!("Graceful shutdown complete for signal {name}"));
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_resolve() {
        assert_eq!(signal_name(SIGINT), "SIGINT");
        assert_eq!(signal_name(SIGTERM), "SIGTERM");
        assert_eq!(signal_name(99), "signal");
    }
}

//! Process-table inspection and zombie reaping.
//!
//! The external tools fork helper children the daemon never holds handles
//! to. When the daemon runs as PID 1 in a container, nothing else will wait
//! on those processes, so the status monitor and the shutdown path both walk
//! the process table, find every descendant, and wait on the ones that have
//! exited. A separate SIGCHLD fast path reaps direct children as they die.

use std::collections::BTreeSet;

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid as NixPid;
use serde_json::{Value, json};
use sysinfo::{Pid, Process, ProcessStatus, System};

use crate::context::Context;
use crate::logging::{self, LogExtra};

/// How long a process has been running, or `None` if it no longer exists.
pub fn pid_uptime(pid: u32) -> Option<std::time::Duration> {
    let mut sys = System::new();
    if !sys.refresh_process(Pid::from_u32(pid)) {
        return None;
    }
    sys.process(Pid::from_u32(pid))
        .map(|p| std::time::Duration::from_secs(p.run_time()))
}

/// Sample OS metadata for one process, opportunistically: `None` simply
/// means the process exited before the table could be read.
pub fn sample_process(pid: u32) -> Option<Value> {
    let mut sys = System::new();
    if !sys.refresh_process(Pid::from_u32(pid)) {
        return None;
    }
    sys.process(Pid::from_u32(pid)).map(process_metadata)
}

fn process_metadata(process: &Process) -> Value {
    json!({
        "pid": process.pid().as_u32(),
        "ppid": process.parent().map(|p| p.as_u32()),
        "name": process.name(),
        "cmdline": process.cmd(),
        "status": format!("{:?}", process.status()),
        "cpu_usage": process.cpu_usage(),
        "memory_bytes": process.memory(),
        "virtual_memory_bytes": process.virtual_memory(),
        "run_time_seconds": process.run_time(),
        "start_time": process.start_time(),
    })
}

/// All PIDs whose ancestor chain includes `root`, excluding `root` itself.
pub fn descendant_pids(sys: &System, root: u32) -> BTreeSet<u32> {
    let mut descendants = BTreeSet::new();

    for (pid, _) in sys.processes() {
        let mut current = *pid;
        // Bounded walk; a corrupt parent chain must not loop forever.
        for _ in 0..64 {
            let Some(parent) = sys.process(current).and_then(Process::parent) else {
                break;
            };
            if parent.as_u32() == root {
                descendants.insert(pid.as_u32());
                break;
            }
            if parent == current {
                break;
            }
            current = parent;
        }
    }

    descendants.remove(&root);
    descendants
}

/// Walk the process table, log status for every live descendant, and wait on
/// the finished ones so the kernel can drop them from the process table.
pub fn reap_descendants(ctx: &Context) {
    let this_pid = std::process::id();

    let mut sys = System::new();
    sys.refresh_processes();

    let own_cmdline: Vec<String> = sys
        .process(Pid::from_u32(this_pid))
        .map(|p| p.cmd().to_vec())
        .unwrap_or_default();

    for pid in descendant_pids(&sys, this_pid) {
        let process = sys.process(Pid::from_u32(pid));
        let metadata = process.map(process_metadata);
        let is_zombie = process.is_some_and(|p| p.status() == ProcessStatus::Zombie);
        let is_own_image = process.is_some_and(|p| p.cmd() == own_cmdline.as_slice());

        let (message, include_metadata) =
            match waitpid(NixPid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if is_own_image {
                        // Don't narrate the daemon itself every interval.
                        continue;
                    }
                    let message = if is_zombie {
                        "Process is a zombie"
                    } else {
                        "Process still running"
                    };
                    (message, true)
                }
                Ok(_) => ("Process finished on cleanup", false),
                // ECHILD: not our direct child, or a signal handler already
                // reaped it; existence in the refreshed table settles which.
                Err(_) => {
                    if process.is_none() || is_zombie {
                        ("Process finished on wait", false)
                    } else if is_own_image {
                        continue;
                    } else {
                        ("Process still running", true)
                    }
                }
            };

        let mut data = serde_json::Map::new();
        data.insert("process".into(), json!({"pid": pid}));
        if include_metadata && let Some(metadata) = metadata {
            data.insert("psutils".into(), metadata);
        }
        logging::log(
            ctx,
            crate::logging::Level::Debug,
            message,
            LogExtra {
                data: Some(Value::Object(data)),
                ..LogExtra::default()
            },
        );
    }
}

/// SIGCHLD fast path: reap every already-exited direct child without
/// blocking. Non-zero exits and signal deaths are worth a warning; clean
/// exits are routine.
pub fn fast_reap(ctx: &Context) {
    loop {
        match waitpid(NixPid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(WaitStatus::Exited(pid, code)) => {
                if code != 0 {
                    logging::warning(
                        ctx,
                        &format!("Reaped child pid {pid} with exit code {code}"),
                    );
                }
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                logging::warning(
                    ctx,
                    &format!("Reaped child pid {pid} killed by signal {signal:?}"),
                );
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

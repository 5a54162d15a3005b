//! Entry point for the repo-converter container.

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use repo_converter::context::Context;
use repo_converter::env::EnvConfig;
use repo_converter::logging::{self, Level, LogExtra};
use repo_converter::{convert, git, inventory, monitor, signals};

fn main() {
    // The logger needs the context, so configuration errors this early go to
    // stderr; everything after this point is a structured record.
    let env = match EnvConfig::from_env() {
        Ok(env) => env,
        Err(err) => {
            eprintln!("repo-converter: invalid configuration: {err:#}");
            process::exit(1);
        }
    };

    let ctx = Arc::new(Context::new(env));

    match ctx.env.validate() {
        Ok(None) => {}
        Ok(Some(warning)) => logging::warning(&ctx, &warning),
        Err(message) => logging::critical(&ctx, &message, LogExtra::default()),
    }

    logging::log(
        &ctx,
        Level::Info,
        "Starting container",
        LogExtra {
            env_vars: true,
            ..LogExtra::default()
        },
    );

    if let Err(err) = signals::register(&ctx) {
        logging::critical(
            &ctx,
            &format!("Registering signal handlers failed: {err}"),
            LogExtra::default(),
        );
    }

    let _monitor = monitor::start(&ctx);

    let interval = ctx.env.repo_converter_interval_seconds;
    let max_cycles = ctx.env.max_cycles;

    loop {
        let cycle = ctx.next_cycle();

        logging::log(
            &ctx,
            Level::Debug,
            "Starting main loop run",
            LogExtra {
                env_vars: true,
                ..LogExtra::default()
            },
        );

        // Fresh read every cycle: the inventory file can change while the
        // container runs.
        let repos = inventory::load(&ctx);

        // Clones may carry uids from other containers sharing the volume.
        git::configure_safe_directory(&ctx);

        convert::fan_out(&ctx, &repos);

        logging::debug(
            &ctx,
            &format!("Sleeping main loop for REPO_CONVERTER_INTERVAL_SECONDS={interval} seconds"),
        );
        for _ in 0..interval {
            if ctx.shutdown_requested() {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }

        if ctx.shutdown_requested() {
            break;
        }

        if max_cycles > 0 && cycle >= max_cycles {
            logging::info(
                &ctx,
                &format!("Reached MAX_CYCLES={max_cycles}, exiting main loop"),
            );
            break;
        }
    }

    ctx.request_shutdown();

    logging::log(
        &ctx,
        Level::Info,
        "Stopping container",
        LogExtra {
            env_vars: true,
            ..LogExtra::default()
        },
    );
}

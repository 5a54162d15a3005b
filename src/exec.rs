//! Subprocess runner.
//!
//! Every external command the daemon runs goes through [`run`]. One choke
//! point means consistent behavior everywhere: argv is never
//! shell-interpreted, passwords travel over stdin and never the command line,
//! output is captured and truncated for logs, wall time is measured, a short
//! span id correlates the start/finish records, and a failed `git`/`svn`
//! command gets a stale-lock-file post-mortem.
//!
//! Child failure is data, not an error: callers branch on
//! [`CommandResult::success`] and the runner never panics or propagates on a
//! non-zero exit.

use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use chrono::{DateTime, Local};
use serde_json::{Value, json};

use crate::context::{Context, TrackedChild};
use crate::job::short_id;
use crate::lockfiles;
use crate::logging::{self, Level, LogExtra};
use crate::procs;

/// What to do with the child's stderr stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    /// Merge into stdout (the default; most tools interleave usefully).
    #[default]
    Merge,
    /// Discard.
    Ignore,
    /// Capture separately into [`CommandResult::stderr`].
    Capture,
}

#[derive(Default)]
pub struct RunOptions<'a> {
    /// Written to the child's stdin after launch, for tools that read
    /// credentials from stdin.
    pub password: Option<&'a str>,
    /// Suppress start/finish records entirely.
    pub quiet: bool,
    /// Optional command name to make log events easier to find.
    pub name: Option<&'a str>,
    pub stderr: StderrMode,
    /// Repository this command operates on, for child tracking.
    pub repo_key: Option<&'a str>,
    /// Repository path to scan for stale lock files if the command fails.
    pub lock_scan_path: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    /// The argv joined with spaces, for logging.
    pub args: String,
    pub name: Option<String>,
    /// Correlation id for this run's log records.
    pub span: String,
    pub pid: Option<u32>,
    /// Exit code; `None` when the child was killed by a signal or never ran.
    pub return_code: Option<i32>,
    pub success: bool,
    pub output: Vec<String>,
    pub output_line_count: usize,
    pub truncated_output: Vec<String>,
    pub stderr: Option<Vec<String>>,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub execution_time_seconds: f64,
    pub status_message: String,
    pub reason: Option<String>,
    pub log_level: Level,
}

impl CommandResult {
    pub fn first_line(&self) -> Option<&str> {
        self.output.iter().map(String::as_str).find(|l| !l.is_empty())
    }

    pub fn joined_output(&self) -> String {
        self.output.join(" ")
    }

    fn to_log_value(&self) -> Value {
        json!({
            "name": self.name,
            "args": self.args,
            "span": self.span,
            "pid": self.pid,
            "return_code": self.return_code,
            "success": self.success,
            "output_line_count": self.output_line_count,
            "truncated_output": self.truncated_output,
            "status_message": self.status_message,
            "status_message_reason": self.reason,
            "execution_time_seconds": self.execution_time_seconds,
        })
    }
}

/// Run an external command to completion and report what happened.
pub fn run(ctx: &Context, argv: &[String], opts: RunOptions) -> CommandResult {
    let started = Instant::now();
    let mut result = CommandResult {
        args: argv.join(" "),
        name: opts.name.map(str::to_string),
        span: short_id(),
        pid: None,
        return_code: None,
        success: false,
        output: Vec::new(),
        output_line_count: 0,
        truncated_output: Vec::new(),
        stderr: None,
        start_time: Local::now(),
        end_time: Local::now(),
        execution_time_seconds: 0.0,
        status_message: "starting".to_string(),
        reason: None,
        log_level: Level::Debug,
    };

    let Some((program, rest)) = argv.split_first() else {
        result.status_message = "finished".into();
        result.reason = Some("empty command".into());
        result.log_level = Level::Error;
        log_status(ctx, &result, None, opts.quiet);
        return result;
    };

    let mut command = Command::new(program);
    command
        .args(rest)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    match opts.stderr {
        StderrMode::Merge => {
            // std::process cannot alias the stdout pipe; tools we run keep
            // diagnostics on stderr, so capture and append below.
            command.stderr(Stdio::piped());
        }
        StderrMode::Ignore => {
            command.stderr(Stdio::null());
        }
        StderrMode::Capture => {
            command.stderr(Stdio::piped());
        }
    }
    // Each child leads its own process group so shutdown can signal the tool
    // and any helpers it forks as one unit.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        command.process_group(0);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            result.status_message = "finished".into();
            result.reason = Some(format!("failed to start: {err}"));
            result.log_level = if opts.quiet { Level::Debug } else { Level::Error };
            finish_timing(&mut result, started);
            log_status(ctx, &result, None, opts.quiet);
            return result;
        }
    };

    let pid = child.id();
    result.pid = Some(pid);
    result.status_message = "started".into();
    ctx.register_child(TrackedChild {
        pid,
        args: result.args.clone(),
        repo_key: opts.repo_key.map(str::to_string),
    });

    // Opportunistic: short-lived children routinely exit before the process
    // table can be read, and that must not fail the run.
    let metadata = procs::sample_process(pid);
    if !opts.quiet {
        log_status(ctx, &result, metadata.as_ref(), opts.quiet);
    }

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(password) = opts.password {
            // Best effort; the tool may not be waiting for credentials.
            let _ = writeln!(stdin, "{password}");
            let _ = stdin.flush();
        }
        // Dropping closes the pipe, so tools that poll stdin see EOF.
        drop(stdin);
    }

    let wait_result = child.wait_with_output();
    ctx.unregister_child(pid);
    finish_timing(&mut result, started);

    match wait_result {
        Ok(output) => {
            let mut stdout_lines = split_lines(&output.stdout);
            let stderr_lines = split_lines(&output.stderr);

            match opts.stderr {
                StderrMode::Merge => stdout_lines.extend(stderr_lines),
                StderrMode::Ignore => {}
                StderrMode::Capture => result.stderr = Some(stderr_lines),
            }

            result.output_line_count = stdout_lines.len();
            result.truncated_output = truncate_output(
                &stdout_lines,
                ctx.env.truncated_output_max_lines,
                ctx.env.truncated_output_max_line_length,
            );
            result.output = stdout_lines;

            result.return_code = output.status.code();
            result.success = output.status.success();
            result.status_message = "finished".into();
            if result.success {
                result.reason = Some("succeeded".into());
            } else {
                result.reason = Some("failed".into());
                if !opts.quiet {
                    result.log_level = Level::Error;
                }
            }
        }
        Err(err) => {
            result.status_message = "finished".into();
            result.reason = Some(format!("failed to collect output: {err}"));
            if !opts.quiet {
                result.log_level = Level::Error;
            }
        }
    }

    // A dead worker can leave a lock file behind that makes every subsequent
    // git/svn run fail; clearing it converts a hard failure into a one-cycle
    // hiccup.
    if !result.success
        && is_git_or_svn(&result.args)
        && let Some(repo_path) = opts.lock_scan_path
        && lockfiles::clear_lock_files(ctx, repo_path)
    {
        result.log_level = Level::Warning;
        result.status_message = "finished".into();
        result.reason = Some("failed due to a lock file".into());
    }

    if !(opts.quiet && result.log_level == Level::Debug) {
        log_status(ctx, &result, None, opts.quiet);
    }

    result
}

fn is_git_or_svn(args: &str) -> bool {
    args.contains("git") || args.contains("svn")
}

fn finish_timing(result: &mut CommandResult, started: Instant) {
    result.end_time = Local::now();
    result.execution_time_seconds = started.elapsed().as_secs_f64();
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

fn log_status(ctx: &Context, result: &CommandResult, metadata: Option<&Value>, quiet: bool) {
    if quiet && result.log_level == Level::Debug {
        return;
    }
    let mut data = serde_json::Map::new();
    data.insert("process".into(), result.to_log_value());
    if let Some(metadata) = metadata {
        data.insert("psutils".into(), metadata.clone());
    }
    logging::log(
        ctx,
        result.log_level,
        &format!("Process {}", result.status_message),
        LogExtra {
            data: Some(Value::Object(data)),
            correlation_id: Some(&result.span),
            ..LogExtra::default()
        },
    );
}

/// Truncate subprocess output for logs: keep the first and last
/// ⌊max_lines/2⌋ non-empty lines around an explicit marker, and shorten any
/// line wider than `max_line_length`.
pub fn truncate_output(output: &[String], max_lines: usize, max_line_length: usize) -> Vec<String> {
    let mut truncated: Vec<String> = if output.len() <= max_lines {
        output.iter().filter(|l| !l.is_empty()).cloned().collect()
    } else {
        let half = max_lines / 2;

        let first_half: Vec<String> = output
            .iter()
            .filter(|l| !l.is_empty())
            .take(half)
            .cloned()
            .collect();
        let mut second_half: Vec<String> = output
            .iter()
            .rev()
            .filter(|l| !l.is_empty())
            .take(half)
            .cloned()
            .collect();
        second_half.reverse();

        let mut lines = first_half;
        lines.push(format!(
            "...TRUNCATED FROM {} LINES TO {} LINES FOR LOGS...",
            output.len(),
            max_lines
        ));
        lines.extend(second_half);
        lines
    };

    for line in &mut truncated {
        let length = line.chars().count();
        if length > max_line_length {
            let mut shortened: String = line.chars().take(max_line_length).collect();
            shortened.push_str(&format!(
                "...LINE TRUNCATED FROM {length} CHARACTERS TO {max_line_length} CHARACTERS FOR LOGS"
            ));
            *line = shortened;
        }
    }

    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvConfig;

    fn test_context() -> Context {
        Context::new(EnvConfig::default())
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn successful_command_captures_output() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["sh", "-c", "echo one; echo two"]),
            RunOptions {
                quiet: true,
                ..RunOptions::default()
            },
        );
        assert!(result.success);
        assert_eq!(result.return_code, Some(0));
        assert_eq!(result.output, vec!["one", "two"]);
        assert_eq!(result.output_line_count, 2);
        assert!(result.pid.is_some());
        assert_eq!(result.span.len(), 8);
    }

    #[test]
    fn failing_command_is_not_an_error() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["sh", "-c", "exit 3"]),
            RunOptions {
                quiet: true,
                ..RunOptions::default()
            },
        );
        assert!(!result.success);
        assert_eq!(result.return_code, Some(3));
        assert_eq!(result.reason.as_deref(), Some("failed"));
    }

    #[test]
    fn missing_binary_reports_reason() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["definitely-not-a-real-binary-4242"]),
            RunOptions {
                quiet: true,
                ..RunOptions::default()
            },
        );
        assert!(!result.success);
        assert!(result.reason.unwrap().starts_with("failed to start"));
        assert!(result.pid.is_none());
    }

    #[test]
    fn stderr_merged_by_default() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["sh", "-c", "echo out; echo err 1>&2"]),
            RunOptions {
                quiet: true,
                ..RunOptions::default()
            },
        );
        assert!(result.output.contains(&"out".to_string()));
        assert!(result.output.contains(&"err".to_string()));
        assert!(result.stderr.is_none());
    }

    #[test]
    fn stderr_captured_separately_on_request() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["sh", "-c", "echo out; echo err 1>&2"]),
            RunOptions {
                quiet: true,
                stderr: StderrMode::Capture,
                ..RunOptions::default()
            },
        );
        assert_eq!(result.output, vec!["out"]);
        assert_eq!(result.stderr, Some(vec!["err".to_string()]));
    }

    #[test]
    fn stderr_ignored_on_request() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["sh", "-c", "echo err 1>&2"]),
            RunOptions {
                quiet: true,
                stderr: StderrMode::Ignore,
                ..RunOptions::default()
            },
        );
        assert!(result.output.is_empty());
    }

    #[test]
    fn password_arrives_on_stdin() {
        let ctx = test_context();
        let result = run(
            &ctx,
            &argv(&["sh", "-c", "read line; echo got:$line"]),
            RunOptions {
                quiet: true,
                password: Some("hunter2"),
                ..RunOptions::default()
            },
        );
        assert!(result.success);
        assert_eq!(result.output, vec!["got:hunter2"]);
    }

    #[test]
    fn child_registry_empty_after_run() {
        let ctx = test_context();
        run(
            &ctx,
            &argv(&["sh", "-c", "true"]),
            RunOptions {
                quiet: true,
                ..RunOptions::default()
            },
        );
        assert!(ctx.tracked_children().is_empty());
    }

    #[test]
    fn truncation_under_limit_only_drops_empty_lines() {
        let output = argv(&["a", "", "b"]);
        assert_eq!(truncate_output(&output, 11, 200), argv(&["a", "b"]));
    }

    #[test]
    fn truncation_over_limit_keeps_halves_and_marker() {
        let output: Vec<String> = (1..=30).map(|i| format!("line{i}")).collect();
        let truncated = truncate_output(&output, 11, 200);

        // max/2 head + marker + max/2 tail
        assert_eq!(truncated.len(), 11);
        assert_eq!(truncated[0], "line1");
        assert_eq!(truncated[4], "line5");
        assert!(truncated[5].contains("TRUNCATED FROM 30 LINES TO 11 LINES"));
        assert_eq!(truncated[6], "line26");
        assert_eq!(truncated[10], "line30");
    }

    #[test]
    fn truncation_skips_empty_lines_when_picking_halves() {
        let mut output = vec![String::new(); 5];
        output.extend((1..=20).map(|i| format!("line{i}")));
        let truncated = truncate_output(&output, 5, 200);
        assert_eq!(truncated[0], "line1");
        assert_eq!(truncated[1], "line2");
        assert!(truncated[2].contains("TRUNCATED"));
        assert_eq!(truncated[3], "line19");
        assert_eq!(truncated[4], "line20");
    }

    #[test]
    fn long_lines_get_width_marker() {
        let output = vec!["x".repeat(300)];
        let truncated = truncate_output(&output, 11, 200);
        assert!(truncated[0].starts_with(&"x".repeat(200)));
        assert!(
            truncated[0].contains("LINE TRUNCATED FROM 300 CHARACTERS TO 200 CHARACTERS")
        );
    }
}

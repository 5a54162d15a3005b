//! Structured JSON logging.
//!
//! One JSON object per record on stdout. Every record carries the cycle
//! counter and wall-clock fields; warnings and above (or everything when the
//! daemon runs at DEBUG) are enriched with caller location, container uptime,
//! and image build metadata. The fully assembled payload is redacted through
//! the secret store as the last step before emission.
//!
//! CRITICAL is not a severity so much as a verdict: the record is emitted and
//! the process exits with status 1.

use std::io::Write;
use std::panic::Location;
use std::str::FromStr;

use chrono::Local;
use serde_json::{Map, Value, json};

use crate::context::Context;
use crate::job::Job;

/// Log severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
        }
    }

    /// Parse a level name; unknown names fall back to DEBUG so a typo in an
    /// event site never suppresses the record.
    pub fn parse(name: &str) -> Level {
        Level::from_str(name).unwrap_or(Level::Debug)
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARNING" | "WARN" => Ok(Level::Warning),
            "ERROR" => Ok(Level::Error),
            "CRITICAL" => Ok(Level::Critical),
            _ => Err(()),
        }
    }
}

/// Optional enrichment for a single record.
#[derive(Default)]
pub struct LogExtra<'a> {
    /// Job descriptor owned by the calling worker.
    pub job: Option<&'a Job>,
    /// Extra top-level fields, merged into the payload.
    pub data: Option<Value>,
    pub correlation_id: Option<&'a str>,
    /// Attach the environment configuration.
    pub env_vars: bool,
    /// Attach a concurrency snapshot from the manager.
    pub concurrency: bool,
    /// Attach an error chain under `exception`.
    pub exception: Option<&'a anyhow::Error>,
}

#[track_caller]
pub fn debug(ctx: &Context, message: &str) {
    log(ctx, Level::Debug, message, LogExtra::default());
}

#[track_caller]
pub fn info(ctx: &Context, message: &str) {
    log(ctx, Level::Info, message, LogExtra::default());
}

#[track_caller]
pub fn warning(ctx: &Context, message: &str) {
    log(ctx, Level::Warning, message, LogExtra::default());
}

#[track_caller]
pub fn error(ctx: &Context, message: &str) {
    log(ctx, Level::Error, message, LogExtra::default());
}

/// Emit a CRITICAL record and terminate the process with exit code 1.
#[track_caller]
pub fn critical(ctx: &Context, message: &str, extra: LogExtra) -> ! {
    log(ctx, Level::Critical, message, extra);
    std::process::exit(1);
}

/// Emit one structured record.
#[track_caller]
pub fn log(ctx: &Context, level: Level, message: &str, extra: LogExtra) {
    if level < ctx.env.log_level && level != Level::Critical {
        return;
    }

    let caller = Location::caller();
    let payload = build_payload(ctx, level, message, caller, &extra);
    let payload = ctx.secrets.redact(payload);
    emit(&payload);

    if level == Level::Critical {
        std::process::exit(1);
    }
}

fn build_payload(
    ctx: &Context,
    level: Level,
    message: &str,
    caller: &Location<'_>,
    extra: &LogExtra,
) -> Value {
    let now = Local::now();
    let timestamp = now.timestamp_micros() as f64 / 1_000_000.0;

    let mut payload = Map::new();
    payload.insert("level".into(), json!(level.as_str()));
    payload.insert("message".into(), json!(message));
    payload.insert("cycle".into(), json!(ctx.cycle()));
    payload.insert("date".into(), json!(now.format("%Y-%m-%d").to_string()));
    payload.insert("time".into(), json!(now.format("%H:%M:%S%.6f").to_string()));
    payload.insert(
        "timestamp".into(),
        json!((timestamp * 10_000.0).round() / 10_000.0),
    );

    // Caller location, container identity, and build metadata are only worth
    // the bytes on records someone will investigate.
    if level >= Level::Warning || ctx.env.log_level == Level::Debug {
        payload.insert(
            "code".into(),
            json!({
                "caller": {"file": caller.file(), "line": caller.line()},
            }),
        );
        payload.insert(
            "process".into(),
            json!({"pid": std::process::id()}),
        );
        payload.insert(
            "container".into(),
            json!({
                "uptime": format_uptime(ctx.uptime().as_secs()),
                "start_datetime": ctx.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                "id": ctx.container_id,
            }),
        );
        payload.insert(
            "image".into(),
            json!({
                "build_tag": ctx.env.build_tag_or_commit(),
                "build_date": ctx.env.build_date,
            }),
        );
    }

    if let Some(job) = extra.job {
        if !job.config.repo_key.is_empty() {
            payload.insert("repo_key".into(), json!(job.config.repo_key));
        }
        payload.insert("job".into(), job.to_log_value());
    }

    if let Some(Value::Object(data)) = &extra.data {
        for (key, value) in data {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(correlation_id) = extra.correlation_id {
        payload.insert("correlation_id".into(), json!(correlation_id));
    }

    if extra.env_vars {
        payload.insert("env_vars".into(), ctx.env.to_log_value());
    }

    if extra.concurrency {
        payload.insert("concurrency".into(), ctx.limits.status(ctx));
    }

    if let Some(err) = extra.exception {
        let chain: Vec<String> = err.chain().skip(1).map(|cause| cause.to_string()).collect();
        payload.insert(
            "exception".into(),
            json!({"message": err.to_string(), "chain": chain}),
        );
    }

    prune(Value::Object(payload))
}

/// Drop null and empty-string values recursively, preserving zeros and
/// booleans. Containers that prune down to nothing are dropped too.
fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut output = Map::new();
            for (key, value) in map {
                let pruned = prune(value);
                if keep(&pruned) {
                    output.insert(key, pruned);
                }
            }
            Value::Object(output)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(prune)
                .filter(keep)
                .collect(),
        ),
        other => other,
    }
}

fn keep(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn emit(payload: &Value) {
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    // A failed write to stdout means the log pipe is gone; nothing useful to
    // do about it from inside the logger.
    let _ = serde_json::to_writer(&mut handle, payload);
    let _ = handle.write_all(b"\n");
    let _ = handle.flush();
}

/// Format seconds as `2d 14h 35m 42s`, omitting leading zero components.
pub fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warning);
        assert!(Level::Warning < Level::Error);
        assert!(Level::Error < Level::Critical);
    }

    #[test]
    fn level_parse_falls_back_to_debug() {
        assert_eq!(Level::parse("warning"), Level::Warning);
        assert_eq!(Level::parse("WARN"), Level::Warning);
        assert_eq!(Level::parse("nonsense"), Level::Debug);
    }

    #[test]
    fn prune_drops_nulls_and_empty_strings() {
        let input = json!({
            "keep": "value",
            "zero": 0,
            "off": false,
            "gone": null,
            "blank": "",
            "nested": {"gone": null, "blank": ""},
            "empty_list": [],
            "list": ["a", "", null, 0],
        });
        let pruned = prune(input);
        assert_eq!(
            pruned,
            json!({
                "keep": "value",
                "zero": 0,
                "off": false,
                "list": ["a", 0],
            })
        );
    }

    #[test]
    fn prune_keeps_nonempty_nested_objects() {
        let input = json!({"outer": {"inner": 1, "gone": null}});
        assert_eq!(prune(input), json!({"outer": {"inner": 1}}));
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(62), "1m 2s");
        assert_eq!(format_uptime(3_601), "1h 1s");
        assert_eq!(
            format_uptime(2 * 86_400 + 14 * 3_600 + 35 * 60 + 42),
            "2d 14h 35m 42s"
        );
    }
}

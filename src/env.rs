//! Environment-derived configuration.
//!
//! Every knob the daemon exposes is an environment variable with a default,
//! read once at startup. The container contract assumes env vars cannot
//! change without a restart, so nothing here is re-read later.

use std::env;
use std::path::PathBuf;

use anyhow::{Context as _, Result};

use crate::logging::Level;

/// Configuration snapshot taken from the process environment at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub log_level: Level,
    pub max_concurrent_conversions_global: usize,
    pub max_concurrent_conversions_per_server: usize,
    /// 0 means run forever.
    pub max_cycles: u64,
    pub max_retries: u32,
    pub repo_converter_interval_seconds: u64,
    /// 0 disables the status monitor thread.
    pub status_monitor_interval: u64,
    pub repos_to_convert: PathBuf,
    pub src_serve_root: PathBuf,
    pub log_recent_commits: usize,
    pub truncated_output_max_lines: usize,
    pub truncated_output_max_line_length: usize,
    pub build_tag: String,
    pub build_commit: String,
    pub build_date: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            log_level: Level::Info,
            max_concurrent_conversions_global: 10,
            max_concurrent_conversions_per_server: 10,
            max_cycles: 0,
            max_retries: 3,
            repo_converter_interval_seconds: 3600,
            status_monitor_interval: 60,
            repos_to_convert: PathBuf::from("/sourcegraph/repos-to-convert.yaml"),
            src_serve_root: PathBuf::from("/sourcegraph/src-serve-root"),
            log_recent_commits: 0,
            truncated_output_max_lines: 11,
            truncated_output_max_line_length: 200,
            build_tag: String::new(),
            build_commit: String::new(),
            build_date: String::new(),
        }
    }
}

impl EnvConfig {
    /// Read the full configuration from the process environment.
    ///
    /// Unparseable numeric values are startup errors: the container should
    /// fail fast rather than run with a silently wrong limit.
    pub fn from_env() -> Result<Self> {
        let defaults = EnvConfig::default();

        Ok(EnvConfig {
            log_level: Level::parse(&var_or("LOG_LEVEL", "INFO")),
            max_concurrent_conversions_global: parse_var(
                "MAX_CONCURRENT_CONVERSIONS_GLOBAL",
                defaults.max_concurrent_conversions_global,
            )?,
            max_concurrent_conversions_per_server: parse_var(
                "MAX_CONCURRENT_CONVERSIONS_PER_SERVER",
                defaults.max_concurrent_conversions_per_server,
            )?,
            max_cycles: parse_var("MAX_CYCLES", defaults.max_cycles)?,
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
            repo_converter_interval_seconds: parse_var(
                "REPO_CONVERTER_INTERVAL_SECONDS",
                defaults.repo_converter_interval_seconds,
            )?,
            status_monitor_interval: status_monitor_interval()?,
            repos_to_convert: PathBuf::from(var_or(
                "REPOS_TO_CONVERT",
                "/sourcegraph/repos-to-convert.yaml",
            )),
            src_serve_root: PathBuf::from(var_or(
                "SRC_SERVE_ROOT",
                "/sourcegraph/src-serve-root",
            )),
            log_recent_commits: parse_var("LOG_RECENT_COMMITS", defaults.log_recent_commits)?,
            truncated_output_max_lines: parse_var(
                "TRUNCATED_OUTPUT_MAX_LINES",
                defaults.truncated_output_max_lines,
            )?,
            truncated_output_max_line_length: parse_var(
                "TRUNCATED_OUTPUT_MAX_LINE_LENGTH",
                defaults.truncated_output_max_line_length,
            )?,
            build_tag: var_or("BUILD_TAG", ""),
            build_commit: var_or("BUILD_COMMIT", ""),
            build_date: var_or("BUILD_DATE", ""),
        })
    }

    /// Identifier string for log enrichment: the build tag when present,
    /// otherwise the build commit.
    pub fn build_tag_or_commit(&self) -> &str {
        if !self.build_tag.is_empty() {
            &self.build_tag
        } else {
            &self.build_commit
        }
    }

    /// Validate the concurrency limits.
    ///
    /// Returns `Err` for values the daemon cannot run with; the caller logs
    /// these at critical. A per-server limit above the global limit is legal
    /// but pointless, so it only yields a warning message.
    pub fn validate(&self) -> std::result::Result<Option<String>, String> {
        if self.max_concurrent_conversions_per_server == 0 {
            return Err("MAX_CONCURRENT_CONVERSIONS_PER_SERVER must be greater than 0".into());
        }

        if self.max_concurrent_conversions_global == 0 {
            return Err("MAX_CONCURRENT_CONVERSIONS_GLOBAL must be greater than 0".into());
        }

        if self.max_concurrent_conversions_per_server > self.max_concurrent_conversions_global {
            return Ok(Some(format!(
                "MAX_CONCURRENT_CONVERSIONS_PER_SERVER={} is greater than \
                 MAX_CONCURRENT_CONVERSIONS_GLOBAL={}, the per-server limit will never be hit",
                self.max_concurrent_conversions_per_server, self.max_concurrent_conversions_global
            )));
        }

        Ok(None)
    }

    /// The configuration as a JSON object, for `env_vars` log enrichment.
    pub fn to_log_value(&self) -> serde_json::Value {
        serde_json::json!({
            "LOG_LEVEL": self.log_level.as_str(),
            "MAX_CONCURRENT_CONVERSIONS_GLOBAL": self.max_concurrent_conversions_global,
            "MAX_CONCURRENT_CONVERSIONS_PER_SERVER": self.max_concurrent_conversions_per_server,
            "MAX_CYCLES": self.max_cycles,
            "MAX_RETRIES": self.max_retries,
            "REPO_CONVERTER_INTERVAL_SECONDS": self.repo_converter_interval_seconds,
            "STATUS_MONITOR_INTERVAL": self.status_monitor_interval,
            "REPOS_TO_CONVERT": self.repos_to_convert.display().to_string(),
            "SRC_SERVE_ROOT": self.src_serve_root.display().to_string(),
            "LOG_RECENT_COMMITS": self.log_recent_commits,
            "TRUNCATED_OUTPUT_MAX_LINES": self.truncated_output_max_lines,
            "TRUNCATED_OUTPUT_MAX_LINE_LENGTH": self.truncated_output_max_line_length,
            "BUILD_TAG": self.build_tag,
            "BUILD_COMMIT": self.build_commit,
            "BUILD_DATE": self.build_date,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value {value:?} for {key}")),
        Err(_) => Ok(default),
    }
}

/// `STATUS_MONITOR_INTERVAL` with `CONCURRENCY_MONITOR_INTERVAL` as its
/// fallback; both names exist in deployed compose files.
fn status_monitor_interval() -> Result<u64> {
    let fallback = parse_var("CONCURRENCY_MONITOR_INTERVAL", 60)?;
    parse_var("STATUS_MONITOR_INTERVAL", fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EnvConfig::default();
        assert_eq!(config.max_concurrent_conversions_global, 10);
        assert_eq!(config.max_concurrent_conversions_per_server, 10);
        assert_eq!(config.max_cycles, 0);
        assert_eq!(config.repo_converter_interval_seconds, 3600);
        assert_eq!(config.truncated_output_max_lines, 11);
        assert_eq!(config.truncated_output_max_line_length, 200);
        assert_eq!(config.log_level, Level::Info);
    }

    #[test]
    fn build_tag_preferred_over_commit() {
        let mut config = EnvConfig::default();
        config.build_commit = "abc1234".into();
        assert_eq!(config.build_tag_or_commit(), "abc1234");

        config.build_tag = "v1.2.3".into();
        assert_eq!(config.build_tag_or_commit(), "v1.2.3");
    }

    #[test]
    fn zero_limits_rejected() {
        let mut config = EnvConfig::default();
        config.max_concurrent_conversions_per_server = 0;
        assert!(config.validate().is_err());

        let mut config = EnvConfig::default();
        config.max_concurrent_conversions_global = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn per_server_above_global_warns() {
        let mut config = EnvConfig::default();
        config.max_concurrent_conversions_per_server = 20;
        let warning = config.validate().unwrap();
        assert!(warning.unwrap().contains("will never be hit"));
    }

    #[test]
    fn valid_limits_pass_silently() {
        assert_eq!(EnvConfig::default().validate(), Ok(None));
    }
}

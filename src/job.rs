//! Per-attempt job descriptor.
//!
//! A job is one attempt to synchronize one repository in one cycle. The
//! worker that creates it owns it for its lifetime; it is never shared, and
//! every log record the worker emits carries it for correlation via the
//! short random trace id.

use chrono::Utc;
use rand::RngExt;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub trace: String,
    pub config: JobConfig,
    pub result: JobResult,
    pub stats: JobStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobConfig {
    pub repo_key: String,
    pub repo_type: String,
    pub server_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_repo_path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub this_batch_start_rev: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub this_batch_end_rev: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetching_batch_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commits_added: Option<usize>,
}

impl Job {
    pub fn new(
        repo_key: impl Into<String>,
        repo_type: impl Into<String>,
        server_name: impl Into<String>,
        local_repo_path: impl Into<String>,
    ) -> Self {
        Job {
            trace: short_id(),
            config: JobConfig {
                repo_key: repo_key.into(),
                repo_type: repo_type.into(),
                server_name: server_name.into(),
                local_repo_path: local_repo_path.into(),
            },
            result: JobResult::default(),
            stats: JobStats::default(),
        }
    }

    /// Overwrite the result triple in one place so skip/fail paths stay
    /// consistent about which fields they set.
    pub fn set_result(&mut self, action: &str, reason: &str, success: bool) {
        self.result.action = Some(action.to_string());
        self.result.reason = (!reason.is_empty()).then(|| reason.to_string());
        self.result.success = Some(success);
    }

    /// Append to the failure reason, keeping the first reason first.
    pub fn append_reason(&mut self, reason: &str) {
        match &mut self.result.reason {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(reason);
            }
            None => self.result.reason = Some(reason.to_string()),
        }
    }

    /// The job as a log payload. While the job is running (started but not
    /// ended) a derived `running_time_seconds` is included.
    pub fn to_log_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);

        if let (Some(start), None) = (self.result.start_timestamp, self.result.end_timestamp)
            && let Some(result) = value
                .get_mut("result")
                .and_then(|r| r.as_object_mut())
        {
            let running = Utc::now().timestamp().saturating_sub(start);
            result.insert("running_time_seconds".into(), Value::from(running));
        }

        value
    }
}

/// Eight hex characters, enough to correlate log records within a window.
pub fn short_id() -> String {
    let mut rng = rand::rng();
    format!("{:08x}", rng.random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_is_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn traces_are_distinct() {
        // Collisions in a u32 space over three draws would be remarkable.
        let (a, b, c) = (short_id(), short_id(), short_id());
        assert!(a != b || b != c);
    }

    #[test]
    fn set_result_clears_empty_reason() {
        let mut job = Job::new("k", "svn", "s", "/tmp/k");
        job.set_result("up-to-date", "", true);
        assert_eq!(job.result.action.as_deref(), Some("up-to-date"));
        assert_eq!(job.result.reason, None);
        assert_eq!(job.result.success, Some(true));
    }

    #[test]
    fn append_reason_preserves_first() {
        let mut job = Job::new("k", "svn", "s", "/tmp/k");
        job.append_reason("Connection refused");
        job.append_reason("fatal:");
        assert_eq!(
            job.result.reason.as_deref(),
            Some("Connection refused; fatal:")
        );
    }

    #[test]
    fn running_time_derived_for_inflight_job() {
        let mut job = Job::new("k", "svn", "s", "/tmp/k");
        job.result.start_timestamp = Some(Utc::now().timestamp() - 5);
        let value = job.to_log_value();
        let running = value["result"]["running_time_seconds"].as_i64().unwrap();
        assert!((4..=7).contains(&running));

        job.result.end_timestamp = Some(Utc::now().timestamp());
        let value = job.to_log_value();
        assert!(value["result"].get("running_time_seconds").is_none());
    }
}

//! The Subversion conversion state machine.
//!
//! One call to [`convert`] advances one repository by at most one batch of
//! revisions. The driver classifies the on-disk clone as `create` or
//! `update` from its git config, probes the remote with `svn info`, computes
//! the next batch range from `svn log`, fetches it with `git svn fetch`, and
//! finishes with garbage collection and the packed-refs rewrite. Progress is
//! durable only as the `repo-converter.batch-end-revision` config key inside
//! the clone, so a crashed worker costs a cycle and nothing else.

use std::fs;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use rand::RngExt;
use regex::Regex;
use serde_json::json;
use sysinfo::System;

use crate::context::Context;
use crate::exec::{self, CommandResult, RunOptions};
use crate::git::GitRepo;
use crate::inventory::RepoConfig;
use crate::job::Job;
use crate::logging::{self, Level, LogExtra};
use crate::procs;

/// Substrings that mark a fetch as failed regardless of exit code; the first
/// match becomes the job's failure reason.
const FETCH_ERROR_SUBSTRINGS: &[&str] = &[
    "Can't create session",
    "Unable to connect to a repository at URL",
    "Connection refused",
    "Connection timed out",
    "SSL handshake failed",
    "Authentication failed",
    "Authorization failed",
    "Invalid credentials",
    "Repository not found",
    "Path not found",
    "Invalid repository URL",
    "fatal:",
    "error:",
    "abort:",
    "Permission denied",
    "No space left on device",
    "svn: E",
    "Working copy locked",
    "Repository is locked",
];

const SVN_CONNECTION_FAILURE: &str = "Unable to connect to a repository at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepoState {
    Create,
    Update,
}

impl RepoState {
    fn as_str(self) -> &'static str {
        match self {
            RepoState::Create => "create",
            RepoState::Update => "update",
        }
    }
}

/// Convert one repository for one cycle.
pub fn convert(ctx: &Context, job: &mut Job, repo: &RepoConfig) {
    let conversion = Conversion {
        ctx,
        repo,
        git: GitRepo::at(&repo.local_repo_path),
        started: Instant::now(),
    };
    conversion.run(job);
}

struct Conversion<'a> {
    ctx: &'a Context,
    repo: &'a RepoConfig,
    git: GitRepo,
    started: Instant,
}

impl Conversion<'_> {
    fn run(&self, job: &mut Job) {
        let repo_key = &self.repo.repo_key;

        // Redundant with the admission check for jobs of this process, but
        // it also catches tools left behind by a previous incarnation.
        if self.preflight_collision(job) {
            return;
        }

        let state = self.classify();
        job.result.action = Some(state.as_str().to_string());

        let Some(last_changed_rev) = self.validate_remote(job) else {
            return;
        };

        let mut previous_batch_end = None;
        if state == RepoState::Update {
            previous_batch_end = self.git.batch_end_revision(self.ctx);

            if previous_batch_end == Some(last_changed_rev) {
                self.log_info(
                    job,
                    &format!(
                        "{repo_key}; up to date; skipping; local rev {last_changed_rev}, \
                         remote rev {last_changed_rev}"
                    ),
                );
                job.set_result("up-to-date", "", true);
                self.finish_repo(job);
                return;
            }

            self.log_out_of_date(job, previous_batch_end, last_changed_rev);
        }

        if state == RepoState::Create && !self.create_clone(job) {
            return;
        }

        self.apply_repo_config(job);

        let Some((batch_start, batch_end)) = self.compute_batch_range(job, state, previous_batch_end)
        else {
            return;
        };

        job.stats.this_batch_start_rev = Some(batch_start);
        job.stats.this_batch_end_rev = Some(batch_end);

        if state == RepoState::Update
            && let Err(err) = self.git.dedup_config_file(self.ctx)
        {
            logging::warning(
                self.ctx,
                &format!("{repo_key}; failed to deduplicate git config file: {err}"),
            );
        }

        let fetched = self.fetch_batch(job, batch_start, batch_end, state);

        // Validation runs whether or not the fetch succeeded: a failed fetch
        // can leave the clone in a state the next cycle cannot work with,
        // and that needs to be visible now.
        self.validate_repository(job);

        if fetched {
            self.log_recent_commits(job);
        }

        self.finish_repo(job);
    }

    /// `git gc` plus the packed-refs projection, run on every terminal path
    /// that has a clone on disk.
    fn finish_repo(&self, job: &mut Job) {
        self.git.gc(self.ctx, &self.repo.repo_key);

        if let Err(err) = self.git.cleanup_branches_and_tags(
            self.ctx,
            &self.repo.git_default_branch,
            &self.repo.repo_key,
        ) {
            logging::error(
                self.ctx,
                &format!(
                    "{}; failed to clean up branches and tags: {err}",
                    self.repo.repo_key
                ),
            );
        }
    }

    /// Scan the process table for stale operations on this repository.
    ///
    /// Retried a few times because a descendant often completes between
    /// enumeration and the uptime read; a vanished match is not a collision.
    fn preflight_collision(&self, job: &mut Job) -> bool {
        let fetch_needle = format!("git -C {} svn fetch", self.repo.local_repo_path.display());
        let gc_needle = format!("git -C {} gc", self.repo.local_repo_path.display());
        let svn_log_needle = svn_log_command(self.repo).join(" ");
        let path_needle = self.repo.local_repo_path.display().to_string();

        // In priority order.
        let needles = [
            (fetch_needle.as_str(), "Previous fetching process still"),
            (svn_log_needle.as_str(), "Previous svn log process still"),
            (gc_needle.as_str(), "Git garbage collection process still"),
            (path_needle.as_str(), "Local repo path in process still"),
        ];

        let this_pid = std::process::id();
        let max_tries = 3;

        for attempt in 1..=max_tries {
            let mut sys = System::new();
            sys.refresh_processes();

            let mut failure_message = String::new();
            let mut matched_pids = std::collections::BTreeSet::new();
            let mut vanished = false;

            for (pid, process) in sys.processes() {
                if pid.as_u32() == this_pid {
                    continue;
                }
                let cmdline = process.cmd().join(" ");
                for (needle, message) in &needles {
                    if cmdline.contains(needle) && matched_pids.insert(pid.as_u32()) {
                        match procs::pid_uptime(pid.as_u32()) {
                            Some(uptime) => {
                                failure_message.push_str(&format!(
                                    "{message} running in pid {}; running for {}; \
                                     with command: {cmdline}; ",
                                    pid.as_u32(),
                                    logging::format_uptime(uptime.as_secs()),
                                ));
                            }
                            None => {
                                logging::debug(
                                    self.ctx,
                                    &format!(
                                        "{}; pid {} with command {cmdline} completed while \
                                         checking for concurrency collisions, will try \
                                         checking again",
                                        self.repo.repo_key,
                                        pid.as_u32(),
                                    ),
                                );
                                vanished = true;
                            }
                        }
                        break;
                    }
                }
            }

            if vanished && attempt < max_tries {
                continue;
            }

            if failure_message.is_empty() {
                return false;
            }

            failure_message.push_str("skipping");
            job.set_result("skipped", &failure_message, false);
            logging::log(
                self.ctx,
                Level::Info,
                &format!("{}; {failure_message}", self.repo.repo_key),
                LogExtra {
                    job: Some(job),
                    ..LogExtra::default()
                },
            );
            return true;
        }

        false
    }

    /// An existing clone whose `svn-remote.svn.url` matches the configured
    /// code root is updatable; anything else starts from scratch.
    fn classify(&self) -> RepoState {
        match self.git.get_config(self.ctx, "svn-remote.svn.url") {
            Some(remote_url) if !remote_url.is_empty()
                && self.repo.code_root_url.contains(&remote_url) =>
            {
                RepoState::Update
            }
            _ => RepoState::Create,
        }
    }

    /// Probe the remote with `svn info`, retrying connection failures with
    /// randomized backoff inside this cycle's time budget. Returns the
    /// remote's last changed revision.
    fn validate_remote(&self, job: &mut Job) -> Option<u64> {
        let repo_key = &self.repo.repo_key;
        let mut info = self.run_svn(svn_info_command(self.repo), "cmd_svn_info");

        if !info.success {
            // Stay within 80% of the cycle interval so retries never overrun
            // into the next cycle, and cap individual delays so a few
            // attempts fit.
            let interval = self.ctx.env.repo_converter_interval_seconds;
            let deadline = self.started + Duration::from_secs(interval * 8 / 10);
            let delay_cap = (interval / 3).clamp(2, 60);
            let max_attempts = self.repo.max_retries;
            let mut attempts = 0;

            while !info.success
                && info.joined_output().contains(SVN_CONNECTION_FAILURE)
                && Instant::now() < deadline
                && attempts < max_attempts
            {
                attempts += 1;
                let delay = rand::rng().random_range(1..delay_cap);
                logging::warning(
                    self.ctx,
                    &format!(
                        "{repo_key}; Failed to connect to repo remote, retrying {attempts} of \
                         max {max_attempts} times, with a semi-random delay of {delay} seconds"
                    ),
                );
                std::thread::sleep(Duration::from_secs(delay));
                info = self.run_svn(svn_info_command(self.repo), "cmd_svn_info");
            }

            if !info.success {
                let why = if attempts >= max_attempts {
                    format!("hit retry count limit {max_attempts} for this run")
                } else {
                    "hit retry time limit for this run".to_string()
                };
                let action = job.result.action.clone().unwrap_or_else(|| "unknown".to_string());
                job.set_result(
                    &action,
                    &format!("Failed to connect to repo remote, {why}"),
                    false,
                );
                logging::log(
                    self.ctx,
                    Level::Error,
                    &format!("{repo_key}; Failed to connect to repo remote, {why}, skipping"),
                    LogExtra {
                        job: Some(job),
                        ..LogExtra::default()
                    },
                );
                return None;
            }

            logging::warning(
                self.ctx,
                &format!(
                    "{repo_key}; Successfully connected to repo remote after {attempts} retries"
                ),
            );
        }

        match parse_last_changed_rev(&info.output) {
            Some(revision) => Some(revision),
            None => {
                let action = job.result.action.clone().unwrap_or_else(|| "unknown".to_string());
                job.set_result(
                    &action,
                    "svn info output missing Last Changed Rev",
                    false,
                );
                logging::warning(
                    self.ctx,
                    &format!("{repo_key}; svn info output missing Last Changed Rev, skipping"),
                );
                None
            }
        }
    }

    fn log_out_of_date(&self, job: &mut Job, previous: Option<u64>, last_changed_rev: u64) {
        let previous = previous.unwrap_or(1);
        let log_result = self.run_svn(
            {
                let mut args = svn_log_command(self.repo);
                args.push("--revision".into());
                args.push(format!("{previous}:HEAD"));
                args
            },
            "cmd_svn_log_remaining_revs",
        );

        let remaining = count_revisions(&log_result.output);
        let next_batch = remaining.min(self.repo.fetch_batch_size);
        logging::log(
            self.ctx,
            Level::Info,
            &format!(
                "{}; out of date; local rev {previous}, remote rev {last_changed_rev}, \
                 {remaining} revs remaining to catch up, fetching next batch of {next_batch} \
                 revisions",
                self.repo.repo_key
            ),
            LogExtra {
                job: Some(job),
                ..LogExtra::default()
            },
        );
    }

    /// Create the local path, run `git svn init`, and seed the progress key.
    fn create_clone(&self, job: &mut Job) -> bool {
        let repo_key = &self.repo.repo_key;
        self.log_info(job, &format!("{repo_key}; didn't find a local clone, creating one"));

        if let Err(err) = fs::create_dir_all(&self.repo.local_repo_path) {
            job.set_result("create", &format!("failed to create local path: {err}"), false);
            logging::error(
                self.ctx,
                &format!(
                    "{repo_key}; failed to create local path {}: {err}",
                    self.repo.local_repo_path.display()
                ),
            );
            return false;
        }

        if let Some(layout) = &self.repo.layout
            && !layout.contains("standard")
            && !layout.contains("std")
        {
            logging::warning(
                self.ctx,
                &format!(
                    "{repo_key}; Layout shortcut provided with incorrect value {layout}, only \
                     standard is supported for the shortcut, continuing assuming standard, \
                     otherwise provide --trunk, --tags, and --branches"
                ),
            );
        }

        let init = self.run_git_svn(git_svn_init_command(self.repo), "cmd_git_svn_init");
        if !init.success {
            job.set_result("create", "git svn init failed", false);
            return false;
        }

        if self.repo.bare_clone {
            self.git
                .set_config(self.ctx, "core.bare", "true", &self.repo.repo_key);
        }

        self.git.set_batch_end_revision(self.ctx, 0, &self.repo.repo_key);
        true
    }

    /// Settings users may change without restarting the clone from scratch,
    /// applied on every cycle for both states.
    fn apply_repo_config(&self, _job: &mut Job) {
        let repo_key = &self.repo.repo_key;

        self.git
            .set_default_branch_head(self.ctx, &self.repo.git_default_branch, repo_key);

        if let Some(authors_file) = &self.repo.authors_file_path {
            if authors_file.exists() {
                self.git.set_config(
                    self.ctx,
                    "svn.authorsfile",
                    &authors_file.display().to_string(),
                    repo_key,
                );
            } else {
                logging::warning(
                    self.ctx,
                    &format!(
                        "{repo_key}; authors file not found at {}, skipping configuring it",
                        authors_file.display()
                    ),
                );
            }
        }

        if let Some(authors_prog) = &self.repo.authors_prog_path {
            if authors_prog.exists() {
                self.git.set_config(
                    self.ctx,
                    "svn.authorsProg",
                    &authors_prog.display().to_string(),
                    repo_key,
                );
            } else {
                logging::warning(
                    self.ctx,
                    &format!(
                        "{repo_key}; authors prog not found at {}, skipping configuring it",
                        authors_prog.display()
                    ),
                );
            }
        }

        if let Some(ignore_file) = &self.repo.git_ignore_file_path {
            if ignore_file.exists() {
                if let Err(err) =
                    fs::copy(ignore_file, self.repo.local_repo_path.join(".gitignore"))
                {
                    logging::warning(
                        self.ctx,
                        &format!("{repo_key}; failed to copy .gitignore file: {err}"),
                    );
                }
            } else {
                logging::warning(
                    self.ctx,
                    &format!(
                        "{repo_key}; .gitignore file not found at {}, skipping configuring it",
                        ignore_file.display()
                    ),
                );
            }
        }
    }

    /// Work out the revision range for this cycle's fetch.
    ///
    /// The requested start is corrected upward to the first real revision at
    /// or after it, because source history may be sparse. A parse failure
    /// skips the cycle; the state on disk is unchanged and the next cycle
    /// retries.
    fn compute_batch_range(
        &self,
        job: &mut Job,
        state: RepoState,
        previous_batch_end: Option<u64>,
    ) -> Option<(u64, u64)> {
        let repo_key = &self.repo.repo_key;

        let requested_start = match (state, previous_batch_end) {
            (RepoState::Update, Some(previous)) => previous + 1,
            _ => {
                // New clone: ask the server for its first real revision.
                let mut args = svn_log_command(self.repo);
                args.extend([
                    "--limit".to_string(),
                    "1".to_string(),
                    "--revision".to_string(),
                    "1:HEAD".to_string(),
                ]);
                let first = self.run_svn(args, "cmd_svn_log_batch_start_revision");
                match revision_bounds(&first.output) {
                    Some((first_revision, _)) => first_revision,
                    None => {
                        job.set_result(
                            state.as_str(),
                            "could not parse first revision from svn log",
                            false,
                        );
                        logging::warning(
                            self.ctx,
                            &format!(
                                "{repo_key}; could not parse first revision from svn log, \
                                 skipping this run to retry next run"
                            ),
                        );
                        return None;
                    }
                }
            }
        };

        let mut args = svn_log_command(self.repo);
        args.extend([
            "--limit".to_string(),
            self.repo.fetch_batch_size.to_string(),
            "--revision".to_string(),
            format!("{requested_start}:HEAD"),
        ]);
        let batch = self.run_svn(args, "cmd_svn_log_batch_end_revision");

        match revision_bounds(&batch.output) {
            Some((batch_start, batch_end)) => {
                job.stats.fetching_batch_count = Some(count_revisions(&batch.output));
                Some((batch_start, batch_end))
            }
            None => {
                job.set_result(
                    state.as_str(),
                    "could not parse batch start or end revision from svn log",
                    false,
                );
                logging::warning(
                    self.ctx,
                    &format!(
                        "{repo_key}; could not parse batch start or end revisions for batch \
                         size {}, skipping this run to retry next run",
                        self.repo.fetch_batch_size
                    ),
                );
                None
            }
        }
    }

    /// Run the fetch and, on success, advance the durable progress cursor.
    fn fetch_batch(&self, job: &mut Job, start: u64, end: u64, state: RepoState) -> bool {
        let repo_key = &self.repo.repo_key;
        let fetch_args = git_svn_fetch_command(self.repo, Some((start, end)));

        self.log_info(
            job,
            &format!("{repo_key}; fetching with {}", fetch_args.join(" ")),
        );

        let fetch = self.run_git_svn(fetch_args, "cmd_git_svn_fetch");

        let known_error = classify_fetch_error(&fetch.output);
        let succeeded = fetch.success && known_error.is_none();

        if succeeded && end > 0 {
            self.git.set_batch_end_revision(self.ctx, end, repo_key);
            job.set_result(state.as_str(), "", true);
            logging::log(
                self.ctx,
                Level::Info,
                &format!(
                    "{repo_key}; git fetch complete; run time {:.1}s",
                    fetch.execution_time_seconds
                ),
                LogExtra {
                    job: Some(job),
                    ..LogExtra::default()
                },
            );
            true
        } else {
            job.result.action = Some(state.as_str().to_string());
            job.result.success = Some(false);
            if fetch.reason.as_deref() == Some("failed due to a lock file") {
                job.append_reason("failed due to a lock file");
            } else if let Some(reason) = known_error {
                job.append_reason(reason);
            } else {
                job.append_reason("git fetch failed");
            }
            logging::log(
                self.ctx,
                Level::Error,
                &format!(
                    "{repo_key}; git fetch failed; run time {:.1}s",
                    fetch.execution_time_seconds
                ),
                LogExtra {
                    job: Some(job),
                    ..LogExtra::default()
                },
            );
            false
        }
    }

    /// A converted clone should answer basic git and git-svn queries; one
    /// that can't gets flagged so the failure is visible before the next
    /// fetch makes it worse.
    fn validate_repository(&self, job: &mut Job) {
        let checks: [&[&str]; 3] = [
            &["status", "--porcelain"],
            &["rev-parse", "HEAD"],
            &["svn", "info"],
        ];

        let healthy = checks
            .iter()
            .all(|check| self.git.run_quiet(self.ctx, check).success);

        if healthy {
            logging::debug(
                self.ctx,
                &format!("{}; repository validation passed", self.repo.repo_key),
            );
        } else {
            job.result.success = Some(false);
            job.append_reason("repository validation failed");
            logging::warning(
                self.ctx,
                &format!("{}; repository validation failed", self.repo.repo_key),
            );
        }
    }

    fn log_recent_commits(&self, job: &mut Job) {
        let count = self.ctx.env.log_recent_commits;
        if count == 0 {
            return;
        }

        let result = self.git.run_quiet(
            self.ctx,
            &["log", "--format=%h %s", "-n", &count.to_string(), "refs/remotes/git-svn"],
        );
        if result.success {
            job.stats.git_commits_added = job.stats.fetching_batch_count;
            logging::log(
                self.ctx,
                Level::Debug,
                &format!("{}; recent commits", self.repo.repo_key),
                LogExtra {
                    job: Some(job),
                    data: Some(json!({"recent_commits": result.truncated_output})),
                    ..LogExtra::default()
                },
            );
        }
    }

    /// Direct `svn` invocations authenticate with `--password` on argv plus
    /// an echo on stdin for prompt-driven builds; the runner registers the
    /// password as never-logged via the secret store at inventory load.
    fn run_svn(&self, args: Vec<String>, name: &str) -> CommandResult {
        exec::run(
            self.ctx,
            &args,
            RunOptions {
                password: self.repo.password.as_deref(),
                name: Some(name),
                repo_key: Some(&self.repo.repo_key),
                lock_scan_path: Some(&self.repo.local_repo_path),
                ..RunOptions::default()
            },
        )
    }

    /// `git svn` subcommands read credentials from stdin only.
    fn run_git_svn(&self, args: Vec<String>, name: &str) -> CommandResult {
        exec::run(
            self.ctx,
            &args,
            RunOptions {
                password: self.repo.password.as_deref(),
                name: Some(name),
                repo_key: Some(&self.repo.repo_key),
                lock_scan_path: Some(&self.repo.local_repo_path),
                ..RunOptions::default()
            },
        )
    }

    fn log_info(&self, job: &mut Job, message: &str) {
        logging::log(
            self.ctx,
            Level::Info,
            message,
            LogExtra {
                job: Some(job),
                ..LogExtra::default()
            },
        );
    }
}

/// `svn info --non-interactive <code-root> [--username …] [--password …]`
fn svn_info_command(repo: &RepoConfig) -> Vec<String> {
    let mut args = vec![
        "svn".to_string(),
        "info".to_string(),
        "--non-interactive".to_string(),
        repo.code_root_url.clone(),
    ];
    push_svn_credentials(&mut args, repo);
    args
}

/// `svn log --xml --with-no-revprops --non-interactive <code-root> …`
fn svn_log_command(repo: &RepoConfig) -> Vec<String> {
    let mut args = vec![
        "svn".to_string(),
        "log".to_string(),
        "--xml".to_string(),
        "--with-no-revprops".to_string(),
        "--non-interactive".to_string(),
        repo.code_root_url.clone(),
    ];
    push_svn_credentials(&mut args, repo);
    args
}

fn push_svn_credentials(args: &mut Vec<String>, repo: &RepoConfig) {
    if let Some(username) = &repo.username {
        args.push("--username".to_string());
        args.push(username.clone());
    }
    if let Some(password) = &repo.password {
        args.push("--password".to_string());
        args.push(password.clone());
    }
}

/// `git -C <path> svn init <code-root>` with layout flags.
fn git_svn_init_command(repo: &RepoConfig) -> Vec<String> {
    let mut args = vec![
        "git".to_string(),
        "-C".to_string(),
        repo.local_repo_path.display().to_string(),
        "svn".to_string(),
        "init".to_string(),
        repo.code_root_url.clone(),
    ];

    if let Some(username) = &repo.username {
        args.push("--username".to_string());
        args.push(username.clone());
    }

    if repo.layout.is_some() {
        args.push("--stdlayout".to_string());
    }

    // There can only be one trunk; tags and branches may repeat.
    if let Some(trunk) = &repo.trunk {
        args.push("--trunk".to_string());
        args.push(trunk.clone());
    }
    for tag in &repo.tags {
        args.push("--tags".to_string());
        args.push(tag.clone());
    }
    for branch in &repo.branches {
        args.push("--branches".to_string());
        args.push(branch.clone());
    }

    args
}

/// `git -C <path> svn fetch [--username …] [--revision start:end]`
fn git_svn_fetch_command(repo: &RepoConfig, range: Option<(u64, u64)>) -> Vec<String> {
    let mut args = vec![
        "git".to_string(),
        "-C".to_string(),
        repo.local_repo_path.display().to_string(),
        "svn".to_string(),
        "fetch".to_string(),
    ];

    if let Some(username) = &repo.username {
        args.push("--username".to_string());
        args.push(username.clone());
    }

    if let Some((start, end)) = range {
        args.push("--revision".to_string());
        args.push(format!("{start}:{end}"));
    }

    args
}

/// Extract `Last Changed Rev: N` from `svn info` output.
pub fn parse_last_changed_rev(lines: &[String]) -> Option<u64> {
    lines.iter().find_map(|line| {
        line.trim()
            .strip_prefix("Last Changed Rev: ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse().ok())
    })
}

fn revision_regex() -> &'static Regex {
    static REVISION: OnceLock<Regex> = OnceLock::new();
    REVISION.get_or_init(|| Regex::new(r#"revision="(\d+)""#).expect("valid regex"))
}

/// First and last `revision="N"` attributes in svn log XML, treated as
/// line-oriented text in the order the server returned them.
pub fn revision_bounds(lines: &[String]) -> Option<(u64, u64)> {
    let joined = lines.join(" ");
    let mut revisions = revision_regex()
        .captures_iter(&joined)
        .filter_map(|captures| captures[1].parse::<u64>().ok());

    let first = revisions.next()?;
    let last = revisions.last().unwrap_or(first);
    Some((first, last))
}

/// Number of revision entries in svn log XML output.
pub fn count_revisions(lines: &[String]) -> usize {
    lines.join(" ").matches("revision=").count()
}

/// First known failure substring in fetch output, if any.
pub fn classify_fetch_error(lines: &[String]) -> Option<&'static str> {
    let joined = lines.join(" ");
    FETCH_ERROR_SUBSTRINGS
        .iter()
        .find(|substring| joined.contains(*substring))
        .copied()
}

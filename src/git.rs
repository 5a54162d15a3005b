//! Helpers for the converted Git repositories.
//!
//! A [`GitRepo`] wraps one on-disk clone and runs `git -C <path> …` through
//! the subprocess runner. Progress metadata lives inside each repository's
//! own config under the `repo-converter` namespace, which is what lets the
//! daemon reconstruct all scheduling state from the filesystem after a
//! restart.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::exec::{self, CommandResult, RunOptions};
use crate::logging;

/// Namespace for daemon metadata inside each repository's git config.
pub const GIT_CONFIG_NAMESPACE: &str = "repo-converter";

/// Config key recording the last successfully fetched SVN revision.
pub fn batch_end_revision_key() -> String {
    format!("{GIT_CONFIG_NAMESPACE}.batch-end-revision")
}

/// One converted repository on disk.
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        GitRepo { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config_file_path(&self) -> PathBuf {
        self.path.join(".git/config")
    }

    pub fn packed_refs_path(&self) -> PathBuf {
        self.path.join(".git/packed-refs")
    }

    fn git_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec![
            "git".to_string(),
            "-C".to_string(),
            self.path.display().to_string(),
        ];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    /// Run a git command in this repository, quietly; callers inspect the
    /// result.
    pub fn run_quiet(&self, ctx: &Context, rest: &[&str]) -> CommandResult {
        exec::run(
            ctx,
            &self.git_args(rest),
            RunOptions {
                quiet: true,
                ..RunOptions::default()
            },
        )
    }

    /// Run a git command with normal logging and lock-file recovery.
    pub fn run(&self, ctx: &Context, rest: &[&str], repo_key: &str) -> CommandResult {
        exec::run(
            ctx,
            &self.git_args(rest),
            RunOptions {
                repo_key: Some(repo_key),
                lock_scan_path: Some(&self.path),
                ..RunOptions::default()
            },
        )
    }

    /// Read a config value. `None` when the key is missing or the repository
    /// does not exist yet.
    pub fn get_config(&self, ctx: &Context, key: &str) -> Option<String> {
        let result = self.run_quiet(ctx, &["config", "--get", key]);
        if result.success {
            result.first_line().map(|line| line.trim().to_string())
        } else {
            None
        }
    }

    pub fn set_config(&self, ctx: &Context, key: &str, value: &str, repo_key: &str) -> bool {
        self.run(ctx, &["config", key, value], repo_key).success
    }

    /// `--replace-all`, so repeated writes across crash-recovery cycles never
    /// accumulate duplicate entries.
    pub fn replace_config(&self, ctx: &Context, key: &str, value: &str, repo_key: &str) -> bool {
        self.run(ctx, &["config", "--replace-all", key, value], repo_key)
            .success
    }

    pub fn batch_end_revision(&self, ctx: &Context) -> Option<u64> {
        self.get_config(ctx, &batch_end_revision_key())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn set_batch_end_revision(&self, ctx: &Context, revision: u64, repo_key: &str) -> bool {
        self.replace_config(ctx, &batch_end_revision_key(), &revision.to_string(), repo_key)
    }

    /// Point HEAD at the configured default branch.
    pub fn set_default_branch_head(&self, ctx: &Context, branch: &str, repo_key: &str) -> bool {
        self.run(
            ctx,
            &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")],
            repo_key,
        )
        .success
    }

    pub fn gc(&self, ctx: &Context, repo_key: &str) -> CommandResult {
        self.run(ctx, &["gc"], repo_key)
    }

    /// Remove duplicate lines from `.git/config` in place, preserving the
    /// first occurrence of each. Duplicates show up after crash-recovery
    /// cycles and can break `git svn fetch`.
    pub fn dedup_config_file(&self, ctx: &Context) -> io::Result<(usize, usize)> {
        let path = self.config_file_path();
        let content = fs::read_to_string(&path)?;
        let lines: Vec<String> = content.lines().map(str::to_string).collect();
        let before = lines.len();

        let deduped = dedup_lines(&lines);
        let after = deduped.len();

        if after != before {
            fs::write(&path, format!("{}\n", deduped.join("\n")))?;
        }

        logging::debug(
            ctx,
            &format!("Deduplicated {}: {before} lines before, {after} after", path.display()),
        );

        Ok((before, after))
    }

    /// Project git-svn's remote-only refs into local branches and tags.
    ///
    /// `git svn` writes branches and tags only under `refs/remotes/origin/…`,
    /// which the downstream code host does not display, so after every fetch
    /// the packed-refs file is rewritten per [`rewrite_packed_refs`] and the
    /// default branch symbolic ref is re-asserted.
    pub fn cleanup_branches_and_tags(
        &self,
        ctx: &Context,
        default_branch: &str,
        repo_key: &str,
    ) -> io::Result<()> {
        let path = self.packed_refs_path();

        match fs::read_to_string(&path) {
            Ok(content) => {
                let lines: Vec<String> = content.lines().map(str::to_string).collect();
                let rewritten = rewrite_packed_refs(&lines, default_branch);
                fs::write(&path, format!("{}\n", rewritten.join("\n")))?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // Nothing packed yet; the first gc will create it.
                logging::debug(
                    ctx,
                    &format!("No packed-refs file at {}, skipping ref cleanup", path.display()),
                );
            }
            Err(err) => return Err(err),
        }

        self.set_default_branch_head(ctx, default_branch, repo_key);
        Ok(())
    }
}

/// Trust every path, system-wide, so repositories created under a different
/// uid (volume mounts) can still be operated on.
pub fn configure_safe_directory(ctx: &Context) {
    let args: Vec<String> = [
        "git",
        "config",
        "--system",
        "--replace-all",
        "safe.directory",
        "*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    exec::run(
        ctx,
        &args,
        RunOptions {
            quiet: true,
            name: Some("git_safe_directory"),
            ..RunOptions::default()
        },
    );
}

/// Remove duplicate lines, keeping the first occurrence of each in order.
pub fn dedup_lines(lines: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    lines
        .iter()
        .filter(|line| seen.insert(line.as_str()))
        .cloned()
        .collect()
}

/// Rewrite packed-refs content so remote-only refs become visible locally.
///
/// Parsed `hash path` lines are transformed:
/// - local tags and branches are dropped (recreated from their remote
///   counterparts below),
/// - `refs/remotes/git-svn` is kept and mirrored to the default branch,
/// - `refs/remotes/origin/tags/…` is kept and mirrored to `refs/tags/…`,
/// - other `refs/remotes/origin/…` refs are kept and mirrored to
///   `refs/heads/…`,
/// - mirror refs whose name contains `@` (git-svn junk revisions) are not
///   created.
///
/// The parsed output is sorted by ref path. Lines that don't split into
/// exactly `hash path` (the header comment, peeled `^hash` lines) are
/// preserved verbatim at their original line index.
pub fn rewrite_packed_refs(lines: &[String], default_branch: &str) -> Vec<String> {
    const LOCAL_BRANCH_PREFIX: &str = "refs/heads/";
    const LOCAL_TAG_PREFIX: &str = "refs/tags/";
    const REMOTE_BRANCH_PREFIX: &str = "refs/remotes/origin/";
    const REMOTE_TAG_PREFIX: &str = "refs/remotes/origin/tags/";
    const MIRROR_EXCLUSION: char = '@';

    let mut preserved: Vec<(usize, String)> = Vec::new();
    // (path, hash) so the sort orders by ref path.
    let mut refs: Vec<(String, String)> = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let parts: Vec<&str> = line.split(' ').collect();
        let &[hash, path] = parts.as_slice() else {
            preserved.push((index, line.clone()));
            continue;
        };
        let (hash, path) = (hash.to_string(), path.to_string());

        if path.starts_with(LOCAL_TAG_PREFIX) || path.starts_with(LOCAL_BRANCH_PREFIX) {
            continue;
        }

        if path == "refs/remotes/git-svn" {
            refs.push((format!("{LOCAL_BRANCH_PREFIX}{default_branch}"), hash.clone()));
            refs.push((path, hash));
        } else if path.starts_with(REMOTE_TAG_PREFIX) {
            if !path.contains(MIRROR_EXCLUSION) {
                refs.push((
                    path.replacen(REMOTE_TAG_PREFIX, LOCAL_TAG_PREFIX, 1),
                    hash.clone(),
                ));
            }
            refs.push((path, hash));
        } else if path.starts_with(REMOTE_BRANCH_PREFIX) {
            if !path.contains(MIRROR_EXCLUSION) {
                refs.push((
                    path.replacen(REMOTE_BRANCH_PREFIX, LOCAL_BRANCH_PREFIX, 1),
                    hash.clone(),
                ));
            }
            refs.push((path, hash));
        } else {
            preserved.push((index, line.clone()));
        }
    }

    refs.sort();

    let mut output: Vec<String> = refs
        .into_iter()
        .map(|(path, hash)| format!("{hash} {path}"))
        .collect();

    for (index, line) in preserved {
        let at = index.min(output.len());
        output.insert(at, line);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    const H1: &str = "1111111111111111111111111111111111111111";
    const H2: &str = "2222222222222222222222222222222222222222";
    const H3: &str = "3333333333333333333333333333333333333333";

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let input = lines(&["b", "a", "b", "c", "a"]);
        assert_eq!(dedup_lines(&input), lines(&["b", "a", "c"]));
    }

    #[test]
    fn dedup_is_idempotent() {
        let input = lines(&["x", "y", "x"]);
        let once = dedup_lines(&input);
        assert_eq!(dedup_lines(&once), once);
    }

    #[test]
    fn git_svn_ref_mirrored_to_default_branch() {
        let input = lines(&[&format!("{H1} refs/remotes/git-svn")]);
        let output = rewrite_packed_refs(&input, "trunk");
        assert_eq!(
            output,
            lines(&[
                &format!("{H1} refs/heads/trunk"),
                &format!("{H1} refs/remotes/git-svn"),
            ])
        );
    }

    #[test]
    fn local_branches_and_tags_dropped() {
        let input = lines(&[
            &format!("{H1} refs/heads/trunk"),
            &format!("{H1} refs/heads//trunk"),
            &format!("{H2} refs/tags/v1.0"),
        ]);
        assert!(rewrite_packed_refs(&input, "trunk").is_empty());
    }

    #[test]
    fn remote_tags_mirrored_unless_excluded() {
        let input = lines(&[
            &format!("{H1} refs/remotes/origin/tags/v1.0"),
            &format!("{H2} refs/remotes/origin/tags/v1.0@125"),
        ]);
        let output = rewrite_packed_refs(&input, "trunk");
        assert_eq!(
            output,
            lines(&[
                &format!("{H1} refs/remotes/origin/tags/v1.0"),
                &format!("{H2} refs/remotes/origin/tags/v1.0@125"),
                &format!("{H1} refs/tags/v1.0"),
            ])
        );
    }

    #[test]
    fn remote_branches_mirrored_to_local() {
        let input = lines(&[&format!("{H1} refs/remotes/origin/feature-x")]);
        let output = rewrite_packed_refs(&input, "trunk");
        assert_eq!(
            output,
            lines(&[
                &format!("{H1} refs/heads/feature-x"),
                &format!("{H1} refs/remotes/origin/feature-x"),
            ])
        );
    }

    #[test]
    fn header_preserved_at_original_index() {
        let input = lines(&[
            "# pack-refs with: peeled fully-peeled sorted",
            &format!("{H1} refs/remotes/git-svn"),
        ]);
        let output = rewrite_packed_refs(&input, "trunk");
        assert_eq!(output[0], "# pack-refs with: peeled fully-peeled sorted");
        assert_eq!(output.len(), 3);
    }

    #[test]
    fn output_sorted_by_ref_path() {
        let input = lines(&[
            &format!("{H3} refs/remotes/origin/zeta"),
            &format!("{H1} refs/remotes/origin/alpha"),
            &format!("{H2} refs/remotes/git-svn"),
        ]);
        let output = rewrite_packed_refs(&input, "trunk");
        let paths: Vec<&str> = output
            .iter()
            .map(|l| l.split_once(' ').unwrap().1)
            .collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn rewrite_is_idempotent() {
        let input = lines(&[
            "# pack-refs with: peeled fully-peeled sorted",
            &format!("{H1} refs/remotes/git-svn"),
            &format!("{H2} refs/remotes/origin/feature"),
            &format!("{H3} refs/remotes/origin/tags/v2"),
            &format!("{H3} refs/tags/stale"),
        ]);
        let once = rewrite_packed_refs(&input, "trunk");
        let twice = rewrite_packed_refs(&once, "trunk");
        assert_eq!(once, twice);
    }

    #[test]
    fn peeled_lines_preserved() {
        let input = lines(&[
            &format!("{H1} refs/remotes/origin/tags/v1"),
            &format!("^{H2}"),
        ]);
        let output = rewrite_packed_refs(&input, "trunk");
        assert!(output.contains(&format!("^{H2}")));
    }
}

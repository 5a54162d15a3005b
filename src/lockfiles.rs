//! Stale lock-file recovery.
//!
//! A worker killed mid-fetch leaves lock files behind that make every
//! subsequent `git`/`svn` invocation for that repository fail. The runner
//! calls [`clear_lock_files`] after a failed git/svn command; by that point
//! the concurrency manager's per-repo exclusion and the driver's descendant
//! scan have already established that no live process owns the repository,
//! so deleting the locks is safe. Repeated invocations are idempotent.

use std::fs;
use std::path::{Path, PathBuf};

use crate::context::Context;
use crate::logging::{self, LogExtra};

/// Lock files specific tools are known to leave behind, relative to `.git/`.
const KNOWN_LOCK_FILES: &[(&str, &str)] = &[
    ("git garbage collection", "gc.pid"),
    ("git svn fetch git-svn", "svn/refs/remotes/git-svn/index.lock"),
    ("git svn fetch origin trunk", "svn/refs/remotes/origin/trunk/index.lock"),
    ("svn config", "svn/.metadata.lock"),
];

/// Any file with one of these names, anywhere under `.git/`, is a lock.
const LOCK_FILE_NAMES: &[&str] = &["index.lock"];

/// Bytes of lock-file content to include in the log record.
const CONTENT_PREVIEW_LIMIT: usize = 512;

/// Delete stale lock files under `<repo>/.git`. Returns true if at least one
/// file was removed.
pub fn clear_lock_files(ctx: &Context, local_repo_path: &Path) -> bool {
    let git_dir = local_repo_path.join(".git");
    let mut found: Vec<(PathBuf, &str)> = Vec::new();

    for (command, relative) in KNOWN_LOCK_FILES {
        let path = git_dir.join(relative);
        if path.exists() {
            found.push((path, command));
        }
    }

    for name in LOCK_FILE_NAMES {
        collect_named_files(&git_dir, name, &mut found);
    }

    found.sort();
    found.dedup_by(|a, b| a.0 == b.0);

    let mut deleted = false;
    for (path, command) in found {
        let content = read_prefix(&path);
        logging::log(
            ctx,
            crate::logging::Level::Warning,
            &format!(
                "Process failed due to a lock file in the repo at {}, but no other process \
                 is running {} for this repo; deleting the lock file so it'll try again on \
                 the next run",
                path.display(),
                command,
            ),
            LogExtra {
                data: Some(serde_json::json!({"lock_file_content": content})),
                ..LogExtra::default()
            },
        );

        match fs::remove_file(&path) {
            Ok(()) => deleted = true,
            // Another reaper or the owning process may have removed it in
            // the window between discovery and unlink.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                logging::error(
                    ctx,
                    &format!(
                        "Lock file found at {}, but didn't exist at the time of deletion",
                        path.display()
                    ),
                );
            }
            Err(err) => {
                logging::error(
                    ctx,
                    &format!("Failed to delete lock file at {}: {err}", path.display()),
                );
            }
        }
    }

    deleted
}

fn collect_named_files(root: &Path, name: &str, found: &mut Vec<(PathBuf, &'static str)>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_named_files(&path, name, found);
        } else if path.file_name().is_some_and(|n| n == name) {
            found.push((path, "git svn fetch"));
        }
    }
}

fn read_prefix(path: &Path) -> String {
    match fs::read(path) {
        Ok(bytes) => {
            let end = bytes.len().min(CONTENT_PREVIEW_LIMIT);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        }
        Err(err) => format!("<unreadable: {err}>"),
    }
}

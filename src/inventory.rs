//! Repository inventory loading and normalization.
//!
//! The inventory file is a YAML mapping of origin servers. A `global` (or
//! `globals`) block supplies defaults, optionally with a per-type sub-block;
//! each server block names a `type`, a `url`, and its `repos`: a single
//! string, a list of strings, or a list of single-key mappings carrying
//! per-repo overrides. Options layer in that order: globals, then the
//! globals' type sub-block, then the server, then the repo.
//!
//! Normalization happens exactly once, here: every downstream consumer sees
//! a flat, fully defaulted [`RepoConfig`] and never branches on YAML shapes
//! again. The file is re-read every cycle so the inventory can change while
//! the container runs; file-level problems are fatal, per-server problems
//! skip that server with an error record.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::context::Context;
use crate::logging::{self, LogExtra};

/// Repo types this daemon can convert.
const SUPPORTED_TYPES: &[&str] = &["svn", "subversion"];

/// A value that may be written as a scalar or a list in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrList::One(value) => vec![value.clone()],
            StringOrList::Many(values) => values.clone(),
        }
    }
}

/// The option bag shared by the global, server, and repo layers. Everything
/// is optional; merging resolves the layers and `RepoConfig` applies the
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepoOptions {
    #[serde(rename = "type")]
    pub repo_type: Option<String>,
    #[serde(alias = "repo-url", alias = "repo-parent-url")]
    pub url: Option<String>,
    #[serde(alias = "source-repo-name")]
    pub repo: Option<String>,
    pub svn_repo_code_root: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub code_host_name: Option<String>,
    pub git_org_name: Option<String>,
    pub destination_git_repo_name: Option<String>,
    pub git_default_branch: Option<String>,
    pub bare_clone: Option<bool>,
    pub fetch_batch_size: Option<usize>,
    #[serde(alias = "svn-layout")]
    pub layout: Option<String>,
    pub trunk: Option<String>,
    pub branches: Option<StringOrList>,
    pub tags: Option<StringOrList>,
    pub authors_file_path: Option<String>,
    pub authors_prog_path: Option<String>,
    pub git_ignore_file_path: Option<String>,
}

macro_rules! merge_fields {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field.clone();
            }
        )+
    };
}

impl RepoOptions {
    /// Overlay `other` on top of `self`: any option the higher layer sets
    /// wins.
    fn overlay(&mut self, other: &RepoOptions) {
        merge_fields!(
            self, other,
            repo_type, url, repo, svn_repo_code_root, username, password,
            code_host_name, git_org_name, destination_git_repo_name,
            git_default_branch, bare_clone, fetch_batch_size, layout, trunk,
            branches, tags, authors_file_path, authors_prog_path,
            git_ignore_file_path,
        );
    }
}

/// The `global` / `globals` block: base options plus an optional sub-block
/// per repo type.
#[derive(Debug, Clone, Default, Deserialize)]
struct GlobalBlock {
    #[serde(flatten)]
    options: RepoOptions,
    svn: Option<RepoOptions>,
}

/// One origin server's block.
#[derive(Debug, Clone, Deserialize)]
struct ServerBlock {
    #[serde(flatten)]
    options: RepoOptions,
    repos: Option<ReposValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReposValue {
    One(String),
    Many(Vec<RepoEntry>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RepoEntry {
    Name(String),
    WithOptions(BTreeMap<String, Option<RepoOptions>>),
}

/// One fully normalized repository entry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RepoConfig {
    pub repo_key: String,
    pub repo_type: String,
    pub server_name: String,
    /// URL of the repository on the origin server.
    pub repo_url: String,
    /// URL the svn tooling actually talks to: `repo_url` plus the optional
    /// remote subtree.
    pub code_root_url: String,
    pub local_repo_path: PathBuf,
    pub username: Option<String>,
    pub password: Option<String>,
    pub git_default_branch: String,
    pub bare_clone: bool,
    pub fetch_batch_size: usize,
    pub layout: Option<String>,
    pub trunk: Option<String>,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
    pub authors_file_path: Option<PathBuf>,
    pub authors_prog_path: Option<PathBuf>,
    pub git_ignore_file_path: Option<PathBuf>,
    pub max_retries: u32,
}

pub type Inventory = BTreeMap<String, RepoConfig>;

/// Load the inventory file named by `REPOS_TO_CONVERT`.
///
/// File-level failures are configuration errors the daemon cannot run
/// without, so they log at critical and terminate the process.
pub fn load(ctx: &Context) -> Inventory {
    let path = &ctx.env.repos_to_convert;

    if path.is_dir() {
        logging::critical(
            ctx,
            &format!(
                "File not found at {}, but found a directory, likely created by the Docker \
                 mount. Please stop the container, delete the directory, and create the yaml \
                 file.",
                path.display()
            ),
            LogExtra::default(),
        );
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => logging::critical(
            ctx,
            &format!("File not found at {}: {err}", path.display()),
            LogExtra::default(),
        ),
    };

    let raw: BTreeMap<String, serde_yaml::Value> = match serde_yaml::from_str(&content) {
        Ok(raw) => raw,
        Err(err) => logging::critical(
            ctx,
            &format!(
                "YAML syntax error in {}, please lint it: {err}",
                path.display()
            ),
            LogExtra::default(),
        ),
    };

    let inventory = normalize(ctx, raw);

    logging::log(
        ctx,
        crate::logging::Level::Debug,
        "Repos to convert",
        LogExtra {
            data: Some(serde_json::json!({
                "repos": serde_json::to_value(&inventory).unwrap_or_default(),
            })),
            ..LogExtra::default()
        },
    );

    inventory
}

/// Turn the raw YAML document into the flat, sorted inventory.
pub fn normalize(ctx: &Context, raw: BTreeMap<String, serde_yaml::Value>) -> Inventory {
    let mut globals = GlobalBlock::default();
    let mut servers: Vec<(String, ServerBlock)> = Vec::new();

    for (key, value) in raw {
        if key.eq_ignore_ascii_case("global") || key.eq_ignore_ascii_case("globals") {
            match serde_yaml::from_value(value) {
                Ok(block) => globals = block,
                Err(err) => {
                    logging::error(ctx, &format!("Global config block is invalid: {err}"));
                }
            }
            continue;
        }

        match serde_yaml::from_value::<ServerBlock>(value) {
            Ok(block) => servers.push((key, block)),
            Err(err) => {
                logging::error(ctx, &format!("Server {key} is not a valid mapping, skipping: {err}"));
            }
        }
    }

    let mut inventory = Inventory::new();

    for (server_key, server) in servers {
        normalize_server(ctx, &globals, &server_key, server, &mut inventory);
    }

    inventory
}

fn normalize_server(
    ctx: &Context,
    globals: &GlobalBlock,
    server_key: &str,
    server: ServerBlock,
    inventory: &mut Inventory,
) {
    // Type comes from the server or from globals, and must be supported.
    let repo_type = server
        .options
        .repo_type
        .clone()
        .or_else(|| globals.options.repo_type.clone())
        .map(|t| t.to_ascii_lowercase());

    let repo_type = match repo_type {
        Some(repo_type) if !repo_type.is_empty() => repo_type,
        _ => {
            logging::error(ctx, &format!("Server {server_key} has no type field, skipping"));
            return;
        }
    };

    if !SUPPORTED_TYPES.contains(&repo_type.as_str()) {
        logging::error(
            ctx,
            &format!(
                "Server {server_key} has type: {repo_type}, which is not in the set of \
                 supported repo types: {SUPPORTED_TYPES:?}, skipping"
            ),
        );
        return;
    }

    let repo_entries: Vec<RepoEntry> = match &server.repos {
        Some(ReposValue::One(name)) => vec![RepoEntry::Name(name.clone())],
        Some(ReposValue::Many(entries)) if !entries.is_empty() => entries.clone(),
        _ => {
            logging::error(ctx, &format!("Server {server_key} has no repos, skipping"));
            return;
        }
    };

    for entry in repo_entries {
        // Layered merge, lowest precedence first.
        let mut options = globals.options.clone();
        if let Some(type_options) = &globals.svn {
            options.overlay(type_options);
        }
        options.overlay(&server.options);

        let repo_name = match entry {
            RepoEntry::Name(name) => name,
            RepoEntry::WithOptions(map) => {
                let Some((name, repo_options)) = map.into_iter().next() else {
                    continue;
                };
                if let Some(repo_options) = repo_options {
                    options.overlay(&repo_options);
                }
                name
            }
        };

        // The server's URL defaults to its inventory key.
        let server_url = options
            .url
            .clone()
            .unwrap_or_else(|| server_key.to_string());
        // The repo path on the server defaults to the repo's inventory key.
        let repo_path = options.repo.clone().unwrap_or_else(|| repo_name.clone());

        if let Some(config) = build_repo_config(ctx, &options, &repo_type, &server_url, &repo_path)
        {
            inventory.insert(config.repo_key.clone(), config);
        }
    }
}

fn build_repo_config(
    ctx: &Context,
    options: &RepoOptions,
    repo_type: &str,
    server_url: &str,
    repo_path: &str,
) -> Option<RepoConfig> {
    let repo_url = format!(
        "{}/{}",
        server_url.trim_end_matches('/'),
        repo_path.trim_matches('/')
    );

    let code_root_url = match &options.svn_repo_code_root {
        Some(sub_path) => format!("{}/{}", repo_url.trim_end_matches('/'), sub_path.trim_matches('/')),
        None => repo_url.clone(),
    };

    let server_name = derive_server_name(ctx, &[&repo_url, server_url], options);

    let (host, path) = split_host_and_path(&repo_url)
        .unwrap_or_else(|| (server_name.clone(), repo_path.trim_matches('/').to_string()));
    let repo_key = if path.is_empty() {
        host.clone()
    } else {
        format!("{host}/{path}")
    };

    // <serve-root>/<code-host>/<org>/<repo>. The org defaults to the repo's
    // parent path on the server, so a bare `host/name` repo lands at
    // `<serve-root>/<host>/<name>`.
    let code_host = options
        .code_host_name
        .clone()
        .unwrap_or_else(|| host.clone());
    let (default_org, default_name) = match path.rsplit_once('/') {
        Some((org, name)) => (Some(org.to_string()), name.to_string()),
        None => (None, path.clone()),
    };
    let org = options.git_org_name.clone().or(default_org);
    let name = options
        .destination_git_repo_name
        .clone()
        .unwrap_or(default_name);

    let mut local_repo_path = ctx.env.src_serve_root.join(&code_host);
    if let Some(org) = &org {
        local_repo_path = local_repo_path.join(org);
    }
    local_repo_path = local_repo_path.join(&name);

    if let Some(password) = &options.password {
        ctx.secrets.add(password.clone());
    }

    Some(RepoConfig {
        repo_key,
        repo_type: repo_type.to_string(),
        server_name,
        repo_url,
        code_root_url,
        local_repo_path,
        username: options.username.clone(),
        password: options.password.clone(),
        git_default_branch: options
            .git_default_branch
            .clone()
            .unwrap_or_else(|| "trunk".to_string()),
        bare_clone: options.bare_clone.unwrap_or(true),
        fetch_batch_size: options.fetch_batch_size.unwrap_or(100),
        layout: options.layout.clone(),
        trunk: options.trunk.clone(),
        branches: options.branches.as_ref().map(StringOrList::to_vec).unwrap_or_default(),
        tags: options.tags.as_ref().map(StringOrList::to_vec).unwrap_or_default(),
        authors_file_path: options.authors_file_path.clone().map(PathBuf::from),
        authors_prog_path: options.authors_prog_path.clone().map(PathBuf::from),
        git_ignore_file_path: options.git_ignore_file_path.clone().map(PathBuf::from),
        max_retries: ctx.env.max_retries,
    })
}

/// Origin host for the per-server concurrency cap: the hostname of any URL
/// field, then `code-host-name`, then the literal `unknown`. It does not
/// need to be a resolvable address.
fn derive_server_name(ctx: &Context, url_candidates: &[&str], options: &RepoOptions) -> String {
    for candidate in url_candidates {
        if let Some((host, _)) = split_host_and_path(candidate) {
            return host;
        }
    }

    if let Some(code_host) = &options.code_host_name {
        if !code_host.is_empty() {
            return code_host.clone();
        }
    }

    logging::warning(
        ctx,
        &format!("Could not determine server host for {url_candidates:?}"),
    );
    "unknown".to_string()
}

/// `https://host/a/b` → `(host, "a/b")`. Scheme-less values get a scheme
/// prepended before parsing, so `svn.example.org/proj` works too.
fn split_host_and_path(raw: &str) -> Option<(String, String)> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let parsed = Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.to_string();
    let path = parsed.path().trim_matches('/').to_string();
    Some((host, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvConfig;

    fn test_context() -> Context {
        let mut env = EnvConfig::default();
        env.src_serve_root = PathBuf::from("/srv/root");
        Context::new(env)
    }

    fn parse(yaml: &str) -> BTreeMap<String, serde_yaml::Value> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn single_repo_as_string() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  url: https://svn.example.org
  repos: proj
"#,
            ),
        );

        assert_eq!(inventory.len(), 1);
        let repo = &inventory["svn.example.org/proj"];
        assert_eq!(repo.repo_type, "svn");
        assert_eq!(repo.server_name, "svn.example.org");
        assert_eq!(repo.repo_url, "https://svn.example.org/proj");
        assert_eq!(repo.code_root_url, "https://svn.example.org/proj");
        assert_eq!(
            repo.local_repo_path,
            PathBuf::from("/srv/root/svn.example.org/proj")
        );
        assert_eq!(repo.git_default_branch, "trunk");
        assert!(repo.bare_clone);
        assert_eq!(repo.fetch_batch_size, 100);
    }

    #[test]
    fn repos_list_with_per_repo_overrides() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  url: https://svn.example.org/repos
  repos:
    - plain
    - tuned:
        fetch-batch-size: 25
        git-default-branch: main
"#,
            ),
        );

        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory["svn.example.org/repos/plain"].fetch_batch_size, 100);
        let tuned = &inventory["svn.example.org/repos/tuned"];
        assert_eq!(tuned.fetch_batch_size, 25);
        assert_eq!(tuned.git_default_branch, "main");
    }

    #[test]
    fn globals_layer_under_server_and_repo() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
globals:
  type: svn
  fetch-batch-size: 10
  username: global-user
  svn:
    git-default-branch: develop
svn.example.org:
  url: https://svn.example.org
  username: server-user
  repos:
    - proj:
        fetch-batch-size: 5
"#,
            ),
        );

        let repo = &inventory["svn.example.org/proj"];
        // repo beats server beats globals[type] beats globals
        assert_eq!(repo.fetch_batch_size, 5);
        assert_eq!(repo.username.as_deref(), Some("server-user"));
        assert_eq!(repo.git_default_branch, "develop");
    }

    #[test]
    fn missing_type_skips_server() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  url: https://svn.example.org
  repos: proj
"#,
            ),
        );
        assert!(inventory.is_empty());
    }

    #[test]
    fn unsupported_type_skips_server() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
tfs.example.org:
  type: tfvc
  repos: proj
"#,
            ),
        );
        assert!(inventory.is_empty());
    }

    #[test]
    fn server_without_repos_skipped() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  repos: []
"#,
            ),
        );
        assert!(inventory.is_empty());
    }

    #[test]
    fn url_defaults_to_server_key() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  repos: proj
"#,
            ),
        );
        let repo = &inventory["svn.example.org/proj"];
        assert_eq!(repo.repo_url, "https://svn.example.org/proj");
        assert_eq!(repo.server_name, "svn.example.org");
    }

    #[test]
    fn code_root_subtree_appended() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  url: https://svn.example.org
  svn-repo-code-root: site
  repos: proj
"#,
            ),
        );
        assert_eq!(
            inventory["svn.example.org/proj"].code_root_url,
            "https://svn.example.org/proj/site"
        );
    }

    #[test]
    fn branches_and_tags_normalize_to_lists() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  url: https://svn.example.org
  branches: branches
  tags:
    - tags
    - releases
  repos: proj
"#,
            ),
        );
        let repo = &inventory["svn.example.org/proj"];
        assert_eq!(repo.branches, vec!["branches"]);
        assert_eq!(repo.tags, vec!["tags", "releases"]);
    }

    #[test]
    fn org_layout_composes_local_path() {
        let ctx = test_context();
        let inventory = normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  url: https://svn.example.org/asf
  code-host-name: svn.example.org
  git-org-name: asf
  repos: parquet
"#,
            ),
        );
        let repo = &inventory["svn.example.org/asf/parquet"];
        assert_eq!(
            repo.local_repo_path,
            PathBuf::from("/srv/root/svn.example.org/asf/parquet")
        );
    }

    #[test]
    fn password_registered_as_secret() {
        let ctx = test_context();
        normalize(
            &ctx,
            parse(
                r#"
svn.example.org:
  type: svn
  url: https://svn.example.org
  username: user
  password: hunter2
  repos: proj
"#,
            ),
        );
        assert_eq!(
            ctx.secrets.redact_str("auth with hunter2 done"),
            "auth with REDACTED_SECRET done"
        );
    }

    #[test]
    fn server_name_falls_back_to_code_host_then_unknown() {
        let ctx = test_context();
        // An unparseable URL (no host) forces the fallback chain.
        let inventory = normalize(
            &ctx,
            parse(
                r#"
weird:
  type: svn
  url: "///"
  code-host-name: fallback.example.org
  repos: proj
"#,
            ),
        );
        let repo = inventory.values().next().unwrap();
        assert_eq!(repo.server_name, "fallback.example.org");
    }

    #[test]
    fn normalization_is_deterministic() {
        let yaml = r#"
globals:
  type: svn
b.example.org:
  url: https://b.example.org
  repos: [beta, alpha]
a.example.org:
  url: https://a.example.org
  repos: zed
"#;
        let ctx = test_context();
        let first = normalize(&ctx, parse(yaml));
        let second = normalize(&ctx, parse(yaml));
        assert_eq!(first, second);

        let keys: Vec<&String> = first.keys().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}

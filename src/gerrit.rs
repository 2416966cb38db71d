use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    process::{Command, Stdio},
};
use tracing::{debug, trace, warn};

use crate::git::GitBackend;
use crate::upstream::Upstreams;

/// Remote name used when one is literally called this.
const CONVENTIONAL_REMOTE: &str = "gerrit";

/// Where and what to query: an ssh destination plus the project scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// `[user@]host`, passed to ssh verbatim.
    pub host: String,
    pub port: Option<u16>,
    pub project: String,
}

/// Review state of one change record as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewStatus {
    Merged,
    Abandoned,
    /// `NEW`, `DRAFT`, and anything else that is not terminal.
    #[serde(other)]
    Active,
}

impl ReviewStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, ReviewStatus::Merged | ReviewStatus::Abandoned)
    }
}

/// Maps built from one status query.
#[derive(Debug, Default, Clone)]
pub struct QueryResult {
    /// server key (change number) → ChangeId
    pub key_to_id: HashMap<String, String>,
    /// ChangeId → every server key seen for it (one per branch)
    pub id_to_keys: HashMap<String, BTreeSet<String>>,
    /// ChangeId → active on at least one branch
    pub active: HashMap<String, bool>,
}

impl QueryResult {
    /// `true` only if the server reported the change and it is active
    /// somewhere. Absent changes count as inactive.
    pub fn is_active(&self, change_id: &str) -> bool {
        self.active.get(change_id).copied().unwrap_or(false)
    }

    pub fn change_id_for(&self, key: &str) -> Option<&str> {
        self.key_to_id.get(key).map(String::as_str)
    }

    pub fn keys_for<'a>(&'a self, change_id: &str) -> impl Iterator<Item = &'a String> + use<'a> {
        self.id_to_keys.get(change_id).into_iter().flatten()
    }
}

/// Abstraction over the review server's query endpoint.
///
/// The production implementation runs `gerrit query` over ssh; tests use
/// [`mock::MockReviewServer`].
pub trait ReviewServer: Send + Sync {
    /// Run `query` against `target` and return the raw newline-delimited JSON.
    fn query(&self, target: &RemoteTarget, query: &str) -> Result<String>;
}

impl<T: ReviewServer> ReviewServer for std::sync::Arc<T> {
    fn query(&self, target: &RemoteTarget, query: &str) -> Result<String> {
        self.as_ref().query(target, query)
    }
}

// ─── Production implementation ───────────────────────────────────────────────

/// Runs `gerrit query` on the server through an ssh client.
pub struct SshReviewServer {
    /// Program plus leading arguments, e.g. `ssh -o BatchMode=yes`.
    pub ssh_command: String,
}

impl ReviewServer for SshReviewServer {
    fn query(&self, target: &RemoteTarget, query: &str) -> Result<String> {
        let mut words = self.ssh_command.split_whitespace();
        let program = words.next().context("ssh_command is empty")?;

        let mut cmd = Command::new(program);
        cmd.args(words);
        if let Some(port) = target.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(&target.host)
            .args(["gerrit", "query", "--format=JSON", "--no-limit"])
            .arg(shell_quote(query));

        debug!("{} {} gerrit query {}", program, target.host, query);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning {program}"))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "review query on {} failed (exit {}): {}",
                target.host,
                code,
                stderr.trim()
            );
        }
        String::from_utf8(output.stdout).context("review query output is not UTF-8")
    }
}

/// Quote `s` for the remote side's command-line splitter.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ─── Remote resolution ───────────────────────────────────────────────────────

/// Pick the remote that hosts the review server.
///
/// Precedence: `review.remote` config, a remote named `gerrit`, the single
/// remote local branches track, then `default_remote` with a notice.
pub fn resolve_review_remote(
    git: &dyn GitBackend,
    upstreams: &Upstreams,
    default_remote: &str,
) -> Result<String> {
    if let Some(remote) = git.config_get("review.remote")? {
        return Ok(remote);
    }
    if git
        .config_get(&format!("remote.{CONVENTIONAL_REMOTE}.url"))?
        .is_some()
    {
        return Ok(CONVENTIONAL_REMOTE.to_string());
    }
    if upstreams.remotes.len() == 1
        && let Some(only) = upstreams.remotes.first()
    {
        return Ok(only.clone());
    }

    if upstreams.remotes.is_empty() {
        warn!("Could not determine the review remote; using `{default_remote}`");
    } else {
        warn!(
            "Branches track several remotes ({}); using `{}`. Set `review.remote` to choose.",
            upstreams
                .remotes
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            default_remote
        );
    }
    Ok(default_remote.to_string())
}

/// Split a remote URL into `(host, port, path)` if it is reachable over ssh.
///
/// Accepts `ssh://[user@]host[:port]/path` and scp-like `[user@]host:path`.
pub fn parse_ssh_url(url: &str) -> Option<(String, Option<u16>, String)> {
    if let Some(rest) = url.strip_prefix("ssh://") {
        let (authority, path) = rest.split_once('/')?;
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, Some(p.parse().ok()?)),
            None => (authority, None),
        };
        if host.is_empty() {
            return None;
        }
        return Some((host.to_string(), port, path.to_string()));
    }
    if url.contains("://") {
        return None;
    }
    let (host, path) = url.split_once(':')?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some((host.to_string(), None, path.to_string()))
}

fn project_from_path(path: &str) -> String {
    let path = path.trim_start_matches('/').trim_end_matches('/');
    path.strip_suffix(".git").unwrap_or(path).to_string()
}

/// Resolve the ssh destination and project for the review remote.
///
/// `review.host`, `review.port` and `review.project` override what the
/// remote's URL says.
pub fn resolve_target(
    git: &dyn GitBackend,
    upstreams: &Upstreams,
    default_remote: &str,
) -> Result<RemoteTarget> {
    let remote = resolve_review_remote(git, upstreams, default_remote)?;
    let url = git.config_get(&format!("remote.{remote}.url"))?;
    let parsed = url.as_deref().and_then(parse_ssh_url);

    let host = match (git.config_get("review.host")?, &parsed) {
        (Some(h), _) => h,
        (None, Some((h, _, _))) => h.clone(),
        (None, None) => anyhow::bail!(
            "remote `{}` ({}) is not an ssh URL; set `review.host` to the review server's ssh address",
            remote,
            url.as_deref().unwrap_or("no url configured")
        ),
    };
    let port = match git.config_get("review.port")? {
        Some(p) => Some(
            p.parse::<u16>()
                .with_context(|| format!("review.port is not a port number: {p}"))?,
        ),
        None => parsed.as_ref().and_then(|(_, port, _)| *port),
    };
    let project = match (git.config_get("review.project")?, &parsed) {
        (Some(p), _) => p,
        (None, Some((_, _, path))) => project_from_path(path),
        (None, None) => anyhow::bail!("cannot determine the review project; set `review.project`"),
    };
    if project.is_empty() {
        anyhow::bail!("remote `{remote}` has an empty project path; set `review.project`");
    }

    debug!("Review remote `{remote}` → {host} ({project})");
    Ok(RemoteTarget {
        host,
        port,
        project,
    })
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// Build a single query covering every term, scoped to `project`.
pub fn build_query(project: &str, terms: &BTreeSet<String>) -> String {
    let ors: Vec<String> = terms.iter().map(|t| format!("change:{t}")).collect();
    format!("project:{} ({})", project, ors.join(" OR "))
}

/// One line of `gerrit query --format=JSON` output.
#[derive(Debug, Deserialize)]
struct QueryLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    number: Option<serde_json::Value>,
    id: Option<String>,
    branch: Option<String>,
    status: Option<ReviewStatus>,
    #[serde(rename = "moreChanges")]
    more_changes: Option<bool>,
    message: Option<String>,
}

fn key_of(number: &serde_json::Value) -> Option<String> {
    match number {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Parse newline-delimited query output into lookup maps.
///
/// Records without a `number` or `id` are skipped. A record without `branch`
/// or `status`, an `error` line, invalid JSON, truncated results, or a
/// missing stats trailer abort the run: none of them can be told apart from
/// "change not found", and absence leads to pruning.
pub fn parse_query_output(text: &str) -> Result<QueryResult> {
    let mut result = QueryResult::default();
    let mut saw_stats = false;

    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: QueryLine = serde_json::from_str(line)
            .with_context(|| format!("malformed review query output on line {}", lineno + 1))?;

        match rec.kind.as_deref() {
            Some("stats") => {
                if rec.more_changes == Some(true) {
                    anyhow::bail!("review query results were truncated by the server");
                }
                saw_stats = true;
                continue;
            }
            Some("error") => anyhow::bail!(
                "review query failed: {}",
                rec.message.as_deref().unwrap_or("unknown error")
            ),
            _ => {}
        }

        let (Some(key), Some(change_id)) = (rec.number.as_ref().and_then(key_of), rec.id) else {
            debug!("Skipping query record without number/id on line {}", lineno + 1);
            continue;
        };
        let Some(branch) = rec.branch else {
            anyhow::bail!("review query record for change {key} has no branch");
        };
        let Some(status) = rec.status else {
            anyhow::bail!("review query record for change {key} has no status");
        };

        trace!("change {key} ({change_id}) on {branch}: {status:?}");
        *result.active.entry(change_id.clone()).or_insert(false) |= status.is_active();
        result
            .id_to_keys
            .entry(change_id.clone())
            .or_default()
            .insert(key.clone());
        result.key_to_id.insert(key, change_id);
    }

    if !saw_stats {
        anyhow::bail!("review query output ended without a stats line");
    }
    Ok(result)
}

/// Ask the server about every term in one batched query.
///
/// Returns an empty result without contacting the server when there is
/// nothing to ask.
pub fn query_status(
    server: &dyn ReviewServer,
    target: &RemoteTarget,
    terms: &BTreeSet<String>,
) -> Result<QueryResult> {
    if terms.is_empty() {
        return Ok(QueryResult::default());
    }
    let query = build_query(&target.project, terms);
    let raw = server.query(target, &query)?;
    let result = parse_query_output(&raw)?;
    debug!(
        "Server knows {} of {} queried change(s)",
        result.key_to_id.len(),
        terms.len()
    );
    Ok(result)
}

// ─── Mock implementation (for testing) ───────────────────────────────────────

pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Answers queries from an in-memory change list; never touches the network.
    #[derive(Debug, Default)]
    pub struct MockReviewServer {
        /// Raw JSON records; emitted when their `number` or `id` is queried.
        pub records: Mutex<Vec<serde_json::Value>>,
        /// When set, returned verbatim instead of generated output.
        pub raw_output: Mutex<Option<String>>,
        pub queries: Mutex<Vec<String>>,
    }

    impl MockReviewServer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_change(&self, number: u64, change_id: &str, branch: &str, status: &str) {
            self.records.lock().unwrap().push(serde_json::json!({
                "project": "demo",
                "branch": branch,
                "id": change_id,
                "number": number,
                "status": status,
            }));
        }

        pub fn add_record(&self, record: serde_json::Value) {
            self.records.lock().unwrap().push(record);
        }

        pub fn set_raw_output(&self, raw: &str) {
            *self.raw_output.lock().unwrap() = Some(raw.to_string());
        }

        pub fn query_count(&self) -> usize {
            self.queries.lock().unwrap().len()
        }
    }

    fn queried_terms(query: &str) -> Vec<String> {
        query
            .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .filter_map(|tok| tok.strip_prefix("change:"))
            .map(str::to_string)
            .collect()
    }

    impl ReviewServer for MockReviewServer {
        fn query(&self, _target: &RemoteTarget, query: &str) -> Result<String> {
            self.queries.lock().unwrap().push(query.to_string());
            if let Some(raw) = self.raw_output.lock().unwrap().clone() {
                return Ok(raw);
            }

            let terms = queried_terms(query);
            let field = |rec: &serde_json::Value, name: &str| {
                rec.get(name).and_then(key_of).unwrap_or_default()
            };
            let mut out = String::new();
            let mut rows = 0;
            for rec in self.records.lock().unwrap().iter() {
                if terms.contains(&field(rec, "number")) || terms.contains(&field(rec, "id")) {
                    out.push_str(&rec.to_string());
                    out.push('\n');
                    rows += 1;
                }
            }
            out.push_str(
                &serde_json::json!({"type": "stats", "rowCount": rows, "moreChanges": false})
                    .to_string(),
            );
            out.push('\n');
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::mock::MockGit;

    const STATS: &str = r#"{"type":"stats","rowCount":1,"runTimeMilliseconds":3,"moreChanges":false}"#;

    fn terms(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_basic_records() {
        let out = format!(
            "{}\n{}\n{}\n",
            r#"{"number":101,"id":"Iaaa","branch":"main","status":"NEW"}"#,
            r#"{"number":"102","id":"Ibbb","branch":"main","status":"MERGED"}"#,
            STATS
        );
        let res = parse_query_output(&out).unwrap();
        assert_eq!(res.change_id_for("101"), Some("Iaaa"));
        assert_eq!(res.change_id_for("102"), Some("Ibbb"));
        assert!(res.is_active("Iaaa"));
        assert!(!res.is_active("Ibbb"));
    }

    #[test]
    fn test_parse_activity_is_or_across_branches() {
        let out = format!(
            "{}\n{}\n{}\n",
            r#"{"number":1,"id":"Ix","branch":"main","status":"MERGED"}"#,
            r#"{"number":2,"id":"Ix","branch":"stable","status":"NEW"}"#,
            STATS
        );
        let res = parse_query_output(&out).unwrap();
        assert!(res.is_active("Ix"));
        let keys: Vec<&String> = res.keys_for("Ix").collect();
        assert_eq!(keys, vec!["1", "2"]);
    }

    #[test]
    fn test_parse_abandoned_is_inactive() {
        let out = format!(
            "{}\n{}\n",
            r#"{"number":1,"id":"Ix","branch":"main","status":"ABANDONED"}"#,
            STATS
        );
        assert!(!parse_query_output(&out).unwrap().is_active("Ix"));
    }

    #[test]
    fn test_parse_skips_records_without_number_or_id() {
        let out = format!(
            "{}\n{}\n{}\n",
            r#"{"id":"Inonum","branch":"main","status":"NEW"}"#,
            r#"{"number":5,"branch":"main","status":"NEW"}"#,
            STATS
        );
        let res = parse_query_output(&out).unwrap();
        assert!(res.key_to_id.is_empty());
        assert!(res.active.is_empty());
    }

    #[test]
    fn test_parse_missing_status_is_fatal() {
        let out = format!(
            "{}\n{}\n",
            r#"{"number":1,"id":"Ix","branch":"main"}"#,
            STATS
        );
        let err = parse_query_output(&out).unwrap_err();
        assert!(err.to_string().contains("no status"));
    }

    #[test]
    fn test_parse_missing_branch_is_fatal() {
        let out = format!("{}\n{}\n", r#"{"number":1,"id":"Ix","status":"NEW"}"#, STATS);
        assert!(parse_query_output(&out).is_err());
    }

    #[test]
    fn test_parse_malformed_json_is_fatal() {
        assert!(parse_query_output("{not json\n").is_err());
    }

    #[test]
    fn test_parse_error_line_is_fatal() {
        let err = parse_query_output(r#"{"type":"error","message":"permission denied"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_parse_truncated_results_are_fatal() {
        let out = r#"{"type":"stats","rowCount":500,"moreChanges":true}"#;
        assert!(parse_query_output(out).is_err());
    }

    #[test]
    fn test_parse_requires_stats_line() {
        let out = r#"{"number":1,"id":"Ix","branch":"main","status":"NEW"}"#;
        assert!(parse_query_output(out).is_err());
        assert!(parse_query_output("").is_err());
    }

    #[test]
    fn test_parse_empty_result_is_ok() {
        let res = parse_query_output(&format!("{STATS}\n")).unwrap();
        assert!(res.key_to_id.is_empty());
        assert!(!res.is_active("Ianything"));
    }

    #[test]
    fn test_unknown_status_counts_as_active() {
        let out = format!(
            "{}\n{}\n",
            r#"{"number":1,"id":"Ix","branch":"main","status":"DRAFT"}"#,
            STATS
        );
        assert!(parse_query_output(&out).unwrap().is_active("Ix"));
    }

    #[test]
    fn test_build_query() {
        let q = build_query("tools/gc", &terms(&["Iabc", "42"]));
        assert_eq!(q, "project:tools/gc (change:42 OR change:Iabc)");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("a (b)"), "'a (b)'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_parse_ssh_urls() {
        assert_eq!(
            parse_ssh_url("ssh://alice@review.example.com:29418/tools/gc.git"),
            Some((
                "alice@review.example.com".to_string(),
                Some(29418),
                "tools/gc.git".to_string()
            ))
        );
        assert_eq!(
            parse_ssh_url("ssh://review.example.com/p"),
            Some(("review.example.com".to_string(), None, "p".to_string()))
        );
        assert_eq!(
            parse_ssh_url("git@review.example.com:tools/gc"),
            Some(("git@review.example.com".to_string(), None, "tools/gc".to_string()))
        );
        assert_eq!(parse_ssh_url("https://review.example.com/tools/gc"), None);
        assert_eq!(parse_ssh_url("/srv/git/repo.git"), None);
        assert_eq!(parse_ssh_url("ssh://host:notaport/p"), None);
    }

    #[test]
    fn test_project_from_path() {
        assert_eq!(project_from_path("/tools/gc.git"), "tools/gc");
        assert_eq!(project_from_path("tools/gc/"), "tools/gc");
    }

    #[test]
    fn test_remote_from_config_wins() {
        let git = MockGit::new("/r/.git");
        git.set_config("review.remote", "upstream");
        git.set_config("remote.gerrit.url", "ssh://h/p");
        let up = Upstreams::default();
        assert_eq!(resolve_review_remote(&git, &up, "origin").unwrap(), "upstream");
    }

    #[test]
    fn test_remote_conventional_name() {
        let git = MockGit::new("/r/.git");
        git.set_config("remote.gerrit.url", "ssh://h/p");
        let up = Upstreams::default();
        assert_eq!(resolve_review_remote(&git, &up, "origin").unwrap(), "gerrit");
    }

    #[test]
    fn test_remote_single_upstream() {
        let git = MockGit::new("/r/.git");
        let up = Upstreams {
            remotes: BTreeSet::from(["review".to_string()]),
            ..Upstreams::default()
        };
        assert_eq!(resolve_review_remote(&git, &up, "origin").unwrap(), "review");
    }

    #[test]
    fn test_remote_ambiguous_falls_back_to_default() {
        let git = MockGit::new("/r/.git");
        let up = Upstreams {
            remotes: BTreeSet::from(["a".to_string(), "b".to_string()]),
            ..Upstreams::default()
        };
        assert_eq!(resolve_review_remote(&git, &up, "origin").unwrap(), "origin");
    }

    #[test]
    fn test_resolve_target_from_url() {
        let git = MockGit::new("/r/.git");
        git.set_config("remote.origin.url", "ssh://me@host:29418/team/app.git");
        let target = resolve_target(&git, &Upstreams::default(), "origin").unwrap();
        assert_eq!(
            target,
            RemoteTarget {
                host: "me@host".to_string(),
                port: Some(29418),
                project: "team/app".to_string(),
            }
        );
    }

    #[test]
    fn test_resolve_target_overrides() {
        let git = MockGit::new("/r/.git");
        git.set_config("remote.origin.url", "https://host/team/app");
        git.set_config("review.host", "review-ssh");
        git.set_config("review.port", "2222");
        git.set_config("review.project", "team/app");
        let target = resolve_target(&git, &Upstreams::default(), "origin").unwrap();
        assert_eq!(target.host, "review-ssh");
        assert_eq!(target.port, Some(2222));
        assert_eq!(target.project, "team/app");
    }

    #[test]
    fn test_resolve_target_http_without_override_fails() {
        let git = MockGit::new("/r/.git");
        git.set_config("remote.origin.url", "https://host/team/app");
        assert!(resolve_target(&git, &Upstreams::default(), "origin").is_err());
    }

    #[test]
    fn test_query_status_skips_server_when_nothing_to_ask() {
        let server = mock::MockReviewServer::new();
        let target = RemoteTarget {
            host: "h".to_string(),
            port: None,
            project: "p".to_string(),
        };
        let res = query_status(&server, &target, &BTreeSet::new()).unwrap();
        assert!(res.key_to_id.is_empty());
        assert_eq!(server.query_count(), 0);
    }

    #[test]
    fn test_query_status_through_mock() {
        let server = mock::MockReviewServer::new();
        server.add_change(7, "Iseven", "main", "NEW");
        server.add_change(8, "Ieight", "main", "MERGED");
        let target = RemoteTarget {
            host: "h".to_string(),
            port: None,
            project: "p".to_string(),
        };
        let res = query_status(&server, &target, &terms(&["7", "Ieight"])).unwrap();
        assert!(res.is_active("Iseven"));
        assert!(!res.is_active("Ieight"));
        assert_eq!(server.query_count(), 1);
    }
}

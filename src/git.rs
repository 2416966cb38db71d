use anyhow::{Context, Result};
use std::{
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, trace};

use crate::error::{is_config_key_missing, is_unresolved_revision};

/// One `(content-hash, fully-qualified-ref-name)` pair from ref enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    pub hash: String,
    pub name: String,
}

/// A commit as read back from the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub hash: String,
    /// `None` for a root commit, which marks the bottom of a tracked series.
    pub first_parent: Option<String>,
    pub message: String,
}

/// Abstraction over the repository operations the GC needs.
///
/// The production implementation shells out to `git`; tests use
/// [`mock::MockGit`] to run the whole pipeline in memory.
pub trait GitBackend: Send + Sync {
    /// Absolute path of the repository's git directory.
    fn git_dir(&self) -> Result<PathBuf>;

    /// Hash of the commit currently checked out, or `None` on an unborn branch.
    fn head(&self) -> Result<Option<String>>;

    /// Enumerate every ref under any of `prefixes` in a single pass.
    fn list_refs(&self, prefixes: &[&str]) -> Result<Vec<RefRecord>>;

    /// Look up a git config key. Returns `None` when the key is not set.
    fn config_get(&self, key: &str) -> Result<Option<String>>;

    /// Walk history from `starts`, stopping at anything reachable from
    /// `excludes`, and return `(hash, full message)` for every commit seen.
    fn walk_messages(&self, starts: &[String], excludes: &[String])
    -> Result<Vec<(String, String)>>;

    /// Read the given commits without walking their ancestry.
    fn read_commits(&self, hashes: &[String]) -> Result<Vec<CommitInfo>>;

    /// Delete `refs` as one atomic batch. When `apply` is `false` nothing is
    /// written.
    fn delete_refs(&self, refs: &[String], apply: bool) -> Result<()>;
}

/// Blanket impl so tests can share a mock through an `Arc` while still
/// handing a `Box<dyn GitBackend>` to `AppContext`.
impl<T: GitBackend> GitBackend for std::sync::Arc<T> {
    fn git_dir(&self) -> Result<PathBuf> {
        self.as_ref().git_dir()
    }
    fn head(&self) -> Result<Option<String>> {
        self.as_ref().head()
    }
    fn list_refs(&self, prefixes: &[&str]) -> Result<Vec<RefRecord>> {
        self.as_ref().list_refs(prefixes)
    }
    fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.as_ref().config_get(key)
    }
    fn walk_messages(
        &self,
        starts: &[String],
        excludes: &[String],
    ) -> Result<Vec<(String, String)>> {
        self.as_ref().walk_messages(starts, excludes)
    }
    fn read_commits(&self, hashes: &[String]) -> Result<Vec<CommitInfo>> {
        self.as_ref().read_commits(hashes)
    }
    fn delete_refs(&self, refs: &[String], apply: bool) -> Result<()> {
        self.as_ref().delete_refs(refs, apply)
    }
}

// ─── Production implementation ───────────────────────────────────────────────

/// Runs the real `git` binary inside `workdir`.
pub struct GitCli {
    pub workdir: PathBuf,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        GitCli {
            workdir: workdir.into(),
        }
    }
}

impl GitBackend for GitCli {
    fn git_dir(&self) -> Result<PathBuf> {
        let out = run_git(&self.workdir, &["rev-parse", "--absolute-git-dir"], None)?;
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(PathBuf::from(text.trim_end()))
    }

    fn head(&self) -> Result<Option<String>> {
        let out = spawn_git(
            &self.workdir,
            &["rev-parse", "--verify", "--quiet", "HEAD^{commit}"],
            None,
        )?;
        if out.status.success() {
            let text = String::from_utf8_lossy(&out.stdout);
            return Ok(Some(text.trim().to_string()));
        }
        match out.status.code() {
            Some(code) if is_unresolved_revision(code) => Ok(None),
            _ => Err(git_failure("rev-parse HEAD", &out)),
        }
    }

    fn list_refs(&self, prefixes: &[&str]) -> Result<Vec<RefRecord>> {
        let mut args = vec!["for-each-ref", "--format=%(objectname)%00%(refname)"];
        args.extend_from_slice(prefixes);
        let out = run_git(&self.workdir, &args, None)?;
        parse_ref_listing(&String::from_utf8_lossy(&out.stdout))
    }

    fn config_get(&self, key: &str) -> Result<Option<String>> {
        let out = spawn_git(&self.workdir, &["config", "--get", key], None)?;
        if out.status.success() {
            let text = String::from_utf8_lossy(&out.stdout);
            return Ok(Some(text.trim_end_matches('\n').to_string()));
        }
        match out.status.code() {
            Some(code) if is_config_key_missing(code) => Ok(None),
            _ => Err(git_failure(&format!("config --get {key}"), &out)),
        }
    }

    fn walk_messages(
        &self,
        starts: &[String],
        excludes: &[String],
    ) -> Result<Vec<(String, String)>> {
        if starts.is_empty() {
            return Ok(Vec::new());
        }
        let mut input = String::new();
        for s in starts {
            input.push_str(s);
            input.push('\n');
        }
        for e in excludes {
            input.push('^');
            input.push_str(e);
            input.push('\n');
        }
        let out = run_git(
            &self.workdir,
            &["log", "--stdin", "-z", "--format=%H%x00%B"],
            Some(input.as_bytes()),
        )?;
        let fields = split_nul_fields(&out.stdout);
        if fields.len() % 2 != 0 {
            anyhow::bail!("git log produced a truncated record stream");
        }
        Ok(fields
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }

    fn read_commits(&self, hashes: &[String]) -> Result<Vec<CommitInfo>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let input: String = hashes.iter().map(|h| format!("{h}\n")).collect();
        let out = run_git(
            &self.workdir,
            &[
                "log",
                "--no-walk=unsorted",
                "--stdin",
                "-z",
                "--format=%H%x00%P%x00%B",
            ],
            Some(input.as_bytes()),
        )?;
        parse_commit_records(&out.stdout)
    }

    fn delete_refs(&self, refs: &[String], apply: bool) -> Result<()> {
        if refs.is_empty() || !apply {
            return Ok(());
        }
        let input: String = refs.iter().map(|r| format!("delete {r}\n")).collect();
        run_git(&self.workdir, &["update-ref", "--stdin"], Some(input.as_bytes()))?;
        Ok(())
    }
}

/// Run `git <args>` and fail unless it exits successfully.
fn run_git(workdir: &Path, args: &[&str], input: Option<&[u8]>) -> Result<std::process::Output> {
    let out = spawn_git(workdir, args, input)?;
    if !out.status.success() {
        return Err(git_failure(&args.join(" "), &out));
    }
    Ok(out)
}

/// Spawn `git <args>`, optionally feeding `input` on stdin, and collect all
/// output.
///
/// Input is written from a scoped thread while the main thread drains stdout
/// and stderr, so a large input can't deadlock against a full output pipe.
/// Both pipes are fully read and closed before this returns, on every path.
fn spawn_git(workdir: &Path, args: &[&str], input: Option<&[u8]>) -> Result<std::process::Output> {
    debug!("git {}", args.join(" "));

    let mut child = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning git {}", args.first().unwrap_or(&"")))?;

    let stdin = child.stdin.take();
    let (write_res, output) = std::thread::scope(|s| {
        let writer = s.spawn(move || -> std::io::Result<()> {
            if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
                pipe.write_all(bytes)?;
            }
            // pipe dropped here: closes stdin so git sees EOF
            Ok(())
        });
        let output = child.wait_with_output();
        let write_res = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
        (write_res, output)
    });

    let output = output.with_context(|| format!("waiting for git {}", args.join(" ")))?;
    if let Err(e) = write_res
        && output.status.success()
    {
        return Err(e).with_context(|| format!("writing input to git {}", args.join(" ")));
    }
    trace!("git exited with {}", output.status);
    Ok(output)
}

fn git_failure(what: &str, out: &std::process::Output) -> anyhow::Error {
    let code = out.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&out.stderr);
    anyhow::anyhow!("git {} failed (exit {}): {}", what, code, stderr.trim())
}

/// Parse `for-each-ref --format=%(objectname)%00%(refname)` output.
pub(crate) fn parse_ref_listing(text: &str) -> Result<Vec<RefRecord>> {
    let mut records = Vec::new();
    // Ref names can't contain a newline, so one line is one record.
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((hash, name)) = line.split_once('\0') else {
            anyhow::bail!("malformed for-each-ref line: {line:?}");
        };
        records.push(RefRecord {
            hash: hash.to_string(),
            name: name.to_string(),
        });
    }
    Ok(records)
}

/// Split a NUL-delimited stream into fields, dropping the final terminator.
fn split_nul_fields(bytes: &[u8]) -> Vec<String> {
    let bytes = bytes.strip_suffix(b"\0").unwrap_or(bytes);
    if bytes.is_empty() {
        return Vec::new();
    }
    bytes
        .split(|b| *b == 0)
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .collect()
}

/// Parse `git log -z --format=%H%x00%P%x00%B` output into commits.
pub(crate) fn parse_commit_records(bytes: &[u8]) -> Result<Vec<CommitInfo>> {
    let fields = split_nul_fields(bytes);
    if fields.len() % 3 != 0 {
        anyhow::bail!("git log produced a truncated commit stream");
    }
    Ok(fields
        .chunks(3)
        .map(|c| CommitInfo {
            // `-z` leaves no newline between records, but be lenient anyway
            hash: c[0].trim().to_string(),
            first_parent: c[1].split_whitespace().next().map(str::to_string),
            message: c[2].clone(),
        })
        .collect())
}

// ─── Mock implementation (for testing) ───────────────────────────────────────

pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    /// An in-memory repository: refs, config, and a commit graph.
    ///
    /// `delete_refs` with `apply = true` really removes refs, so consecutive
    /// GC runs see each other's effects.
    #[derive(Debug, Default)]
    pub struct MockGit {
        pub git_dir: PathBuf,
        pub head: Mutex<Option<String>>,
        pub refs: Mutex<BTreeMap<String, String>>,
        pub config: Mutex<HashMap<String, String>>,
        /// hash → (parents, message)
        pub commits: Mutex<HashMap<String, (Vec<String>, String)>>,
        /// Every batch passed to `delete_refs`, with its `apply` flag.
        pub delete_calls: Mutex<Vec<(Vec<String>, bool)>>,
    }

    impl MockGit {
        pub fn new(git_dir: impl Into<PathBuf>) -> Self {
            MockGit {
                git_dir: git_dir.into(),
                ..Self::default()
            }
        }

        pub fn add_commit(&self, hash: &str, parents: &[&str], message: &str) {
            self.commits.lock().unwrap().insert(
                hash.to_string(),
                (
                    parents.iter().map(|p| p.to_string()).collect(),
                    message.to_string(),
                ),
            );
        }

        pub fn set_ref(&self, name: &str, hash: &str) {
            self.refs
                .lock()
                .unwrap()
                .insert(name.to_string(), hash.to_string());
        }

        pub fn set_head(&self, hash: &str) {
            *self.head.lock().unwrap() = Some(hash.to_string());
        }

        pub fn set_config(&self, key: &str, value: &str) {
            self.config
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
        }

        /// Snapshot of all ref names currently present.
        pub fn ref_names(&self) -> Vec<String> {
            self.refs.lock().unwrap().keys().cloned().collect()
        }

        /// Snapshot of refs that were actually deleted (applied batches only).
        pub fn applied_deletions(&self) -> Vec<String> {
            self.delete_calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, apply)| *apply)
                .flat_map(|(refs, _)| refs.clone())
                .collect()
        }

        fn resolve(&self, rev: &str) -> Option<String> {
            if let Some(h) = self.refs.lock().unwrap().get(rev) {
                return Some(h.clone());
            }
            self.commits
                .lock()
                .unwrap()
                .contains_key(rev)
                .then(|| rev.to_string())
        }

        fn reachable(&self, starts: &[String]) -> HashSet<String> {
            let commits = self.commits.lock().unwrap();
            let mut seen = HashSet::new();
            let mut queue: VecDeque<String> = starts.iter().cloned().collect();
            while let Some(h) = queue.pop_front() {
                if !seen.insert(h.clone()) {
                    continue;
                }
                if let Some((parents, _)) = commits.get(&h) {
                    queue.extend(parents.iter().cloned());
                }
            }
            seen
        }
    }

    impl GitBackend for MockGit {
        fn git_dir(&self) -> Result<PathBuf> {
            Ok(self.git_dir.clone())
        }

        fn head(&self) -> Result<Option<String>> {
            Ok(self.head.lock().unwrap().clone())
        }

        fn list_refs(&self, prefixes: &[&str]) -> Result<Vec<RefRecord>> {
            Ok(self
                .refs
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| prefixes.iter().any(|p| name.starts_with(p)))
                .map(|(name, hash)| RefRecord {
                    hash: hash.clone(),
                    name: name.clone(),
                })
                .collect())
        }

        fn config_get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.config.lock().unwrap().get(key).cloned())
        }

        fn walk_messages(
            &self,
            starts: &[String],
            excludes: &[String],
        ) -> Result<Vec<(String, String)>> {
            let resolve_all = |revs: &[String]| -> Result<Vec<String>> {
                revs.iter()
                    .map(|r| {
                        self.resolve(r)
                            .ok_or_else(|| anyhow::anyhow!("bad revision '{r}'"))
                    })
                    .collect()
            };
            let included = self.reachable(&resolve_all(starts)?);
            let excluded = self.reachable(&resolve_all(excludes)?);
            let commits = self.commits.lock().unwrap();
            let mut out: Vec<(String, String)> = included
                .difference(&excluded)
                .filter_map(|h| commits.get(h).map(|(_, msg)| (h.clone(), msg.clone())))
                .collect();
            out.sort();
            Ok(out)
        }

        fn read_commits(&self, hashes: &[String]) -> Result<Vec<CommitInfo>> {
            let commits = self.commits.lock().unwrap();
            hashes
                .iter()
                .map(|h| {
                    let (parents, message) = commits
                        .get(h)
                        .ok_or_else(|| anyhow::anyhow!("bad object {h}"))?;
                    Ok(CommitInfo {
                        hash: h.clone(),
                        first_parent: parents.first().cloned(),
                        message: message.clone(),
                    })
                })
                .collect()
        }

        fn delete_refs(&self, refs: &[String], apply: bool) -> Result<()> {
            self.delete_calls
                .lock()
                .unwrap()
                .push((refs.to_vec(), apply));
            if apply {
                let mut map = self.refs.lock().unwrap();
                for r in refs {
                    map.remove(r);
                }
            }
            Ok(())
        }
    }
}

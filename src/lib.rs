pub mod ancestry;
pub mod cli;
pub mod config;
pub mod error;
pub mod gerrit;
pub mod git;
pub mod last_run;
pub mod prune;
pub mod reachability;
pub mod refs;
pub mod upstream;

use anyhow::{Context, Result};
use chrono::Local;
use fd_lock::RwLock as FdRwLock;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info, warn};

use config::Config;
use gerrit::{QueryResult, ReviewServer, SshReviewServer};
use git::{GitBackend, GitCli};
use last_run::{LastRun, load_last_run, write_last_run};
use prune::{PruneSet, StatePlan};

// ─── AppContext ───────────────────────────────────────────────────────────────

/// Shared dependencies injected into the GC.
///
/// Tests substitute [`git::mock::MockGit`] and
/// [`gerrit::mock::MockReviewServer`] to run without a repository or network.
pub struct AppContext {
    /// Repository operations; `git` in production.
    pub git: Box<dyn GitBackend>,
    /// Review status queries; ssh in production.
    pub server: Box<dyn ReviewServer>,
}

impl AppContext {
    /// Production context for the repository at `repo_dir`.
    pub fn production(repo_dir: &Path, config: &Config) -> Self {
        AppContext {
            git: Box::new(GitCli::new(repo_dir)),
            server: Box::new(SshReviewServer {
                ssh_command: config.ssh_command.clone(),
            }),
        }
    }
}

/// Options for one invocation of [`cmd_gc`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOptions {
    pub dry_run: bool,
    pub auto: bool,
}

/// Outcome of one GC pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Private refs that survive, sorted.
    pub kept: Vec<String>,
    /// Private refs deleted (or, in dry-run, that would be), sorted.
    pub pruned: Vec<String>,
    /// Unrecognized private refs, left untouched.
    pub foreign: Vec<String>,
    pub dry_run: bool,
}

// ─── `gc` command ─────────────────────────────────────────────────────────────

/// Run the GC with locking and last-run bookkeeping around [`perform_gc`].
///
/// Skips (successfully) when another instance holds the lock, or when `auto`
/// is set and the last run is more recent than `gc_interval_days`.
pub fn cmd_gc(ctx: &AppContext, config: &Config, opts: GcOptions) -> Result<Option<GcReport>> {
    let start = Instant::now();
    let git_dir = ctx.git.git_dir().context("locating git directory")?;
    let marker_path = marker_path(&git_dir);

    let mut lock = open_lock_file(&lock_path(&git_dir))?;
    let Ok(_guard) = lock.try_write() else {
        warn!("Another review-gc instance is running in this repository. Skipping.");
        return Ok(None);
    };

    if opts.auto {
        let marker = load_last_run(&marker_path)?;
        if !marker.is_due(Local::now().fixed_offset(), config.gc_interval_days) {
            debug!("Last GC is less than {} day(s) old; nothing to do", config.gc_interval_days);
            return Ok(None);
        }
    }

    let report = perform_gc(ctx, config, opts.dry_run)?;

    if !opts.dry_run {
        write_last_run(&marker_path, &LastRun::now())?;
    }

    info!(
        "Done in {:.2}s: kept {}, {} {}",
        start.elapsed().as_secs_f64(),
        report.kept.len(),
        if opts.dry_run { "would prune" } else { "pruned" },
        report.pruned.len(),
    );
    Ok(Some(report))
}

/// Decide which private refs are stale and delete them in one batch.
///
/// Steps: scan refs → resolve upstreams → walk local history → plan state
/// refs → query the review server → settle state refs → retain fetched
/// ancestry → delete. Every read happens before the single write, so a
/// failure at any step leaves the repository untouched.
pub fn perform_gc(ctx: &AppContext, config: &Config, dry_run: bool) -> Result<GcReport> {
    let git = ctx.git.as_ref();

    let scan = refs::scan_refs(git)?;
    let upstreams = upstream::resolve_upstreams(git, &scan)?;
    let mut live = reachability::collect_live_change_ids(git, &scan, &upstreams)?;

    let records = prune::load_state_records(git, &scan)?;
    let plan = StatePlan::new(&records, &live);
    if !plan.unrecognized.is_empty() {
        info!(
            "{} state ref key(s) carry no Change-Id and will be pruned: {}",
            plan.unrecognized.len(),
            plan.unrecognized.iter().cloned().collect::<Vec<_>>().join(", ")
        );
    }

    let mut terms: BTreeSet<String> = plan.query_ids();
    terms.extend(scan.fetched.keys().cloned());
    let query = if terms.is_empty() {
        QueryResult::default()
    } else {
        let target = gerrit::resolve_target(git, &upstreams, &config.default_remote)?;
        gerrit::query_status(ctx.server.as_ref(), &target, &terms)
            .context("querying review status")?
    };

    let mut prune = PruneSet::from_scan(&scan);
    for seq in plan.resolve(&query, &mut live) {
        prune.keep_state(&seq);
    }

    let seeds = prune::live_fetched_keys(&scan, &query, &live);
    for number in ancestry::retain_ancestors(git, &scan, &query, &seeds)? {
        prune.keep_fetched(&number);
    }

    let pruned = prune.ref_names();
    let pruned_set: BTreeSet<&String> = pruned.iter().collect();
    let kept: Vec<String> = scan
        .state
        .values()
        .chain(scan.fetched.values())
        .flatten()
        .map(|(name, _)| name)
        .filter(|name| !pruned_set.contains(name))
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    apply_deletions(git, &pruned, dry_run)?;

    Ok(GcReport {
        kept,
        pruned,
        foreign: scan.foreign,
        dry_run,
    })
}

/// Delete `refs` as a single batch, or in dry-run just report them.
///
/// Both modes log every ref at the same level so a dry run reads exactly
/// like the real one.
pub fn apply_deletions(git: &dyn GitBackend, refs: &[String], dry_run: bool) -> Result<()> {
    if refs.is_empty() {
        info!("No stale refs found.");
        return Ok(());
    }
    for r in refs {
        if dry_run {
            info!("[dry-run] would delete {r}");
        } else {
            info!("deleting {r}");
        }
    }
    git.delete_refs(refs, !dry_run)
        .with_context(|| format!("deleting {} ref(s)", refs.len()))
}

// ─── Paths & lockfile ────────────────────────────────────────────────────────

fn marker_path(git_dir: &Path) -> PathBuf {
    git_dir.join("review-gc/last-run.json")
}

fn lock_path(git_dir: &Path) -> PathBuf {
    git_dir.join("review-gc.lock")
}

/// Open (or create) the lockfile and return it wrapped in an `RwLock`.
///
/// The caller holds the guard from [`try_write()`](FdRwLock::try_write) for
/// the exclusive section; the OS releases the lock on process exit.
fn open_lock_file(lock_path: &Path) -> Result<FdRwLock<fs::File>> {
    use std::fs::OpenOptions;

    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating lockfile dir: {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("opening lockfile: {}", lock_path.display()))?;

    Ok(FdRwLock::new(file))
}

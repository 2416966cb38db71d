use anyhow::{Context, Result};
use std::collections::HashSet;
use tracing::debug;

use crate::git::GitBackend;
use crate::refs::RefScan;
use crate::upstream::Upstreams;

const CHANGE_ID_TRAILER: &str = "Change-Id:";

/// Extract the authoritative `Change-Id:` trailer from a commit message.
///
/// When several are present the last one wins, matching how the review
/// server resolves duplicates. Returns `None` when the message has none.
pub fn extract_change_id(message: &str) -> Option<&str> {
    message.lines().rev().find_map(|line| {
        let rest = line.trim_end().strip_prefix(CHANGE_ID_TRAILER)?;
        let mut tokens = rest.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(id), None) => Some(id),
            _ => None,
        }
    })
}

/// Collect the ChangeIds of every commit reachable from `HEAD` or any local
/// branch tip but not already reachable from a resolved upstream.
pub fn collect_live_change_ids(
    git: &dyn GitBackend,
    scan: &RefScan,
    upstreams: &Upstreams,
) -> Result<HashSet<String>> {
    let mut starts: Vec<String> = Vec::new();
    if let Some(head) = git.head().context("resolving HEAD")? {
        starts.push(head);
    }
    for tip in scan.local_branches.values() {
        if !starts.contains(tip) {
            starts.push(tip.clone());
        }
    }
    if starts.is_empty() {
        debug!("No local history to walk");
        return Ok(HashSet::new());
    }

    let excludes: Vec<String> = upstreams.exclude_refs.iter().cloned().collect();
    let commits = git
        .walk_messages(&starts, &excludes)
        .context("walking local branch history")?;

    let live: HashSet<String> = commits
        .iter()
        .filter_map(|(_, message)| extract_change_id(message))
        .map(str::to_string)
        .collect();

    debug!(
        "Walked {} local commit(s), {} carry a Change-Id",
        commits.len(),
        live.len()
    );
    Ok(live)
}

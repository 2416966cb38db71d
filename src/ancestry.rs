use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

use crate::gerrit::QueryResult;
use crate::git::{CommitInfo, GitBackend};
use crate::reachability::extract_change_id;
use crate::refs::RefScan;

/// Extend `seeds` (fetched-ref numbers already kept) with every fetched
/// number whose patchset lies on a first-parent chain below a kept one.
///
/// The walk follows first parents only and stops at a root commit or at a
/// commit whose ChangeId maps to no fetched number. Each commit is walked
/// once, but every first parent reached has its keys looked up, so the
/// result never shrinks when more seeds are given. Commits are read a layer
/// at a time.
pub fn retain_ancestors(
    git: &dyn GitBackend,
    scan: &RefScan,
    query: &QueryResult,
    seeds: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    let fetched_commits: HashSet<&str> = scan
        .fetched
        .values()
        .flatten()
        .map(|(_, hash)| hash.as_str())
        .collect();
    let commits_of = |number: &str| -> Vec<String> {
        scan.fetched
            .get(number)
            .into_iter()
            .flatten()
            .map(|(_, hash)| hash.clone())
            .collect()
    };

    let mut kept = seeds.clone();
    let mut worklist: VecDeque<String> = seeds.iter().flat_map(|n| commits_of(n)).collect();
    let mut visited: HashSet<String> = HashSet::new();
    let mut cache: HashMap<String, CommitInfo> = HashMap::new();

    while !worklist.is_empty() {
        let layer: Vec<String> = worklist
            .drain(..)
            .filter(|h| visited.insert(h.clone()))
            .collect();
        load_commits(git, &mut cache, &layer)?;

        let mut parents = Vec::new();
        for hash in &layer {
            let info = lookup(&cache, hash)?;
            if fetched_commits.contains(hash.as_str()) && extract_change_id(&info.message).is_none()
            {
                anyhow::bail!("fetched patchset {hash} has no Change-Id trailer");
            }
            // A parent already walked (e.g. another seed) still contributes
            // its keys; `visited` only guards re-walking it.
            match &info.first_parent {
                Some(parent) => parents.push(parent.clone()),
                None => trace!("{hash} is the bottom of its series"),
            }
        }
        parents.sort();
        parents.dedup();
        load_commits(git, &mut cache, &parents)?;

        for parent in parents {
            let info = lookup(&cache, &parent)?;
            let Some(change_id) = extract_change_id(&info.message) else {
                trace!("{parent} has no Change-Id; series ends");
                continue;
            };
            let keys: Vec<&String> = query
                .keys_for(change_id)
                .filter(|k| scan.fetched.contains_key(k.as_str()))
                .collect();
            if keys.is_empty() {
                trace!("{parent} ({change_id}) was never fetched; series ends");
                continue;
            }
            for key in keys {
                if kept.insert(key.clone()) {
                    debug!("Keeping fetched change {key}: ancestor of a kept patchset");
                    worklist.extend(commits_of(key));
                }
            }
            if !visited.contains(&parent) {
                worklist.push_back(parent);
            }
        }
    }

    Ok(kept)
}

fn load_commits(
    git: &dyn GitBackend,
    cache: &mut HashMap<String, CommitInfo>,
    hashes: &[String],
) -> Result<()> {
    let missing: BTreeSet<String> = hashes
        .iter()
        .filter(|h| !cache.contains_key(*h))
        .cloned()
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let missing: Vec<String> = missing.into_iter().collect();
    for info in git
        .read_commits(&missing)
        .context("reading patchset ancestry")?
    {
        cache.insert(info.hash.clone(), info);
    }
    Ok(())
}

fn lookup<'a>(cache: &'a HashMap<String, CommitInfo>, hash: &str) -> Result<&'a CommitInfo> {
    cache
        .get(hash)
        .with_context(|| format!("commit {hash} could not be read"))
}

use anyhow::Result;
use std::collections::BTreeSet;
use tracing::{debug, trace};

use crate::git::GitBackend;
use crate::refs::{HEADS_PREFIX, REMOTES_PREFIX, RefScan};

/// Remote-tracking refs that local branches already push to, and the remotes
/// those branches use.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Upstreams {
    /// Existing `refs/remotes/<remote>/<branch>` refs, used as walk boundaries.
    pub exclude_refs: BTreeSet<String>,
    /// Remotes that at least one local branch tracks.
    pub remotes: BTreeSet<String>,
}

/// Resolve `branch.<name>.remote` / `branch.<name>.merge` for every local
/// branch.
///
/// A configured upstream whose remote-tracking ref no longer exists (the
/// remote branch was deleted, or never fetched) is skipped. Branches tracking
/// another local branch (`remote = .`) contribute nothing.
pub fn resolve_upstreams(git: &dyn GitBackend, scan: &RefScan) -> Result<Upstreams> {
    let mut upstreams = Upstreams::default();

    for branch in scan.local_branches.keys() {
        let Some(remote) = git.config_get(&format!("branch.{branch}.remote"))? else {
            continue;
        };
        if remote == "." {
            trace!("{branch} tracks a local branch");
            continue;
        }
        let Some(merge) = git.config_get(&format!("branch.{branch}.merge"))? else {
            continue;
        };
        let remote_branch = merge.strip_prefix(HEADS_PREFIX).unwrap_or(&merge);
        let tracking = format!("{REMOTES_PREFIX}{remote}/{remote_branch}");

        if scan.remote_refs.contains_key(&tracking) {
            trace!("{branch} → {tracking}");
            upstreams.exclude_refs.insert(tracking);
            upstreams.remotes.insert(remote);
        } else {
            debug!("Upstream {tracking} of {branch} does not exist; ignoring");
        }
    }

    debug!(
        "{} upstream ref(s) across {} remote(s)",
        upstreams.exclude_refs.len(),
        upstreams.remotes.len()
    );
    Ok(upstreams)
}

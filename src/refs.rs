use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::git::GitBackend;

pub const HEADS_PREFIX: &str = "refs/heads/";
pub const REMOTES_PREFIX: &str = "refs/remotes/";
/// The tool-private namespace holding per-Change and per-patchset refs.
pub const PRIVATE_PREFIX: &str = "refs/review/";

/// A ref in the private namespace, classified once by its name.
///
/// `i<seq>_…` names are per-Change state refs, `g<number>_…` names are
/// per-fetched-patchset refs. Keys are opaque tokens and never parsed as
/// integers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingRef {
    State { seq: String },
    Fetched { number: String },
    Foreign,
}

impl TrackingRef {
    /// Classify a fully-qualified ref name under [`PRIVATE_PREFIX`].
    pub fn classify(name: &str) -> Self {
        let Some(leaf) = name.strip_prefix(PRIVATE_PREFIX) else {
            return TrackingRef::Foreign;
        };
        if leaf.contains('/') {
            return TrackingRef::Foreign;
        }
        let Some((tagged, _suffix)) = leaf.split_once('_') else {
            return TrackingRef::Foreign;
        };
        let mut chars = tagged.chars();
        let tag = chars.next();
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return TrackingRef::Foreign;
        }
        match tag {
            Some('i') => TrackingRef::State {
                seq: digits.to_string(),
            },
            Some('g') => TrackingRef::Fetched {
                number: digits.to_string(),
            },
            _ => TrackingRef::Foreign,
        }
    }
}

/// Everything the GC needs from one pass over the ref namespaces.
#[derive(Debug, Default, Clone)]
pub struct RefScan {
    /// branch name (without `refs/heads/`) → tip hash
    pub local_branches: BTreeMap<String, String>,
    /// full ref name → hash
    pub remote_refs: BTreeMap<String, String>,
    /// seq → [(ref name, hash)]
    pub state: BTreeMap<String, Vec<(String, String)>>,
    /// gerrit number → [(ref name, hash)]
    pub fetched: BTreeMap<String, Vec<(String, String)>>,
    /// Unrecognized private refs; always preserved.
    pub foreign: Vec<String>,
}

impl RefScan {
    pub fn state_ref_count(&self) -> usize {
        self.state.values().map(Vec::len).sum()
    }

    pub fn fetched_ref_count(&self) -> usize {
        self.fetched.values().map(Vec::len).sum()
    }
}

/// Enumerate local branches, remote-tracking branches, and private refs in
/// a single listing and bucket them.
pub fn scan_refs(git: &dyn GitBackend) -> Result<RefScan> {
    let records = git
        .list_refs(&[HEADS_PREFIX, REMOTES_PREFIX, PRIVATE_PREFIX])
        .context("listing refs")?;

    let mut scan = RefScan::default();
    for rec in records {
        if let Some(branch) = rec.name.strip_prefix(HEADS_PREFIX) {
            scan.local_branches.insert(branch.to_string(), rec.hash);
        } else if rec.name.starts_with(REMOTES_PREFIX) {
            scan.remote_refs.insert(rec.name, rec.hash);
        } else {
            match TrackingRef::classify(&rec.name) {
                TrackingRef::State { seq } => {
                    trace!("state ref {} (seq {})", rec.name, seq);
                    scan.state.entry(seq).or_default().push((rec.name, rec.hash));
                }
                TrackingRef::Fetched { number } => {
                    trace!("fetched ref {} (change {})", rec.name, number);
                    scan.fetched
                        .entry(number)
                        .or_default()
                        .push((rec.name, rec.hash));
                }
                TrackingRef::Foreign => {
                    debug!("Leaving unrecognized ref alone: {}", rec.name);
                    scan.foreign.push(rec.name);
                }
            }
        }
    }

    debug!(
        "Scanned {} local branch(es), {} remote ref(s), {} state ref(s), {} fetched ref(s), {} foreign ref(s)",
        scan.local_branches.len(),
        scan.remote_refs.len(),
        scan.state_ref_count(),
        scan.fetched_ref_count(),
        scan.foreign.len()
    );
    Ok(scan)
}

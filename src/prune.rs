//! Survival decisions for state refs and the shrinking prune set.
//!
//! Every private ref starts out in the [`PruneSet`]; evidence of liveness
//! removes it. Nothing is ever added back, so a bug in any evidence source
//! can only make the GC keep more, never delete something it didn't list.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::gerrit::QueryResult;
use crate::git::GitBackend;
use crate::reachability::extract_change_id;
use crate::refs::RefScan;

/// What the GC knows about one locally initiated Change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub refs: Vec<String>,
    /// `None` when no ref under this key points at a commit with a trailer.
    pub change_id: Option<String>,
}

/// Read the commit behind every state ref and derive each key's ChangeId.
pub fn load_state_records(
    git: &dyn GitBackend,
    scan: &RefScan,
) -> Result<BTreeMap<String, StateRecord>> {
    let hashes: BTreeSet<String> = scan
        .state
        .values()
        .flatten()
        .map(|(_, hash)| hash.clone())
        .collect();
    let hashes: Vec<String> = hashes.into_iter().collect();
    let commits = git
        .read_commits(&hashes)
        .context("reading state ref commits")?;
    let ids: HashMap<&str, &str> = commits
        .iter()
        .filter_map(|c| extract_change_id(&c.message).map(|id| (c.hash.as_str(), id)))
        .collect();

    Ok(scan
        .state
        .iter()
        .map(|(seq, refs)| {
            let change_id = refs
                .iter()
                .find_map(|(_, hash)| ids.get(hash.as_str()))
                .map(|id| id.to_string());
            let record = StateRecord {
                refs: refs.iter().map(|(name, _)| name.clone()).collect(),
                change_id,
            };
            (seq.clone(), record)
        })
        .collect())
}

/// First half of the state-ref decision: what local history already proves,
/// and what still has to be asked of the server.
#[derive(Debug, Default, Clone)]
pub struct StatePlan {
    pub kept: BTreeSet<String>,
    /// seq → ChangeId awaiting a server verdict
    pub pending: BTreeMap<String, String>,
    pub unrecognized: BTreeSet<String>,
}

impl StatePlan {
    /// Keys whose ChangeId is in `live` are kept outright; local existence
    /// wins over anything the server might say.
    pub fn new(records: &BTreeMap<String, StateRecord>, live: &HashSet<String>) -> Self {
        let mut plan = StatePlan::default();
        for (seq, record) in records {
            match &record.change_id {
                Some(id) if live.contains(id) => {
                    debug!("Keeping change {seq} ({id}): reachable locally");
                    plan.kept.insert(seq.clone());
                }
                Some(id) => {
                    plan.pending.insert(seq.clone(), id.clone());
                }
                None => {
                    info!("Change {seq} has no recognizable Change-Id; pruning");
                    plan.unrecognized.insert(seq.clone());
                }
            }
        }
        plan
    }

    /// ChangeIds the server must be asked about.
    pub fn query_ids(&self) -> BTreeSet<String> {
        self.pending.values().cloned().collect()
    }

    /// Settle pending keys from the server's answer.
    ///
    /// Active changes are kept and their ChangeIds become live, which lets
    /// the ancestry closure retain their fetched bases. Terminal and absent
    /// changes alike are dropped from `kept`.
    pub fn resolve(mut self, query: &QueryResult, live: &mut HashSet<String>) -> BTreeSet<String> {
        for (seq, id) in std::mem::take(&mut self.pending) {
            if query.is_active(&id) {
                debug!("Keeping change {seq} ({id}): active on the server");
                live.insert(id);
                self.kept.insert(seq);
            } else {
                debug!("Change {seq} ({id}) is merged, abandoned, or unknown");
            }
        }
        self.kept
    }
}

/// Fetched-ref numbers whose Change is live. These seed the ancestry closure.
pub fn live_fetched_keys(
    scan: &RefScan,
    query: &QueryResult,
    live: &HashSet<String>,
) -> BTreeSet<String> {
    scan.fetched
        .keys()
        .filter(|number| {
            query
                .change_id_for(number)
                .is_some_and(|id| live.contains(id))
        })
        .cloned()
        .collect()
}

/// Private refs slated for deletion, bucketed by kind and keyed the way the
/// scan keyed them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneSet {
    pub state: BTreeMap<String, Vec<String>>,
    pub fetched: BTreeMap<String, Vec<String>>,
}

impl PruneSet {
    /// Start from every state and fetched ref. Foreign refs are never listed.
    pub fn from_scan(scan: &RefScan) -> Self {
        let names = |bucket: &BTreeMap<String, Vec<(String, String)>>| -> BTreeMap<String, Vec<String>> {
            bucket
                .iter()
                .map(|(key, refs)| (key.clone(), refs.iter().map(|(n, _)| n.clone()).collect()))
                .collect()
        };
        PruneSet {
            state: names(&scan.state),
            fetched: names(&scan.fetched),
        }
    }

    pub fn keep_state(&mut self, seq: &str) {
        self.state.remove(seq);
    }

    pub fn keep_fetched(&mut self, number: &str) {
        self.fetched.remove(number);
    }

    /// Every ref name to delete, sorted.
    pub fn ref_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .values()
            .chain(self.fetched.values())
            .flatten()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gerrit::parse_query_output;
    use crate::git::mock::MockGit;
    use crate::refs::scan_refs;

    fn record(refs: &[&str], id: Option<&str>) -> StateRecord {
        StateRecord {
            refs: refs.iter().map(|s| s.to_string()).collect(),
            change_id: id.map(str::to_string),
        }
    }

    fn query(lines: &[&str]) -> QueryResult {
        let mut out = lines.join("\n");
        out.push_str("\n{\"type\":\"stats\",\"rowCount\":0}\n");
        parse_query_output(&out).unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_local_reachability_beats_abandoned_status() {
        let records = BTreeMap::from([("1".to_string(), record(&["refs/review/i1_a"], Some("Ia")))]);
        let mut live = HashSet::from(["Ia".to_string()]);
        let plan = StatePlan::new(&records, &live);
        assert!(plan.query_ids().is_empty());

        let q = query(&[r#"{"number":10,"id":"Ia","branch":"main","status":"ABANDONED"}"#]);
        assert_eq!(plan.resolve(&q, &mut live), set(&["1"]));
    }

    #[test]
    fn test_active_change_is_kept_and_made_live() {
        let records = BTreeMap::from([("2".to_string(), record(&["refs/review/i2_b"], Some("Ib")))]);
        let mut live = HashSet::new();
        let plan = StatePlan::new(&records, &live);
        assert_eq!(plan.query_ids(), set(&["Ib"]));

        let q = query(&[r#"{"number":20,"id":"Ib","branch":"main","status":"NEW"}"#]);
        assert_eq!(plan.resolve(&q, &mut live), set(&["2"]));
        assert!(live.contains("Ib"));
    }

    #[test]
    fn test_absent_merged_and_abandoned_are_all_pruned() {
        let records = BTreeMap::from([
            ("1".to_string(), record(&["refs/review/i1_a"], Some("Iabsent"))),
            ("2".to_string(), record(&["refs/review/i2_b"], Some("Imerged"))),
            ("3".to_string(), record(&["refs/review/i3_c"], Some("Iabandoned"))),
        ]);
        let mut live = HashSet::new();
        let plan = StatePlan::new(&records, &live);
        let q = query(&[
            r#"{"number":2,"id":"Imerged","branch":"main","status":"MERGED"}"#,
            r#"{"number":3,"id":"Iabandoned","branch":"main","status":"ABANDONED"}"#,
        ]);
        assert!(plan.resolve(&q, &mut live).is_empty());
        assert!(live.is_empty());
    }

    #[test]
    fn test_unrecognized_state_is_not_queried() {
        let records = BTreeMap::from([("9".to_string(), record(&["refs/review/i9_x"], None))]);
        let plan = StatePlan::new(&records, &HashSet::new());
        assert!(plan.query_ids().is_empty());
        assert_eq!(plan.unrecognized, set(&["9"]));
    }

    #[test]
    fn test_load_state_records_reads_trailers() {
        let git = MockGit::new("/r/.git");
        git.add_commit("c1", &[], "one\n\nChange-Id: Ione\n");
        git.add_commit("c2", &[], "no trailer\n");
        git.set_ref("refs/review/i1_topic", "c1");
        git.set_ref("refs/review/i2_topic", "c2");
        let scan = scan_refs(&git).unwrap();

        let records = load_state_records(&git, &scan).unwrap();
        assert_eq!(records["1"].change_id.as_deref(), Some("Ione"));
        assert_eq!(records["2"].change_id, None);
        assert_eq!(records["2"].refs, vec!["refs/review/i2_topic".to_string()]);
    }

    #[test]
    fn test_live_fetched_keys() {
        let git = MockGit::new("/r/.git");
        git.set_ref("refs/review/g10_1", "x");
        git.set_ref("refs/review/g11_1", "y");
        git.set_ref("refs/review/g12_1", "z");
        let scan = scan_refs(&git).unwrap();
        let q = query(&[
            r#"{"number":10,"id":"Ilive","branch":"main","status":"NEW"}"#,
            r#"{"number":11,"id":"Idead","branch":"main","status":"NEW"}"#,
        ]);
        let live = HashSet::from(["Ilive".to_string()]);
        assert_eq!(live_fetched_keys(&scan, &q, &live), set(&["10"]));
    }

    #[test]
    fn test_prune_set_only_shrinks() {
        let git = MockGit::new("/r/.git");
        git.set_ref("refs/review/i1_a", "x");
        git.set_ref("refs/review/g5_1", "y");
        git.set_ref("refs/review/g5_2", "z");
        git.set_ref("refs/review/junk", "w");
        let scan = scan_refs(&git).unwrap();

        let mut prune = PruneSet::from_scan(&scan);
        assert_eq!(
            prune.ref_names(),
            vec!["refs/review/g5_1", "refs/review/g5_2", "refs/review/i1_a"]
        );
        prune.keep_fetched("5");
        assert_eq!(prune.ref_names(), vec!["refs/review/i1_a"]);
        prune.keep_state("1");
        prune.keep_state("1");
        assert!(prune.ref_names().is_empty());
    }
}

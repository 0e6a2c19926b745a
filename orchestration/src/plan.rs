//! Work planning — the pending set and its independent subset.
//!
//! Pending issues form a dependency graph over their `blocks` edges. The
//! independent set is the subset with no open predecessor among the pending
//! issues; those are safe to run concurrently.

use crate::store::{
    run_label, AdapterResult, Issue, IssueStatus, IssueStore, CHECKPOINT_LABEL, PAUSE_LABEL,
    REVIEW_LABEL, SKIPPED_LABEL,
};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::collections::HashSet;

/// Pending work for a run: open or in-progress issues under the run's
/// label, excluding the epic itself and materialised checkpoint/review
/// records, pause markers, and issues already given up on.
pub fn pending_work(store: &dyn IssueStore, run_id: &str) -> AdapterResult<Vec<Issue>> {
    let tag = run_label(run_id);
    Ok(store
        .list_all()?
        .into_iter()
        .filter(|i| {
            i.id != run_id
                && i.has_label(&tag)
                && i.status != IssueStatus::Closed
                && !i.has_label(CHECKPOINT_LABEL)
                && !i.has_label(REVIEW_LABEL)
                && !i.has_label(PAUSE_LABEL)
                && !i.has_label(SKIPPED_LABEL)
        })
        .collect())
}

/// The independent subset of `pending`, sorted by (priority, id).
///
/// An issue is independent when none of its `blocks` predecessors is itself
/// in the pending set; predecessors outside the set are treated as settled.
pub fn independent_set(pending: &[Issue]) -> Vec<Issue> {
    let pending_ids: HashSet<&str> = pending.iter().map(|i| i.id.as_str()).collect();

    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for issue in pending {
        graph.add_node(issue.id.as_str());
        for blocker in issue.blocking_ids() {
            if pending_ids.contains(blocker) {
                graph.add_edge(blocker, issue.id.as_str(), ());
            }
        }
    }

    let mut independent: Vec<Issue> = pending
        .iter()
        .filter(|issue| {
            graph
                .neighbors_directed(issue.id.as_str(), Direction::Incoming)
                .next()
                .is_none()
        })
        .cloned()
        .collect();
    independent.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
    independent
}

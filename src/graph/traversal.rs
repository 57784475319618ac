use std::collections::HashSet;

use super::types::EdgeStatus;

/// Upper bound on DFS steps when tracing an edge back around a cycle.
const MAX_TRACE_STEPS: usize = 3000;

/// Incoming edges of a node, grouped for readiness checks.
///
/// `common` edges come from outside any cycle through the node. Edges that can
/// be traced back to the node itself form recursive groups keyed by the most
/// recent branch decision on that cycle. Cycles without any branch are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingGroups {
    pub common: Vec<usize>,
    pub recursive: Vec<Vec<usize>>,
}

/// Scheduling decision for a node given its incoming edge statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRunStatus {
    Run,
    Skip,
    Wait,
}

impl IncomingGroups {
    pub fn is_empty(&self) -> bool {
        self.common.is_empty() && self.recursive.is_empty()
    }

    /// Run if some group has an active edge and no waiting edge. Skip if the
    /// common group or any recursive group is entirely skipped. Otherwise wait.
    pub fn status(&self, edge_status: &[EdgeStatus]) -> NodeRunStatus {
        if self.is_empty() {
            return NodeRunStatus::Run;
        }
        let ready = |group: &[usize]| {
            group.iter().any(|&e| edge_status[e] == EdgeStatus::Active)
                && group.iter().all(|&e| edge_status[e] != EdgeStatus::Waiting)
        };
        let all_skipped = |group: &[usize]| {
            !group.is_empty() && group.iter().all(|&e| edge_status[e] == EdgeStatus::Skipped)
        };

        if ready(&self.common) || self.recursive.iter().any(|g| ready(g)) {
            return NodeRunStatus::Run;
        }
        if all_skipped(&self.common) || self.recursive.iter().any(|g| all_skipped(g)) {
            return NodeRunStatus::Skip;
        }
        NodeRunStatus::Wait
    }
}

/// Minimal edge view used by the classifier.
pub(crate) struct EdgeView<'a> {
    pub source: usize,
    pub target: usize,
    pub handle: &'a str,
}

/// Classifies `incoming` edges of `target`.
///
/// `on_cycle(e)` tells whether edge `e` lies on a cycle at all. Edges that do
/// not are common without tracing.
pub(crate) fn classify_incoming(
    target: usize,
    edges: &[EdgeView<'_>],
    incoming: &[Vec<usize>],
    is_branch: &[bool],
    on_cycle: impl Fn(usize) -> bool,
) -> IncomingGroups {
    let mut groups = IncomingGroups::default();
    let mut keys: Vec<(usize, String)> = Vec::new();

    for &edge in &incoming[target] {
        if !on_cycle(edge) {
            groups.common.push(edge);
            continue;
        }
        match last_branch_handle(edge, target, edges, incoming, is_branch) {
            Trace::Branch(key) => match keys.iter().position(|k| *k == key) {
                Some(pos) => groups.recursive[pos].push(edge),
                None => {
                    keys.push(key);
                    groups.recursive.push(vec![edge]);
                }
            },
            Trace::Unbranched => {
                tracing::debug!(edge, target, "ignoring edge on a cycle without branches");
            }
            Trace::NotFound => groups.common.push(edge),
        }
    }
    groups
}

enum Trace {
    /// Most recent branch on the cycle, as (branch node, handle).
    Branch((usize, String)),
    Unbranched,
    NotFound,
}

fn last_branch_handle(
    start: usize,
    target: usize,
    edges: &[EdgeView<'_>],
    incoming: &[Vec<usize>],
    is_branch: &[bool],
) -> Trace {
    struct Frame {
        edge: usize,
        visited: HashSet<usize>,
        latest: Option<(usize, String)>,
    }

    let mut stack = vec![Frame {
        edge: start,
        visited: HashSet::from([target]),
        latest: None,
    }];
    let mut steps = 0;

    while let Some(Frame {
        edge,
        visited,
        latest,
    }) = stack.pop()
    {
        steps += 1;
        if steps > MAX_TRACE_STEPS {
            break;
        }
        let source = edges[edge].source;

        if source == target {
            if is_branch[target] {
                return Trace::Branch((target, edges[edge].handle.to_string()));
            }
            return match latest {
                Some(key) => Trace::Branch(key),
                None => Trace::Unbranched,
            };
        }
        if visited.contains(&source) {
            continue;
        }

        let mut next_visited = visited;
        next_visited.insert(source);
        for &next in &incoming[source] {
            let latest = if is_branch[source] {
                Some((source, edges[edge].handle.to_string()))
            } else {
                latest.clone()
            };
            stack.push(Frame {
                edge: next,
                visited: next_visited.clone(),
                latest,
            });
        }
    }
    Trace::NotFound
}

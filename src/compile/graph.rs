//! Phase 5: graph analysis.
//!
//! Builds the dependency index, finds strongly-connected components
//! (iterative Tarjan over the node arena), records cycles as loop
//! subgraphs, and computes a topological rank hint for the acyclic
//! condensation. Cycles without a condition-node exit are rejected: a loop
//! that can never break is a compile error, not a runtime hang.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::EdgeKind;
use crate::types::NodeId;

use super::context::CompilationContext;
use super::{CompileIssue, CompilePhase};

const PHASE: CompilePhase = CompilePhase::Optimization;

pub fn run(ctx: &mut CompilationContext<'_>) {
    // Dependency index: per-node edge positions in arrow order.
    for (i, edge) in ctx.edges.iter().enumerate() {
        ctx.index
            .outgoing
            .entry(edge.source_node.clone())
            .or_default()
            .push(i);
        ctx.index
            .incoming
            .entry(edge.target_node.clone())
            .or_default()
            .push(i);
    }

    let nodes: Vec<NodeId> = ctx.typed_nodes.keys().cloned().collect();
    let adjacency: BTreeMap<&NodeId, Vec<&NodeId>> = nodes
        .iter()
        .map(|n| {
            let targets = ctx
                .index
                .outgoing
                .get(n)
                .into_iter()
                .flatten()
                .map(|&i| &ctx.edges[i].target_node)
                .collect();
            (n, targets)
        })
        .collect();

    let sccs = tarjan(&nodes, &adjacency);

    // Record cycles: components of size > 1, or self loops.
    let mut cycles: Vec<Vec<NodeId>> = Vec::new();
    for component in &sccs {
        let is_cycle = component.len() > 1
            || adjacency
                .get(&component[0])
                .map(|ts| ts.contains(&&component[0]))
                .unwrap_or(false);
        if is_cycle {
            let mut sorted = component.clone();
            sorted.sort();
            cycles.push(sorted);
        }
    }
    cycles.sort();

    // Every cycle needs a condition whose branch leaves the cycle.
    for cycle in &cycles {
        let members: HashSet<&NodeId> = cycle.iter().collect();
        let has_exit = cycle.iter().any(|n| {
            let node = &ctx.typed_nodes[n];
            node.is_condition()
                && ctx
                    .index
                    .outgoing
                    .get(n)
                    .into_iter()
                    .flatten()
                    .any(|&i| !members.contains(&ctx.edges[i].target_node))
        });
        if !has_exit {
            ctx.errors.push(CompileIssue::node(
                PHASE,
                format!(
                    "cycle [{}] has no condition branch leaving it",
                    cycle
                        .iter()
                        .map(|n| n.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                cycle[0].clone(),
            ));
        }
    }
    if !ctx.errors.is_empty() {
        ctx.cycles = cycles;
        return;
    }

    // Mark loop-back edges: condition branches staying inside their cycle.
    let mut in_cycle: HashMap<&NodeId, usize> = HashMap::new();
    for (ci, cycle) in cycles.iter().enumerate() {
        for n in cycle {
            in_cycle.insert(n, ci);
        }
    }
    for edge in ctx.edges.iter_mut() {
        if matches!(edge.kind, EdgeKind::ConditionTrue | EdgeKind::ConditionFalse) {
            if let (Some(a), Some(b)) = (in_cycle.get(&edge.source_node), in_cycle.get(&edge.target_node)) {
                if a == b {
                    edge.is_loopback = true;
                }
            }
        }
    }

    // Topological hint over the SCC condensation (Kahn, NodeId-ordered for
    // determinism). Nodes sharing a cycle share a rank.
    let mut component_of: BTreeMap<&NodeId, usize> = BTreeMap::new();
    for (i, component) in sccs.iter().enumerate() {
        for n in component {
            component_of.insert(n, i);
        }
    }

    let mut cond_out: BTreeMap<usize, HashSet<usize>> = BTreeMap::new();
    let mut cond_in_degree: BTreeMap<usize, usize> = BTreeMap::new();
    for i in 0..sccs.len() {
        cond_out.entry(i).or_default();
        cond_in_degree.entry(i).or_default();
    }
    for edge in &ctx.edges {
        let a = component_of[&edge.source_node];
        let b = component_of[&edge.target_node];
        if a != b && cond_out.entry(a).or_default().insert(b) {
            *cond_in_degree.entry(b).or_default() += 1;
        }
    }

    let mut frontier: Vec<usize> = cond_in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(c, _)| *c)
        .collect();
    frontier.sort();
    let mut rank = 0usize;
    let mut component_rank: BTreeMap<usize, usize> = BTreeMap::new();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for c in frontier.drain(..) {
            component_rank.insert(c, rank);
            for &succ in &cond_out[&c] {
                if let Some(d) = cond_in_degree.get_mut(&succ) {
                    *d -= 1;
                    if *d == 0 {
                        next.push(succ);
                    }
                }
            }
        }
        next.sort();
        frontier = next;
        rank += 1;
    }

    for (node, component) in component_of {
        ctx.topo_hint.insert(
            (*node).clone(),
            component_rank.get(&component).copied().unwrap_or(0),
        );
    }
    ctx.cycles = cycles;
}

/// Iterative Tarjan strongly-connected components over the node arena.
/// Components come out in reverse topological order; callers only need the
/// grouping.
fn tarjan<'a>(
    nodes: &'a [NodeId],
    adjacency: &BTreeMap<&'a NodeId, Vec<&'a NodeId>>,
) -> Vec<Vec<NodeId>> {
    #[derive(Default, Clone)]
    struct Meta {
        index: Option<usize>,
        lowlink: usize,
        on_stack: bool,
    }

    let mut meta: HashMap<&NodeId, Meta> = nodes.iter().map(|n| (n, Meta::default())).collect();
    let mut next_index = 0usize;
    let mut stack: Vec<&NodeId> = Vec::new();
    let mut components: Vec<Vec<NodeId>> = Vec::new();

    // Explicit DFS stack: (node, neighbour cursor).
    for root in nodes {
        if meta[root].index.is_some() {
            continue;
        }
        let mut dfs: Vec<(&NodeId, usize)> = vec![(root, 0)];
        while let Some(&(v, cursor)) = dfs.last() {
            if cursor == 0 {
                let m = meta.get_mut(v).unwrap();
                if m.index.is_none() {
                    m.index = Some(next_index);
                    m.lowlink = next_index;
                    m.on_stack = true;
                    next_index += 1;
                    stack.push(v);
                }
            }

            let neighbours = adjacency.get(v).map(Vec::as_slice).unwrap_or(&[]);
            if cursor < neighbours.len() {
                let w = neighbours[cursor];
                if let Some(frame) = dfs.last_mut() {
                    frame.1 += 1;
                }
                match meta[w].index {
                    None => dfs.push((w, 0)),
                    Some(w_index) => {
                        if meta[w].on_stack {
                            let low = meta[v].lowlink.min(w_index);
                            meta.get_mut(v).unwrap().lowlink = low;
                        }
                    }
                }
            } else {
                // Finished v: fold lowlink into the parent, pop component roots.
                let (v_low, v_index) = {
                    let m = &meta[v];
                    (m.lowlink, m.index.unwrap_or(0))
                };
                if v_low == v_index {
                    let mut component: Vec<NodeId> = Vec::new();
                    while let Some(w) = stack.pop() {
                        meta.get_mut(w).unwrap().on_stack = false;
                        component.push((*w).clone());
                        if w == v {
                            break;
                        }
                    }
                    component.reverse();
                    components.push(component);
                }
                dfs.pop();
                if let Some(&(parent, _)) = dfs.last() {
                    let low = meta[parent].lowlink.min(v_low);
                    meta.get_mut(parent).unwrap().lowlink = low;
                }
            }
        }
    }

    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn tarjan_finds_simple_cycle() {
        let nodes = ids(&["a", "b", "c"]);
        let adjacency: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::from([
            (&nodes[0], vec![&nodes[1]]),
            (&nodes[1], vec![&nodes[2]]),
            (&nodes[2], vec![&nodes[1]]),
        ]);
        let sccs = tarjan(&nodes, &adjacency);
        let cycle: Vec<_> = sccs.iter().filter(|c| c.len() > 1).collect();
        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle[0].len(), 2);
    }

    #[test]
    fn tarjan_acyclic_is_singletons() {
        let nodes = ids(&["a", "b"]);
        let adjacency: BTreeMap<&NodeId, Vec<&NodeId>> =
            BTreeMap::from([(&nodes[0], vec![&nodes[1]]), (&nodes[1], vec![])]);
        let sccs = tarjan(&nodes, &adjacency);
        assert_eq!(sccs.len(), 2);
        assert!(sccs.iter().all(|c| c.len() == 1));
    }
}

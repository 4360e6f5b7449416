//! The dependency planner: turns loop/function/constant declarations into
//! an evaluation order.
//!
//! Nodes are every declared name plus one `#loop_<level>` sentinel per
//! nesting level. A loop variable at level `L` depends on the sentinel of
//! level `L-1` (outer loops step before inner generators re-evaluate) and
//! feeds the sentinel of its own level. Derived variables depend on the
//! names they consume. The planner rejects cycles, floats loop-free
//! functions to level −1 ("compute once before the scan"), assigns every
//! other function to the highest level it transitively reads, and derives
//! each variable's `axis` (the loop levels it varies over) from the data
//! dependencies alone.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::loops::{FunctionDef, Kwds, LoopSpec};
use crate::{Error, Result};

/// Planner output consumed by the iterator and the runner.
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    /// Number of nesting levels.
    pub levels: usize,
    /// Level → ordered ready groups of function names evaluated there.
    /// Level −1 holds the loop-free functions computed before the scan.
    pub order: BTreeMap<i64, Vec<Vec<String>>>,
    /// Variable name → loop levels it varies over (empty: scan-wide).
    pub axis: BTreeMap<String, Vec<usize>>,
}

impl ScanPlan {
    /// Ready groups of one level (empty slice when none).
    pub fn groups_at(&self, level: i64) -> &[Vec<String>] {
        self.order.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn sentinel(level: usize) -> String {
    format!("#loop_{level}")
}

struct GraphBuilder {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        match self.nodes.get(name) {
            Some(ix) => *ix,
            None => {
                let ix = self.graph.add_node(name.to_string());
                self.nodes.insert(name.to_string(), ix);
                ix
            }
        }
    }

    fn edge(&mut self, from: &str, to: &str) {
        let a = self.node(from);
        let b = self.node(to);
        if !self.graph.contains_edge(a, b) {
            self.graph.add_edge(a, b, ());
        }
    }
}

/// Build the evaluation plan, reporting dependency cycles before the
/// scan starts.
pub fn build(
    loops: &[LoopSpec],
    functions: &BTreeMap<String, FunctionDef>,
    constants: &Kwds,
) -> Result<ScanPlan> {
    // declared names and the level of every loop variable
    let mut loop_level: BTreeMap<String, usize> = BTreeMap::new();
    for (level, spec) in loops.iter().enumerate() {
        for key in spec.keys() {
            loop_level.insert(key.to_string(), level);
        }
    }
    let known = |name: &str| {
        loop_level.contains_key(name)
            || functions.contains_key(name)
            || constants.contains_key(name)
    };

    // data dependencies only: used for level classification and axis
    let mut data_deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for spec in loops {
        for entry in &spec.entries {
            let deps: BTreeSet<String> =
                entry.source.deps().into_iter().filter(|d| known(d)).collect();
            for key in &entry.keys {
                data_deps.entry(key.clone()).or_default().extend(deps.clone());
            }
        }
    }
    for (name, def) in functions {
        let deps: BTreeSet<String> = def.deps().into_iter().filter(|d| known(d)).collect();
        data_deps.entry(name.clone()).or_default().extend(deps);
    }

    // ordering graph: data dependencies plus the loop sentinels
    let mut gb = GraphBuilder::new();
    for name in constants.keys() {
        gb.node(name);
    }
    for (name, deps) in &data_deps {
        gb.node(name);
        for d in deps {
            gb.edge(d, name);
        }
    }
    for (level, spec) in loops.iter().enumerate() {
        if level > 0 {
            gb.edge(&sentinel(level - 1), &sentinel(level));
        }
        for key in spec.keys() {
            if level > 0 {
                gb.edge(&sentinel(level - 1), key);
            }
            gb.edge(key, &sentinel(level));
        }
    }

    // cycle check with the offending names in the report
    if petgraph::algo::toposort(&gb.graph, None).is_err() {
        let mut names: Vec<String> = petgraph::algo::tarjan_scc(&gb.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .flatten()
            .map(|ix| gb.graph[ix].clone())
            .filter(|n| !n.starts_with("#loop_"))
            .collect();
        names.sort();
        return Err(Error::CircularDependency { names });
    }

    // transitive data-dependency closure
    fn closure(
        name: &str,
        deps: &BTreeMap<String, BTreeSet<String>>,
        out: &mut BTreeSet<String>,
    ) {
        if let Some(ds) = deps.get(name) {
            for d in ds {
                if out.insert(d.clone()) {
                    closure(d, deps, out);
                }
            }
        }
    }

    // level of a function: the highest loop level it transitively reads
    let mut func_level: BTreeMap<String, i64> = BTreeMap::new();
    for name in functions.keys() {
        let mut deps = BTreeSet::new();
        closure(name, &data_deps, &mut deps);
        let level = deps
            .iter()
            .filter_map(|d| loop_level.get(d))
            .max()
            .map(|l| *l as i64)
            .unwrap_or(-1);
        func_level.insert(name.clone(), level);
    }

    // axis: levels of the loop variables in the data closure
    let mut axis: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for name in constants.keys() {
        axis.insert(name.clone(), vec![]);
    }
    for name in data_deps.keys().chain(loop_level.keys()) {
        let mut deps = BTreeSet::new();
        deps.insert(name.clone());
        closure(name, &data_deps, &mut deps);
        let mut levels: Vec<usize> = deps
            .iter()
            .filter_map(|d| loop_level.get(d).copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        levels.sort_unstable();
        axis.insert(name.clone(), levels);
    }

    // ready groups: Kahn batches over the ordering graph, projected onto
    // the functions of each level
    let mut indegree: HashMap<NodeIndex, usize> = gb
        .graph
        .node_indices()
        .map(|ix| {
            (
                ix,
                gb.graph
                    .neighbors_directed(ix, petgraph::Direction::Incoming)
                    .count(),
            )
        })
        .collect();
    let mut remaining: BTreeSet<NodeIndex> = gb.graph.node_indices().collect();
    let mut batches: Vec<Vec<String>> = vec![];
    while !remaining.is_empty() {
        let mut ready: Vec<NodeIndex> = remaining
            .iter()
            .copied()
            .filter(|ix| indegree[ix] == 0)
            .collect();
        // cycle-free by the check above
        debug_assert!(!ready.is_empty());
        if ready.is_empty() {
            break;
        }
        ready.sort_by_key(|ix| gb.graph[*ix].clone());
        for ix in &ready {
            remaining.remove(ix);
            for succ in gb.graph.neighbors_directed(*ix, petgraph::Direction::Outgoing) {
                if let Some(d) = indegree.get_mut(&succ) {
                    *d = d.saturating_sub(1);
                }
            }
        }
        batches.push(ready.into_iter().map(|ix| gb.graph[ix].clone()).collect());
    }

    let mut order: BTreeMap<i64, Vec<Vec<String>>> = BTreeMap::new();
    for batch in &batches {
        let mut per_level: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for name in batch {
            if let Some(level) = func_level.get(name) {
                per_level.entry(*level).or_default().push(name.clone());
            }
        }
        for (level, group) in per_level {
            order.entry(level).or_default().push(group);
        }
    }

    Ok(ScanPlan {
        levels: loops.len(),
        order,
        axis,
    })
}

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::path::{PathBuf, absolute};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::debug;

use crate::core::Identity;
use crate::error::{CycleError, PlanError};
use crate::item::WorkItem;
use crate::outcome::NodeState;

/// Why one node has to wait for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// The successor consumes what the predecessor produces.
    Dependency,
    /// The successor finalizes the predecessor and runs even if it failed.
    Finalizer,
    MustRunAfter,
    /// Soft ordering, dropped when it would create a cycle.
    ShouldRunAfter,
    /// Both nodes write to overlapping output locations.
    OutputOverlap,
}

impl EdgeKind {
    /// Only a failed dependency prevents its successor from running, every
    /// other edge only delays it.
    pub fn propagates_failure(self) -> bool {
        matches!(self, EdgeKind::Dependency)
    }
}

/// Collects work items and the identities requested for a build.
///
/// # Example
///
/// ```rust
/// use kasane::{ActionContext, Identity, PlanBuilder, WorkItem};
///
/// fn noop(_: &ActionContext) -> anyhow::Result<()> {
///     Ok(())
/// }
///
/// let mut builder = PlanBuilder::new();
/// builder
///     .add(WorkItem::builder("compile", noop).build())
///     .add(WorkItem::builder("test", noop).depends_on("compile").build())
///     .request("test");
///
/// let plan = builder.build().unwrap();
/// assert_eq!(
///     plan.topological_order(),
///     vec![Identity::from("compile"), Identity::from("test")]
/// );
/// ```
#[derive(Debug, Default)]
pub struct PlanBuilder {
    items: Vec<Arc<WorkItem>>,
    requested: Vec<Identity>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a work item. Declaration order breaks ties between items that
    /// could run at the same time.
    pub fn add(&mut self, item: WorkItem) -> &mut Self {
        self.items.push(Arc::new(item));
        self
    }

    pub fn request(&mut self, identity: impl Into<Identity>) -> &mut Self {
        self.requested.push(identity.into());
        self
    }

    /// Resolves the requested items into an acyclic execution plan.
    pub fn build(self) -> Result<ExecutionPlan, PlanError> {
        let mut declared: HashMap<Identity, usize> = HashMap::with_capacity(self.items.len());
        for (position, item) in self.items.iter().enumerate() {
            if declared.insert(item.identity.clone(), position).is_some() {
                return Err(PlanError::DuplicateItem(item.identity.clone()));
            }
        }

        let included = closure(&self.items, &declared, &self.requested)?;

        let mut graph: DiGraph<Arc<WorkItem>, EdgeKind> = DiGraph::new();
        let mut index: HashMap<Identity, NodeIndex> = HashMap::new();
        for (position, item) in self.items.iter().enumerate() {
            if included.contains(&position) {
                let node = graph.add_node(item.clone());
                index.insert(item.identity.clone(), node);
            }
        }

        // Edges run from the node that goes first to the node that waits.
        for node in graph.node_indices() {
            let item = graph[node].clone();
            for dependency in &item.dependencies {
                link(&mut graph, index[dependency], node, EdgeKind::Dependency);
            }
            for finalizer in &item.finalized_by {
                link(&mut graph, node, index[finalizer], EdgeKind::Finalizer);
            }
            for other in &item.must_run_after {
                if let Some(&other) = index.get(other) {
                    link(&mut graph, other, node, EdgeKind::MustRunAfter);
                }
            }
        }

        if let Some(chain) = find_cycle(&graph) {
            return Err(CycleError { chain }.into());
        }

        for node in graph.node_indices() {
            let item = graph[node].clone();
            for other in &item.should_run_after {
                let Some(&other) = index.get(other) else {
                    continue;
                };
                if other == node || has_path_connecting(&graph, node, other, None) {
                    debug!(
                        item = %item.identity,
                        after = %graph[other].identity,
                        "dropping should-run-after constraint, it would introduce a cycle"
                    );
                    continue;
                }
                link(&mut graph, other, node, EdgeKind::ShouldRunAfter);
            }
        }

        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        let outputs: Vec<Vec<PathBuf>> =
            nodes.iter().map(|&n| normalized_outputs(&graph[n])).collect();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in &nodes[i + 1..] {
                if !overlap(&outputs[a.index()], &outputs[b.index()])
                    || has_path_connecting(&graph, a, b, None)
                    || has_path_connecting(&graph, b, a, None)
                {
                    continue;
                }
                let (first, second) = match graph[a].identity <= graph[b].identity {
                    true => (a, b),
                    false => (b, a),
                };
                debug!(
                    first = %graph[first].identity,
                    second = %graph[second].identity,
                    "ordering items with overlapping outputs"
                );
                link(&mut graph, first, second, EdgeKind::OutputOverlap);
            }
        }

        let order = topological(&graph);

        Ok(ExecutionPlan { graph, index, order })
    }
}

/// Indices of every item reachable from the requested ones through
/// dependencies and finalizers.
fn closure(
    items: &[Arc<WorkItem>],
    declared: &HashMap<Identity, usize>,
    requested: &[Identity],
) -> Result<HashSet<usize>, PlanError> {
    let mut included = HashSet::new();
    let mut stack = Vec::new();

    for identity in requested {
        let &position = declared
            .get(identity)
            .ok_or_else(|| PlanError::UnknownRequest(identity.clone()))?;
        stack.push(position);
    }

    while let Some(position) = stack.pop() {
        if !included.insert(position) {
            continue;
        }

        let item = &items[position];
        let references = item
            .dependencies
            .iter()
            .chain(&item.finalized_by)
            .chain(&item.must_run_after)
            .chain(&item.should_run_after);

        for reference in references {
            if !declared.contains_key(reference) {
                return Err(PlanError::UnknownItem {
                    missing: reference.clone(),
                    referrer: item.identity.clone(),
                });
            }
        }

        for reference in item.dependencies.iter().chain(&item.finalized_by) {
            stack.push(declared[reference]);
        }
    }

    Ok(included)
}

/// Adds an edge unless the pair is already connected. A dependency replaces
/// a weaker edge between the same pair.
fn link(
    graph: &mut DiGraph<Arc<WorkItem>, EdgeKind>,
    from: NodeIndex,
    to: NodeIndex,
    kind: EdgeKind,
) {
    match graph.find_edge(from, to) {
        Some(edge) => {
            if kind == EdgeKind::Dependency {
                graph[edge] = kind;
            }
        }
        None => {
            graph.add_edge(from, to, kind);
        }
    }
}

/// Output locations made absolute, so that relative and absolute
/// declarations of the same place compare equal.
fn normalized_outputs(item: &WorkItem) -> Vec<PathBuf> {
    item.outputs
        .iter()
        .map(|output| {
            absolute(output.path.as_std_path())
                .unwrap_or_else(|_| output.path.clone().into_std_path_buf())
        })
        .collect()
}

fn overlap(a: &[PathBuf], b: &[PathBuf]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.starts_with(y) || y.starts_with(x)))
}

fn sorted_neighbors<N, E>(
    graph: &DiGraph<N, E>,
    node: NodeIndex,
    direction: Direction,
) -> Vec<NodeIndex> {
    let mut neighbors: Vec<NodeIndex> = graph.neighbors_directed(node, direction).collect();
    neighbors.sort();
    neighbors.dedup();
    neighbors
}

/// Three-colour depth-first search over the "runs after" relation. Returns
/// the first cycle found, rotated to start at its earliest declared node.
fn find_cycle<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<Identity>>
where
    N: AsRef<WorkItem>,
{
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let mut colour = vec![Colour::White; graph.node_count()];

    for start in graph.node_indices() {
        if colour[start.index()] != Colour::White {
            continue;
        }

        let mut path: Vec<NodeIndex> = vec![start];
        let mut pending: Vec<Vec<NodeIndex>> =
            vec![sorted_neighbors(graph, start, Direction::Incoming)];
        colour[start.index()] = Colour::Grey;

        while let Some(next) = pending.last_mut() {
            let Some(candidate) = next.first().copied() else {
                pending.pop();
                if let Some(done) = path.pop() {
                    colour[done.index()] = Colour::Black;
                }
                continue;
            };
            next.remove(0);

            match colour[candidate.index()] {
                Colour::White => {
                    colour[candidate.index()] = Colour::Grey;
                    path.push(candidate);
                    pending.push(sorted_neighbors(graph, candidate, Direction::Incoming));
                }
                Colour::Grey => {
                    let from = path.iter().position(|&n| n == candidate).unwrap_or(0);
                    let mut cycle: Vec<NodeIndex> = path[from..].to_vec();
                    let earliest = cycle
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, n)| n.index())
                        .map(|(i, _)| i)
                        .unwrap_or(0);
                    cycle.rotate_left(earliest);
                    cycle.push(cycle[0]);
                    return Some(
                        cycle
                            .into_iter()
                            .map(|n| graph[n].as_ref().identity.clone())
                            .collect(),
                    );
                }
                Colour::Black => {}
            }
        }
    }

    None
}

/// Kahn's algorithm, ties broken by declaration order.
fn topological<N, E>(graph: &DiGraph<N, E>) -> Vec<NodeIndex> {
    let mut counts: Vec<usize> = graph
        .node_indices()
        .map(|n| sorted_neighbors(graph, n, Direction::Incoming).len())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| counts[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for successor in sorted_neighbors(graph, node, Direction::Outgoing) {
            counts[successor.index()] -= 1;
            if counts[successor.index()] == 0 {
                ready.push(Reverse(successor));
            }
        }
    }

    order
}

/// The acyclic graph of work items for one build.
///
/// Node indices follow declaration order, which is also the tie-break used
/// everywhere nodes could be ordered either way.
#[derive(Debug)]
pub struct ExecutionPlan {
    graph: DiGraph<Arc<WorkItem>, EdgeKind>,
    index: HashMap<Identity, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&WorkItem> {
        self.index.get(identity).map(|&n| &*self.graph[n])
    }

    /// Items that `identity` waits for, with the reason it waits.
    pub fn predecessors(&self, identity: &str) -> Vec<(&Identity, EdgeKind)> {
        self.neighbors(identity, Direction::Incoming)
    }

    /// Items that wait for `identity`.
    pub fn successors(&self, identity: &str) -> Vec<(&Identity, EdgeKind)> {
        self.neighbors(identity, Direction::Outgoing)
    }

    fn neighbors(&self, identity: &str, direction: Direction) -> Vec<(&Identity, EdgeKind)> {
        let Some(&node) = self.index.get(identity) else {
            return Vec::new();
        };

        let mut neighbors: Vec<(NodeIndex, EdgeKind)> = self
            .graph
            .edges_directed(node, direction)
            .map(|edge| match direction {
                Direction::Incoming => (edge.source(), *edge.weight()),
                Direction::Outgoing => (edge.target(), *edge.weight()),
            })
            .collect();
        neighbors.sort_by_key(|(n, _)| *n);

        neighbors
            .into_iter()
            .map(|(n, kind)| (&self.graph[n].identity, kind))
            .collect()
    }

    /// A deterministic order in which every item comes after everything it
    /// waits for.
    pub fn topological_order(&self) -> Vec<Identity> {
        self.order
            .iter()
            .map(|&n| self.graph[n].identity.clone())
            .collect()
    }

    /// Pending items whose predecessors are all terminal, in declaration
    /// order.
    pub fn readiness(&self, state_of: impl Fn(&Identity) -> NodeState) -> Vec<Identity> {
        self.graph
            .node_indices()
            .filter(|&n| state_of(&self.graph[n].identity) == NodeState::Pending)
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .all(|p| state_of(&self.graph[p].identity).is_terminal())
            })
            .map(|n| self.graph[n].identity.clone())
            .collect()
    }

    pub(crate) fn graph(&self) -> &DiGraph<Arc<WorkItem>, EdgeKind> {
        &self.graph
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].identity.as_str().replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            let (source, target) = (edge.source().index(), edge.target().index());
            let arrow = match edge.weight() {
                EdgeKind::Dependency => "-->",
                EdgeKind::Finalizer => "-- \"finalizer\" -->",
                EdgeKind::MustRunAfter => "-. \"must run after\" .->",
                EdgeKind::ShouldRunAfter => "-. \"should run after\" .->",
                EdgeKind::OutputOverlap => "-. \"overlapping outputs\" .->",
            };
            writeln!(f, "    {source} {arrow} {target}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::item::{ActionContext, WorkItemBuilder};

    fn noop(_: &ActionContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn item(id: &str) -> WorkItemBuilder {
        WorkItem::builder(id, noop)
    }

    fn plan(items: Vec<WorkItemBuilder>, requested: &[&str]) -> Result<ExecutionPlan, PlanError> {
        let mut builder = PlanBuilder::new();
        for item in items {
            builder.add(item.build());
        }
        for id in requested {
            builder.request(*id);
        }
        builder.build()
    }

    fn ids(list: &[&str]) -> Vec<Identity> {
        list.iter().map(|&s| Identity::from(s)).collect()
    }

    #[test]
    fn test_cycle_is_reported_as_chain() {
        let result = plan(
            vec![
                item("a").depends_on("b"),
                item("b").depends_on("c"),
                item("c").depends_on("a"),
            ],
            &["a"],
        );

        let Err(PlanError::Cycle(cycle)) = result else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle.chain, ids(&["a", "b", "c", "a"]));
    }

    #[test]
    fn test_must_run_after_cycle_rejected() {
        let result = plan(
            vec![item("a").depends_on("b"), item("b").must_run_after("a")],
            &["a"],
        );
        assert!(matches!(result, Err(PlanError::Cycle(_))));
    }

    #[test]
    fn test_should_run_after_dropped_on_cycle() {
        let plan = plan(
            vec![item("a").depends_on("b"), item("b").should_run_after("a")],
            &["a"],
        )
        .unwrap();

        assert_eq!(plan.topological_order(), ids(&["b", "a"]));
        assert!(plan.predecessors("b").is_empty());
    }

    #[test]
    fn test_ordering_constraints_only_within_closure() {
        let plan = plan(
            vec![
                item("a").must_run_after("b").should_run_after("c"),
                item("b"),
                item("c"),
            ],
            &["a", "c"],
        )
        .unwrap();

        assert!(!plan.contains("b"));
        assert_eq!(
            plan.predecessors("a"),
            vec![(&Identity::from("c"), EdgeKind::ShouldRunAfter)]
        );
    }

    #[test]
    fn test_unknown_and_duplicate_items() {
        assert!(matches!(
            plan(vec![item("a")], &["missing"]),
            Err(PlanError::UnknownRequest(_))
        ));
        assert!(matches!(
            plan(vec![item("a").depends_on("ghost")], &["a"]),
            Err(PlanError::UnknownItem { .. })
        ));
        assert!(matches!(
            plan(vec![item("a"), item("a")], &["a"]),
            Err(PlanError::DuplicateItem(_))
        ));
    }

    #[test]
    fn test_finalizer_pulled_into_plan() {
        let plan = plan(
            vec![
                item("cleanup"),
                item("start").finalized_by("cleanup"),
                item("unrelated"),
            ],
            &["start"],
        )
        .unwrap();

        assert!(plan.contains("cleanup"));
        assert!(!plan.contains("unrelated"));
        assert_eq!(plan.topological_order(), ids(&["start", "cleanup"]));
        assert_eq!(
            plan.successors("start"),
            vec![(&Identity::from("cleanup"), EdgeKind::Finalizer)]
        );
    }

    #[test]
    fn test_overlapping_outputs_get_ordered() {
        let plan = plan(
            vec![
                item("zeta").output_dir("build/out"),
                item("alpha").output_file("build/out/report.txt"),
                item("beta").output_dir("build/other"),
            ],
            &["zeta", "alpha", "beta"],
        )
        .unwrap();

        assert_eq!(
            plan.predecessors("zeta"),
            vec![(&Identity::from("alpha"), EdgeKind::OutputOverlap)]
        );
        assert!(plan.predecessors("beta").is_empty());
        assert_eq!(plan.topological_order(), ids(&["alpha", "zeta", "beta"]));
    }

    #[test]
    fn test_overlap_between_relative_and_absolute_outputs() {
        let cwd = Utf8PathBuf::try_from(std::env::current_dir().unwrap()).unwrap();
        let plan = plan(
            vec![
                item("docs").output_dir("target/site"),
                item("api").output_file(cwd.join("target/site/api.html")),
            ],
            &["docs", "api"],
        )
        .unwrap();

        assert_eq!(
            plan.predecessors("docs"),
            vec![(&Identity::from("api"), EdgeKind::OutputOverlap)]
        );
    }

    #[test]
    fn test_topological_ties_follow_declaration() {
        let plan = plan(
            vec![
                item("c"),
                item("b"),
                item("a"),
                item("all").depends_on("a").depends_on("b").depends_on("c"),
            ],
            &["all"],
        )
        .unwrap();

        assert_eq!(plan.topological_order(), ids(&["c", "b", "a", "all"]));
    }

    #[test]
    fn test_readiness() {
        let plan = plan(
            vec![item("a"), item("b").depends_on("a"), item("c")],
            &["b", "c"],
        )
        .unwrap();

        let ready = plan.readiness(|_| NodeState::Pending);
        assert_eq!(ready, ids(&["a", "c"]));

        let ready = plan.readiness(|id| match id.as_str() {
            "a" => NodeState::Failed,
            _ => NodeState::Pending,
        });
        assert_eq!(ready, ids(&["b", "c"]));
    }

    #[test]
    fn test_mermaid_rendering() {
        let plan = plan(
            vec![item("a"), item("b").depends_on("a").finalized_by("c"), item("c")],
            &["b"],
        )
        .unwrap();

        let text = plan.to_string();
        assert!(text.starts_with("graph LR\n"));
        assert!(text.contains("0[\"a\"]"));
        assert!(text.contains("0 --> 1"));
        assert!(text.contains("1 -- \"finalizer\" --> 2"));
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::config::FailureMode;
use crate::engine::tokens::ResourceTokens;
use crate::item::WorkItem;
use crate::outcome::{BuildResult, Listener, NodeOutcome, NodeState, OutcomeTracker};
use crate::plan::EdgeKind;

/// Scheduling state of a single build, owned by the coordinating thread.
pub(super) struct Schedule<'p> {
    graph: &'p DiGraph<Arc<WorkItem>, EdgeKind>,
    tracker: OutcomeTracker,
    /// Predecessor edges that have not reached a terminal state yet.
    pending: Vec<usize>,
    /// A dependency failed, the node will never run.
    doomed: Vec<bool>,
    dispatched: Vec<bool>,
    ready: BTreeSet<usize>,
    tokens: ResourceTokens,
    mode: FailureMode,
    stopped: bool,
    progress: Span,
}

impl<'p> Schedule<'p> {
    pub(super) fn new(
        graph: &'p DiGraph<Arc<WorkItem>, EdgeKind>,
        listeners: Vec<Arc<dyn Listener>>,
        mode: FailureMode,
        progress: Span,
    ) -> Self {
        let count = graph.node_count();
        let identities = graph.node_indices().map(|n| graph[n].identity.clone());
        let mut tracker = OutcomeTracker::new(identities, listeners);

        let pending: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.edges_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready = BTreeSet::new();
        for (node, &count) in pending.iter().enumerate() {
            if count == 0 {
                tracker.set_state(node, NodeState::Ready);
                ready.insert(node);
            }
        }

        Self {
            graph,
            tracker,
            pending,
            doomed: vec![false; count],
            dispatched: vec![false; count],
            ready,
            tokens: ResourceTokens::default(),
            mode,
            stopped: false,
            progress,
        }
    }

    pub(super) fn item(&self, node: usize) -> &Arc<WorkItem> {
        &self.graph[NodeIndex::new(node)]
    }

    /// Whether the build stopped dispatching because of a failure.
    pub(super) fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// After a fail-fast stop only finalizers of items that already ran may
    /// still be dispatched.
    fn may_dispatch(&self, node: usize) -> bool {
        !self.stopped
            || self
                .graph
                .edges_directed(NodeIndex::new(node), Direction::Incoming)
                .any(|edge| {
                    *edge.weight() == EdgeKind::Finalizer && self.dispatched[edge.source().index()]
                })
    }

    /// Takes the first ready node, in declaration order, whose resource
    /// groups are all free. Nodes waiting for a token stay ready.
    pub(super) fn next(&mut self) -> Option<usize> {
        let mut chosen = None;
        for node in self.ready.iter().copied() {
            if !self.may_dispatch(node) {
                continue;
            }
            let groups = self.graph[NodeIndex::new(node)].resource_groups();
            if self.tokens.try_acquire(groups) {
                chosen = Some(node);
                break;
            }
        }

        let node = chosen?;
        self.ready.remove(&node);
        self.dispatched[node] = true;
        self.tracker.record_start(node);
        Some(node)
    }

    /// Records the outcome of a dispatched node and releases its successors.
    pub(super) fn complete(&mut self, node: usize, outcome: NodeOutcome) {
        let item = self.graph[NodeIndex::new(node)].clone();
        self.tokens.release(item.resource_groups());

        if outcome.state() == NodeState::Failed && self.mode == FailureMode::FailFast {
            self.stopped = true;
        }

        self.finish_node(node, outcome);
    }

    fn finish_node(&mut self, node: usize, outcome: NodeOutcome) {
        self.tracker.record_finish(node, outcome);
        self.progress.pb_inc(1);

        let mut work = vec![node];
        while let Some(done) = work.pop() {
            let failed = self.tracker.state(done).is_failure();
            let successors: Vec<(usize, EdgeKind)> = self
                .graph
                .edges_directed(NodeIndex::new(done), Direction::Outgoing)
                .map(|edge| (edge.target().index(), *edge.weight()))
                .collect();

            for (successor, kind) in successors {
                if failed && kind.propagates_failure() {
                    self.doomed[successor] = true;
                }

                self.pending[successor] -= 1;
                if self.pending[successor] > 0 {
                    continue;
                }

                if self.doomed[successor] {
                    self.tracker.record_finish(successor, NodeOutcome::NotExecuted);
                    self.progress.pb_inc(1);
                    work.push(successor);
                } else {
                    self.tracker.set_state(successor, NodeState::Ready);
                    self.ready.insert(successor);
                }
            }
        }
    }

    /// Closes the build. Unless it was cancelled, nodes that never got to run
    /// are marked as not executed.
    pub(super) fn finish(mut self, cancelled: bool) -> BuildResult {
        if !cancelled {
            for node in 0..self.graph.node_count() {
                if !self.tracker.state(node).is_terminal() {
                    self.tracker.record_finish(node, NodeOutcome::NotExecuted);
                }
            }
        }
        self.tracker.finish(cancelled)
    }
}

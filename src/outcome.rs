use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use console::Style;

use crate::core::Identity;

const ANSI_GREEN: Style = Style::new().green();
const ANSI_RED: Style = Style::new().red();
const ANSI_YELLOW: Style = Style::new().yellow();

/// Where a node is in its lifecycle during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Ready,
    Executing,
    Skipped,
    UpToDate,
    FromCache,
    Succeeded,
    Failed,
    NotExecutedDueToFailure,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Ready | NodeState::Executing)
    }

    /// Whether dependents of a node in this state must not run.
    pub fn is_failure(self) -> bool {
        matches!(self, NodeState::Failed | NodeState::NotExecutedDueToFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// All inputs resolved to nothing.
    NoSource,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::NoSource => f.write_str("no source"),
        }
    }
}

/// A failure message with its chain of causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub message: String,
    pub causes: Vec<String>,
}

impl FailureDetail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl From<&anyhow::Error> for FailureDetail {
    fn from(error: &anyhow::Error) -> Self {
        let mut chain = error.chain().map(ToString::to_string);
        Self {
            message: chain.next().unwrap_or_default(),
            causes: chain.collect(),
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

/// How a node ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Succeeded,
    UpToDate,
    FromCache,
    Skipped(SkipReason),
    Failed(FailureDetail),
    NotExecuted,
}

impl NodeOutcome {
    pub fn state(&self) -> NodeState {
        match self {
            NodeOutcome::Succeeded => NodeState::Succeeded,
            NodeOutcome::UpToDate => NodeState::UpToDate,
            NodeOutcome::FromCache => NodeState::FromCache,
            NodeOutcome::Skipped(_) => NodeState::Skipped,
            NodeOutcome::Failed(_) => NodeState::Failed,
            NodeOutcome::NotExecuted => NodeState::NotExecutedDueToFailure,
        }
    }
}

/// Observer notified around every dispatched node.
///
/// Listeners are called synchronously on the coordinating thread, in the order
/// they were registered. Nodes that were never dispatched are not reported.
pub trait Listener: Send + Sync {
    fn before_execute(&self, _identity: &Identity) {}

    fn after_execute(&self, _identity: &Identity, _outcome: &NodeOutcome) {}
}

/// Wall-clock timing of a dispatched node.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub start: Instant,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub identity: Identity,
    pub state: NodeState,
    pub outcome: Option<NodeOutcome>,
    pub timing: Option<Timing>,
}

/// Records what happens to every node of a plan and notifies listeners.
pub struct OutcomeTracker {
    listeners: Vec<Arc<dyn Listener>>,
    reports: Vec<NodeReport>,
    started: Vec<Option<Instant>>,
}

impl OutcomeTracker {
    pub fn new(
        identities: impl IntoIterator<Item = Identity>,
        listeners: Vec<Arc<dyn Listener>>,
    ) -> Self {
        let reports: Vec<NodeReport> = identities
            .into_iter()
            .map(|identity| NodeReport {
                identity,
                state: NodeState::Pending,
                outcome: None,
                timing: None,
            })
            .collect();

        let started = vec![None; reports.len()];
        Self {
            listeners,
            reports,
            started,
        }
    }

    pub fn state(&self, node: usize) -> NodeState {
        self.reports[node].state
    }

    pub fn identity(&self, node: usize) -> &Identity {
        &self.reports[node].identity
    }

    pub(crate) fn set_state(&mut self, node: usize, state: NodeState) {
        self.reports[node].state = state;
    }

    /// Marks a node as dispatched and calls `before_execute`.
    pub fn record_start(&mut self, node: usize) {
        self.started[node] = Some(Instant::now());
        self.reports[node].state = NodeState::Executing;

        let identity = &self.reports[node].identity;
        for listener in &self.listeners {
            listener.before_execute(identity);
        }
    }

    /// Stores the outcome of a node. Listeners are only told about nodes that
    /// went through [`OutcomeTracker::record_start`].
    pub fn record_finish(&mut self, node: usize, outcome: NodeOutcome) {
        let report = &mut self.reports[node];
        report.state = outcome.state();

        if let Some(start) = self.started[node].take() {
            report.timing = Some(Timing {
                start,
                duration: start.elapsed(),
            });
            for listener in &self.listeners {
                listener.after_execute(&report.identity, &outcome);
            }
        }

        report.outcome = Some(outcome);
    }

    pub fn finish(self, cancelled: bool) -> BuildResult {
        let mut result = BuildResult {
            status: BuildStatus::Success,
            succeeded: 0,
            up_to_date: 0,
            from_cache: 0,
            failed: 0,
            skipped: 0,
            not_executed: 0,
            failures: Vec::new(),
            nodes: Vec::with_capacity(self.reports.len()),
        };

        for report in self.reports {
            match &report.outcome {
                Some(NodeOutcome::Succeeded) => result.succeeded += 1,
                Some(NodeOutcome::UpToDate) => result.up_to_date += 1,
                Some(NodeOutcome::FromCache) => result.from_cache += 1,
                Some(NodeOutcome::Skipped(_)) => result.skipped += 1,
                Some(NodeOutcome::NotExecuted) => result.not_executed += 1,
                Some(NodeOutcome::Failed(detail)) => {
                    result.failed += 1;
                    result.failures.push((report.identity.clone(), detail.clone()));
                }
                None => {}
            }
            result.nodes.push(report);
        }

        result.status = match (cancelled, result.failed) {
            (true, _) => BuildStatus::Cancelled,
            (false, 0) => BuildStatus::Success,
            (false, _) => BuildStatus::Failed,
        };

        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    Failed,
    Cancelled,
}

/// Aggregate result of one build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub succeeded: usize,
    pub up_to_date: usize,
    pub from_cache: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_executed: usize,
    /// Failed nodes in declaration order.
    pub failures: Vec<(Identity, FailureDetail)>,
    /// Every node of the plan in declaration order.
    pub nodes: Vec<NodeReport>,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }

    /// Process exit code for a command line front end: `0` on success, the
    /// number of failed items (at most 255) on failure and `130` for a build
    /// that was cancelled without failures.
    pub fn exit_code(&self) -> i32 {
        match (self.status, self.failed) {
            (BuildStatus::Success, _) => 0,
            (BuildStatus::Cancelled, 0) => 130,
            (_, failed) => failed.clamp(1, 255) as i32,
        }
    }

    pub fn state_of(&self, identity: &str) -> Option<NodeState> {
        self.nodes
            .iter()
            .find(|report| report.identity.as_str() == identity)
            .map(|report| report.state)
    }

    pub fn report(&self, identity: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|report| report.identity.as_str() == identity)
    }

    /// The one-line summary with the status colored for a terminal.
    pub fn styled(&self) -> impl fmt::Display {
        let (style, label) = match self.status {
            BuildStatus::Success => (ANSI_GREEN, "BUILD SUCCESSFUL"),
            BuildStatus::Failed => (ANSI_RED, "BUILD FAILED"),
            BuildStatus::Cancelled => (ANSI_YELLOW, "BUILD CANCELLED"),
        };
        format!("{} {}", style.apply_to(label), Counts(self))
    }
}

struct Counts<'a>(&'a BuildResult);

impl fmt::Display for Counts<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.0;
        write!(
            f,
            "({} executed, {} up-to-date, {} from cache, {} skipped, {} failed, {} not executed)",
            r.succeeded, r.up_to_date, r.from_cache, r.skipped, r.failed, r.not_executed
        )
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.status {
            BuildStatus::Success => "BUILD SUCCESSFUL",
            BuildStatus::Failed => "BUILD FAILED",
            BuildStatus::Cancelled => "BUILD CANCELLED",
        };
        write!(f, "{label} {}", Counts(self))
    }
}

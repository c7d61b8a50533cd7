use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::core::{ArcStr, Blake3Hasher, Hash32, Identity};
use crate::fingerprint::{DirectorySensitivity, HashStrategy, Sensitivity};

/// Resource group shared by every item marked as not parallel.
pub(crate) const NOT_PARALLEL_GROUP: &str = "\0not-parallel";

/// A declared input root together with how its contents are normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputSpec {
    pub path: Utf8PathBuf,
    pub sensitivity: Sensitivity,
}

/// Whether a declared output is a single file or a whole directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputKind {
    File,
    Directory,
}

/// A path the work item is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputSpec {
    pub path: Utf8PathBuf,
    pub kind: OutputKind,
}

/// The context passed to every action invocation.
///
/// `ActionContext` gives the action read access to the declaration of the
/// work item it belongs to. It is immutable during execution.
pub struct ActionContext<'a> {
    /// Identity of the work item being executed.
    pub identity: &'a Identity,
    /// Declared input roots.
    pub inputs: &'a [InputSpec],
    /// Declared outputs, the action is expected to write these.
    pub outputs: &'a [OutputSpec],
    /// Tracing span assigned to this execution.
    pub(crate) span: tracing::Span,
}

impl ActionContext<'_> {
    /// Span of the running work item, useful for attaching child spans.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// The unit of behavior of a work item.
///
/// The scheduler does not care what an action does, it only invokes
/// [`Action::execute`] once it has decided the item is not up to date.
/// Closures of the shape `Fn(&ActionContext) -> anyhow::Result<()>` implement
/// this trait.
pub trait Action: Send + Sync {
    fn execute(&self, context: &ActionContext<'_>) -> anyhow::Result<()>;

    /// Identity of the implementation. When it changes, every previous
    /// execution record of items using this action is stale.
    ///
    /// The default is derived from the concrete type name, which is stable
    /// for a given build of the program.
    fn implementation(&self) -> Hash32 {
        Hash32::hash(type_name::<Self>())
    }
}

impl<F> Action for F
where
    F: Fn(&ActionContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, context: &ActionContext<'_>) -> anyhow::Result<()> {
        self(context)
    }
}

/// A single schedulable unit of build work.
///
/// Work items are created once per build through [`WorkItem::builder`] and are
/// immutable afterwards.
pub struct WorkItem {
    pub(crate) identity: Identity,
    pub(crate) inputs: Vec<InputSpec>,
    pub(crate) directories: DirectorySensitivity,
    pub(crate) strategy: HashStrategy,
    pub(crate) outputs: Vec<OutputSpec>,
    pub(crate) action: Arc<dyn Action>,
    pub(crate) action_identity: Hash32,
    pub(crate) dependencies: Vec<Identity>,
    pub(crate) must_run_after: Vec<Identity>,
    pub(crate) should_run_after: Vec<Identity>,
    pub(crate) finalized_by: Vec<Identity>,
    pub(crate) groups: Vec<ArcStr>,
    pub(crate) enabled: bool,
    pub(crate) skip_when_empty: bool,
    pub(crate) cacheable: bool,
}

impl WorkItem {
    /// Starts declaring a work item with the given identity and action.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kasane::{ActionContext, Sensitivity, WorkItem};
    ///
    /// fn compile(_: &ActionContext) -> anyhow::Result<()> {
    ///     Ok(())
    /// }
    ///
    /// let item = WorkItem::builder("compile", compile)
    ///     .input("src", Sensitivity::Relative)
    ///     .output_dir("out")
    ///     .build();
    ///
    /// assert_eq!(item.identity().as_str(), "compile");
    /// ```
    pub fn builder(
        identity: impl Into<Identity>,
        action: impl Action + 'static,
    ) -> WorkItemBuilder {
        WorkItemBuilder::new(identity.into(), Arc::new(action))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn dependencies(&self) -> &[Identity] {
        &self.dependencies
    }

    pub fn action_identity(&self) -> Hash32 {
        self.action_identity
    }

    pub fn directory_sensitivity(&self) -> DirectorySensitivity {
        self.directories
    }

    pub fn hash_strategy(&self) -> HashStrategy {
        self.strategy
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Every resource group this item must hold while executing.
    pub(crate) fn resource_groups(&self) -> &[ArcStr] {
        &self.groups
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("identity", &self.identity)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("action_identity", &self.action_identity)
            .field("dependencies", &self.dependencies)
            .field("must_run_after", &self.must_run_after)
            .field("should_run_after", &self.should_run_after)
            .field("finalized_by", &self.finalized_by)
            .finish_non_exhaustive()
    }
}

pub struct WorkItemBuilder {
    identity: Identity,
    action: Arc<dyn Action>,
    salts: Vec<String>,
    inputs: Vec<InputSpec>,
    directories: DirectorySensitivity,
    strategy: HashStrategy,
    outputs: Vec<OutputSpec>,
    dependencies: Vec<Identity>,
    must_run_after: Vec<Identity>,
    should_run_after: Vec<Identity>,
    finalized_by: Vec<Identity>,
    groups: Vec<ArcStr>,
    parallel: bool,
    enabled: bool,
    skip_when_empty: bool,
    cacheable: bool,
}

impl WorkItemBuilder {
    fn new(identity: Identity, action: Arc<dyn Action>) -> Self {
        Self {
            identity,
            action,
            salts: Vec::new(),
            inputs: Vec::new(),
            directories: DirectorySensitivity::Default,
            strategy: HashStrategy::Sort,
            outputs: Vec::new(),
            dependencies: Vec::new(),
            must_run_after: Vec::new(),
            should_run_after: Vec::new(),
            finalized_by: Vec::new(),
            groups: Vec::new(),
            parallel: true,
            enabled: true,
            skip_when_empty: false,
            cacheable: false,
        }
    }

    pub fn input(mut self, path: impl Into<Utf8PathBuf>, sensitivity: Sensitivity) -> Self {
        self.inputs.push(InputSpec {
            path: path.into(),
            sensitivity,
        });
        self
    }

    pub fn directory_sensitivity(mut self, directories: DirectorySensitivity) -> Self {
        self.directories = directories;
        self
    }

    /// How input entries are combined into a single hash. Use
    /// [`HashStrategy::Append`] when the order of the inputs is meaningful.
    pub fn hash_strategy(mut self, strategy: HashStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn output_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(OutputSpec {
            path: path.into(),
            kind: OutputKind::File,
        });
        self
    }

    pub fn output_dir(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.outputs.push(OutputSpec {
            path: path.into(),
            kind: OutputKind::Directory,
        });
        self
    }

    pub fn depends_on(mut self, identity: impl Into<Identity>) -> Self {
        self.dependencies.push(identity.into());
        self
    }

    pub fn must_run_after(mut self, identity: impl Into<Identity>) -> Self {
        self.must_run_after.push(identity.into());
        self
    }

    pub fn should_run_after(mut self, identity: impl Into<Identity>) -> Self {
        self.should_run_after.push(identity.into());
        self
    }

    pub fn finalized_by(mut self, identity: impl Into<Identity>) -> Self {
        self.finalized_by.push(identity.into());
        self
    }

    /// Places the item in a named resource group. Items sharing a group are
    /// never executed at the same time.
    pub fn exclusive(mut self, group: impl AsRef<str>) -> Self {
        self.groups.push(ArcStr::from(group.as_ref()));
        self
    }

    /// Never run this item concurrently with another not-parallel item.
    pub fn not_parallel(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Skip the item entirely when its inputs resolve to nothing.
    pub fn skip_when_empty(mut self) -> Self {
        self.skip_when_empty = true;
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Mixes extra data into the action identity, e.g. a tool version.
    pub fn action_salt(mut self, salt: impl Into<String>) -> Self {
        self.salts.push(salt.into());
        self
    }

    pub fn build(self) -> WorkItem {
        let mut hasher = Blake3Hasher::default();
        hasher.update(self.action.implementation().as_bytes());
        for salt in &self.salts {
            hasher.update(&(salt.len() as u64).to_le_bytes());
            hasher.update(salt.as_bytes());
        }

        let mut groups = self.groups;
        if !self.parallel {
            groups.push(ArcStr::from(NOT_PARALLEL_GROUP));
        }
        groups.sort();
        groups.dedup();

        WorkItem {
            identity: self.identity,
            inputs: self.inputs,
            directories: self.directories,
            strategy: self.strategy,
            outputs: self.outputs,
            action: self.action,
            action_identity: hasher.into(),
            dependencies: self.dependencies,
            must_run_after: self.must_run_after,
            should_run_after: self.should_run_after,
            finalized_by: self.finalized_by,
            groups,
            enabled: self.enabled,
            skip_when_empty: self.skip_when_empty,
            cacheable: self.cacheable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &ActionContext) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn test_salt_changes_action_identity() {
        let a = WorkItem::builder("a", noop).build();
        let b = WorkItem::builder("b", noop).build();
        let c = WorkItem::builder("c", noop).action_salt("v2").build();

        assert_eq!(a.action_identity(), b.action_identity());
        assert_ne!(a.action_identity(), c.action_identity());
    }

    #[test]
    fn test_different_actions_differ() {
        struct Copy;

        impl Action for Copy {
            fn execute(&self, _: &ActionContext<'_>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let a = WorkItem::builder("a", noop).build();
        let b = WorkItem::builder("a", Copy).build();
        assert_ne!(a.action_identity(), b.action_identity());
    }

    #[test]
    fn test_not_parallel_adds_reserved_group() {
        let item = WorkItem::builder("a", noop)
            .exclusive("db")
            .exclusive("db")
            .not_parallel()
            .build();

        let groups: Vec<&str> = item.resource_groups().iter().map(|g| &**g).collect();
        assert_eq!(groups, vec![NOT_PARALLEL_GROUP, "db"]);
    }
}

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{Span, debug, info, warn};

use crate::cache::{BuildCache, cache_key};
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::item::{ActionContext, WorkItem};
use crate::outcome::{FailureDetail, NodeOutcome, SkipReason};
use crate::store::{FingerprintRecord, FingerprintStore, InvalidationReason, Verdict, decide};

/// Everything a worker needs to bring a single node to a terminal state.
pub(super) struct Worker<'a> {
    pub(super) fingerprinter: &'a Fingerprinter,
    pub(super) store: &'a FingerprintStore,
    pub(super) cache: Option<&'a dyn BuildCache>,
}

impl Worker<'_> {
    pub(super) fn run(&self, item: &WorkItem, span: Span) -> NodeOutcome {
        if !item.enabled {
            debug!(item = %item.identity, "skipping, item is disabled");
            return NodeOutcome::Skipped(SkipReason::Disabled);
        }

        let inputs = match self
            .fingerprinter
            .fingerprint(&item.inputs, item.directories, item.strategy)
        {
            Ok(inputs) => inputs,
            Err(e) => {
                let error = anyhow::Error::new(e).context("Couldn't fingerprint inputs");
                return NodeOutcome::Failed(FailureDetail::from(&error));
            }
        };

        if item.skip_when_empty && inputs.is_empty() {
            debug!(item = %item.identity, "skipping, no source");
            return NodeOutcome::Skipped(SkipReason::NoSource);
        }

        let previous = self.store.load(&item.identity);
        let verdict = match self.fingerprinter.fingerprint_outputs(&item.outputs) {
            Ok(outputs) => decide(previous.as_ref(), item.action_identity, &inputs, &outputs),
            Err(e) => {
                warn!(item = %item.identity, "couldn't fingerprint outputs: {e}");
                Verdict::Stale(InvalidationReason::NoHistory)
            }
        };

        match verdict {
            Verdict::UpToDate => {
                debug!(item = %item.identity, "up to date");
                return NodeOutcome::UpToDate;
            }
            Verdict::Stale(reason) => {
                debug!(item = %item.identity, "not up to date, {reason}");
            }
        }

        if item.cacheable
            && let Some(cache) = self.cache
            && self.restore(cache, item, &inputs)
        {
            return NodeOutcome::FromCache;
        }

        self.execute(item, inputs, span)
    }

    /// Pulls outputs from the build cache and records them as if the action
    /// had produced them.
    fn restore(&self, cache: &dyn BuildCache, item: &WorkItem, inputs: &Fingerprint) -> bool {
        let key = cache_key(item, inputs);

        let recorded = match cache.load(key, &item.outputs) {
            Ok(Some(recorded)) => recorded,
            Ok(None) => return false,
            Err(e) => {
                warn!(item = %item.identity, key = %key.short(), "discarding cache entry: {e}");
                return false;
            }
        };

        let outputs = match self.fingerprinter.fingerprint_outputs(&item.outputs) {
            Ok(outputs) if outputs.combined() == recorded.combined() => outputs,
            Ok(_) => {
                warn!(
                    item = %item.identity,
                    key = %key.short(),
                    "restored outputs don't match the cache manifest"
                );
                if let Err(e) = cache.remove(key) {
                    warn!(item = %item.identity, "couldn't remove cache entry: {e}");
                }
                return false;
            }
            Err(e) => {
                warn!(item = %item.identity, "couldn't fingerprint restored outputs: {e}");
                return false;
            }
        };

        info!(item = %item.identity, key = %key.short(), "loaded from cache");
        self.save(item, inputs.clone(), outputs);
        true
    }

    fn execute(&self, item: &WorkItem, inputs: Fingerprint, span: Span) -> NodeOutcome {
        info!(item = %item.identity, "executing");

        let context = ActionContext {
            identity: &item.identity,
            inputs: &item.inputs,
            outputs: &item.outputs,
            span,
        };

        let result = match catch_unwind(AssertUnwindSafe(|| item.action.execute(&context))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Action panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Action panicked: {s}")
                } else {
                    String::from("Action panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        };

        if let Err(error) = result {
            if let Err(e) = self.store.invalidate(&item.identity) {
                warn!(item = %item.identity, "couldn't invalidate fingerprint record: {e}");
            }
            return NodeOutcome::Failed(FailureDetail::from(&error));
        }

        let outputs = match self.fingerprinter.fingerprint_outputs(&item.outputs) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(
                    item = %item.identity,
                    "couldn't fingerprint outputs, the item will run again: {e}"
                );
                if let Err(e) = self.store.invalidate(&item.identity) {
                    warn!(item = %item.identity, "couldn't invalidate fingerprint record: {e}");
                }
                return NodeOutcome::Succeeded;
            }
        };

        if item.cacheable
            && let Some(cache) = self.cache
        {
            let key = cache_key(item, &inputs);
            if let Err(e) = cache.store(key, &item.outputs, &outputs) {
                warn!(
                    item = %item.identity,
                    key = %key.short(),
                    "couldn't store outputs in the cache: {e}"
                );
            }
        }

        self.save(item, inputs, outputs);
        NodeOutcome::Succeeded
    }

    fn save(&self, item: &WorkItem, inputs: Fingerprint, outputs: Fingerprint) {
        let record = FingerprintRecord {
            action_identity: item.action_identity,
            inputs,
            outputs,
        };

        if let Err(e) = self.store.save(&item.identity, &record) {
            warn!(item = %item.identity, "couldn't save fingerprint record: {e}");
        }
    }
}

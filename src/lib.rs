#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod core;
mod engine;
mod error;
pub mod expiry;
pub mod fingerprint;
mod item;
#[cfg(feature = "logging")]
pub mod logging;
mod outcome;
mod plan;
pub mod store;
mod utils;

pub use crate::cache::{BuildCache, LocalBuildCache, cache_key};
pub use crate::config::{EngineConfig, FailureMode};
pub use crate::core::{Hash32, Identity};
pub use crate::engine::{CancellationToken, Engine};
pub use crate::error::*;
pub use crate::fingerprint::{
    DirectorySensitivity, EntryFingerprint, FileKind, Fingerprint, FingerprintDiff, Fingerprinter,
    HashStrategy, Sensitivity,
};
pub use crate::item::{
    Action, ActionContext, InputSpec, OutputKind, OutputSpec, WorkItem, WorkItemBuilder,
};
pub use crate::outcome::{
    BuildResult, BuildStatus, FailureDetail, Listener, NodeOutcome, NodeReport, NodeState,
    OutcomeTracker, SkipReason, Timing,
};
pub use crate::plan::{EdgeKind, ExecutionPlan, PlanBuilder};
pub use crate::store::{FingerprintRecord, FingerprintStore, InvalidationReason, Verdict};

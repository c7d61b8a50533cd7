use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::core::Identity;

/// The plan contains a cycle. The chain starts and ends with the same
/// identity, e.g. `[a, b, c, a]`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CycleError {
    pub chain: Vec<Identity>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Circular dependency between the following work items:")?;
        for (i, identity) in self.chain.iter().enumerate() {
            if i == 0 {
                write!(f, "\n  {identity}")?;
            } else {
                write!(f, "\n  \\--> {identity}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Work item '{missing}' referenced by '{referrer}' was never declared")]
    UnknownItem { missing: Identity, referrer: Identity },

    #[error("Requested work item '{0}' was never declared")]
    UnknownRequest(Identity),

    #[error("Work item '{0}' was declared more than once")]
    DuplicateItem(Identity),
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Couldn't read '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't walk '{root}'.\n{source}")]
    Walk {
        root: Utf8PathBuf,
        source: walkdir::Error,
    },

    #[error("Path is not valid UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Couldn't compile exclude pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't persist record.\n{0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Record has an unknown header")]
    BadMagic,

    #[error("Record format version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },

    #[error("Record belongs to '{found}', not '{expected}'")]
    IdentityMismatch { found: Identity, expected: Identity },

    #[error("Couldn't decode record.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode record.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Cache entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Couldn't encode cache manifest.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {name}: {reason}")]
    Env {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_lists_chain() {
        let err = CycleError {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        let text = err.to_string();
        assert!(text.contains("  a\n  \\--> b\n  \\--> a"));
    }
}

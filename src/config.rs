use std::fs;
use std::num::NonZeroUsize;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fingerprint::DEFAULT_EXCLUDES;

/// What happens to the rest of the build after a work item fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Stop dispatching new work after the first failure.
    #[default]
    FailFast,
    /// Keep building everything that does not depend on a failure.
    Continue,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(FailureMode::FailFast),
            "continue" => Ok(FailureMode::Continue),
            other => Err(format!("expected 'fail-fast' or 'continue', got '{other}'")),
        }
    }
}

/// Engine settings.
///
/// Every field has a default, so a partial JSON document or an empty
/// environment both produce a usable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on the number of actions running at once.
    pub max_parallelism: usize,
    pub failure_mode: FailureMode,
    /// Directory holding fingerprint records and the local build cache.
    pub cache_dir: Utf8PathBuf,
    /// Whether cacheable work items may use the local build cache.
    pub build_cache: bool,
    /// File name patterns skipped while fingerprinting.
    pub excludes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            failure_mode: FailureMode::default(),
            cache_dir: Utf8PathBuf::from(".kasane"),
            build_cache: false,
            excludes: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    pub const ENV_MAX_PARALLELISM: &'static str = "KASANE_MAX_PARALLELISM";
    pub const ENV_FAILURE_MODE: &'static str = "KASANE_FAILURE_MODE";
    pub const ENV_CACHE_DIR: &'static str = "KASANE_CACHE_DIR";
    pub const ENV_BUILD_CACHE: &'static str = "KASANE_BUILD_CACHE";

    /// Defaults overridden by `KASANE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_vars(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up through `lookup`.
    pub fn with_vars(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(Self::ENV_MAX_PARALLELISM) {
            self.max_parallelism = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                Ok(_) => {
                    return Err(invalid(Self::ENV_MAX_PARALLELISM, value, "must be at least 1"));
                }
                Err(e) => return Err(invalid(Self::ENV_MAX_PARALLELISM, value, e)),
            };
        }

        if let Some(value) = lookup(Self::ENV_FAILURE_MODE) {
            self.failure_mode = value
                .parse()
                .map_err(|e| invalid(Self::ENV_FAILURE_MODE, value.clone(), e))?;
        }

        if let Some(value) = lookup(Self::ENV_CACHE_DIR) {
            self.cache_dir = Utf8PathBuf::from(value);
        }

        if let Some(value) = lookup(Self::ENV_BUILD_CACHE) {
            self.build_cache = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(Self::ENV_BUILD_CACHE, value, "expected a boolean")),
            };
        }

        Ok(self)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validated()
    }

    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path.as_ref())?;
        Self::from_json(&json)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.max_parallelism == 0 {
            return Err(invalid("max_parallelism", "0".into(), "must be at least 1"));
        }
        Ok(self)
    }

    /// Directory of the local build cache.
    pub fn build_cache_dir(&self) -> Utf8PathBuf {
        self.cache_dir.join("build-cache")
    }
}

fn invalid(name: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError::Env {
        name,
        value,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_parallelism >= 1);
        assert_eq!(config.failure_mode, FailureMode::FailFast);
        assert_eq!(config.cache_dir, ".kasane");
        assert!(config.excludes.iter().any(|e| e == ".git"));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default()
            .with_vars(vars(&[
                ("KASANE_MAX_PARALLELISM", "3"),
                ("KASANE_FAILURE_MODE", "continue"),
                ("KASANE_CACHE_DIR", "/tmp/cache"),
                ("KASANE_BUILD_CACHE", "true"),
            ]))
            .unwrap();

        assert_eq!(config.max_parallelism, 3);
        assert_eq!(config.failure_mode, FailureMode::Continue);
        assert_eq!(config.cache_dir, "/tmp/cache");
        assert!(config.build_cache);
        assert_eq!(config.build_cache_dir(), "/tmp/cache/build-cache");
    }

    #[test]
    fn test_invalid_env_values() {
        for (name, value) in [
            ("KASANE_MAX_PARALLELISM", "0"),
            ("KASANE_MAX_PARALLELISM", "many"),
            ("KASANE_FAILURE_MODE", "sometimes"),
            ("KASANE_BUILD_CACHE", "maybe"),
        ] {
            let result = EngineConfig::default().with_vars(vars(&[(name, value)]));
            assert!(matches!(result, Err(ConfigError::Env { .. })), "{name}={value}");
        }
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{ "failure_mode": "continue", "max_parallelism": 2 }"#;
        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.failure_mode, FailureMode::Continue);
        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.cache_dir, ".kasane");

        assert!(EngineConfig::from_json(r#"{ "max_parallelism": 0 }"#).is_err());
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Json(_))));
    }
}

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the retention settings, ten years.
const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 3600;

const BACKENDS: &[&str] = &["fs", "mock"];

/// Engine settings, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// State directory holding the document, locks and mount tree.
    pub root: PathBuf,
    /// Period of the Ensure tick in the run loop.
    pub ensure_interval_ms: u64,
    /// Retry delay used when a handler asks for a retry without one.
    pub retry_backoff_ms: u64,
    /// How long ready changes are kept.
    pub prune_after_secs: u64,
    /// Age after which a change that never finishes is aborted.
    pub abort_after_secs: u64,
    /// Cap on the number of ready changes kept.
    pub max_ready_changes: usize,
    /// System backend: "fs" or "mock".
    pub backend: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            ensure_interval_ms: 5000,
            retry_backoff_ms: 1000,
            prune_after_secs: 24 * 3600,
            abort_after_secs: 7 * 24 * 3600,
            max_ready_changes: 500,
            backend: "fs".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Defaults rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !BACKENDS.contains(&self.backend.as_str()) {
            return Err(CoreError::Config(format!(
                "unknown backend '{}', expected one of: {}",
                self.backend,
                BACKENDS.join(", ")
            )));
        }
        if self.ensure_interval_ms == 0 {
            return Err(CoreError::Config(
                "ensure_interval_ms must be greater than zero".to_owned(),
            ));
        }
        for (name, value) in [
            ("prune_after_secs", self.prune_after_secs),
            ("abort_after_secs", self.abort_after_secs),
        ] {
            if value > MAX_RETENTION_SECS {
                return Err(CoreError::Config(format!(
                    "{name} must not exceed {MAX_RETENTION_SECS}"
                )));
            }
        }
        Ok(())
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_millis(self.ensure_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn prune_after(&self) -> chrono::Duration {
        retention(self.prune_after_secs)
    }

    pub fn abort_after(&self) -> chrono::Duration {
        retention(self.abort_after_secs)
    }
}

fn retention(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_RETENTION_SECS)).unwrap_or(0);
    chrono::Duration::seconds(secs)
}

fn default_root() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/overseer")
    } else {
        PathBuf::from("/tmp/overseer")
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Executor tuning. Every key is optional in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Only deliver a callback point again when its value changed.
    #[serde(default = "default_dedupe_results")]
    pub dedupe_results: bool,
    /// Upper bound on child executors spawned by one combinator call.
    #[serde(default = "default_max_fan_out")]
    pub max_fan_out: usize,
    #[serde(default = "default_unregister_on_drop")]
    pub unregister_on_drop: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dedupe_results: default_dedupe_results(),
            max_fan_out: default_max_fan_out(),
            unregister_on_drop: default_unregister_on_drop(),
        }
    }
}

fn default_dedupe_results() -> bool {
    true
}

fn default_max_fan_out() -> usize {
    100_000
}

fn default_unregister_on_drop() -> bool {
    true
}

impl ExecutorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        toml::from_str(&text)
            .map_err(|err| Error::Config(format!("failed to parse {}: {err}", path.display())))
    }
}

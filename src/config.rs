//! Engine Configuration
//!
//! Engine-wide defaults applied when a workflow or step leaves a setting
//! unspecified. Loadable from YAML:
//!
//! ```yaml
//! default_timeout_secs: 600
//! default_max_retries: 3
//! default_retry_delay_ms: 5000
//! condition_semantics: precedence
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// How lists of execution conditions combine their `logicalOperator`s.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSemantics {
    /// Left fold using the previous condition's operator, no precedence.
    LeftFold,
    /// AND binds tighter than OR, short-circuiting each AND group.
    #[default]
    Precedence,
}

/// Engine-wide defaults.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Execution timeout used when neither the caller nor the workflow sets one
    pub default_timeout_secs: u64,

    /// Retry attempts when neither the step nor its error policy sets one
    pub default_max_retries: u32,

    /// Delay between retries when neither the step nor its error policy sets one
    pub default_retry_delay_ms: u64,

    /// Upper bound on concurrent executions per workflow when the workflow
    /// does not declare one
    pub default_max_concurrent_executions: usize,

    /// Multi-condition combination semantics
    pub condition_semantics: ConditionSemantics,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 3600,
            default_max_retries: 3,
            default_retry_delay_ms: 5000,
            default_max_concurrent_executions: num_cpus::get().max(1) * 4,
            condition_semantics: ConditionSemantics::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file. Missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| EngineError::Parse(e.to_string()))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }
}

//! Runtime configuration for kernel execution.
//!
//! Configuration is JSON-deserializable with every field defaulted, and can be overlaid by
//! `OPCORE_*` environment variables. The process-wide value is resolved once.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::env;
use crate::error::{OpError, Result};

pub use crate::env::EnvOverrides;

const DEFAULT_KERNEL_INSTANCE_CAPACITY: usize = 64;

/// How a kernel instance decides whether to rebuild its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Rebuild only when input descriptors or attributes changed.
    #[default]
    Reuse,
    /// Treat every invocation as a full change.
    AlwaysRebuild,
}

impl CachePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            CachePolicy::Reuse => "reuse",
            CachePolicy::AlwaysRebuild => "rebuild",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = OpError;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("reuse") {
            return Ok(CachePolicy::Reuse);
        }
        if trimmed.eq_ignore_ascii_case("rebuild") || trimmed.eq_ignore_ascii_case("always_rebuild")
        {
            return Ok(CachePolicy::AlwaysRebuild);
        }
        Err(OpError::Config(format!("unknown cache policy: {trimmed}")))
    }
}

impl<'de> Deserialize<'de> for CachePolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for CachePolicy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Skip compute when every output is empty and the kernel allows it.
    pub skip_empty_outputs: bool,
    pub cache_policy: CachePolicy,
    /// Capacity of the interpreter's kernel instance cache.
    pub kernel_instance_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            skip_empty_outputs: true,
            cache_policy: CachePolicy::Reuse,
            kernel_instance_capacity: DEFAULT_KERNEL_INSTANCE_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(raw).map_err(|err| OpError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernel_instance_capacity == 0 {
            return Err(OpError::Config(
                "kernel_instance_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Applies environment overrides on top of `self`.
    pub fn with_overrides(mut self, overrides: &EnvOverrides) -> Result<Self> {
        if let Some(skip) = overrides.skip_empty_outputs {
            self.skip_empty_outputs = skip;
        }
        if let Some(policy) = &overrides.cache_policy {
            self.cache_policy = policy.parse()?;
        }
        if let Some(capacity) = &overrides.kernel_instance_capacity {
            self.kernel_instance_capacity = capacity.trim().parse().map_err(|_| {
                OpError::Config(format!(
                    "invalid {}: {capacity}",
                    env::KERNEL_INSTANCE_CAPACITY
                ))
            })?;
        }
        self.validate()?;
        Ok(self)
    }
}

static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration: defaults overlaid by `OPCORE_*` environment variables.
///
/// Invalid overrides are reported and ignored.
pub fn runtime_config() -> &'static RuntimeConfig {
    RUNTIME_CONFIG.get_or_init(|| {
        RuntimeConfig::default()
            .with_overrides(env::env_overrides())
            .unwrap_or_else(|err| {
                warn!(error = %err, "ignoring invalid OPCORE_* environment overrides");
                RuntimeConfig::default()
            })
    })
}

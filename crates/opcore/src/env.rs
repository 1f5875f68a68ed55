use std::env;
use std::sync::OnceLock;

pub(crate) const SKIP_EMPTY_OUTPUTS: &str = "OPCORE_SKIP_EMPTY_OUTPUTS";
pub(crate) const CACHE_POLICY: &str = "OPCORE_CACHE_POLICY";
pub(crate) const KERNEL_INSTANCE_CAPACITY: &str = "OPCORE_KERNEL_INSTANCE_CAPACITY";

/// Raw environment overrides, read once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub skip_empty_outputs: Option<bool>,
    pub cache_policy: Option<String>,
    pub kernel_instance_capacity: Option<String>,
}

static OPCORE_ENV: OnceLock<EnvOverrides> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn non_empty_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

pub(crate) fn env_overrides() -> &'static EnvOverrides {
    OPCORE_ENV.get_or_init(|| EnvOverrides {
        skip_empty_outputs: non_empty_var(SKIP_EMPTY_OUTPUTS).map(|value| parse_bool(&value)),
        cache_policy: non_empty_var(CACHE_POLICY),
        kernel_instance_capacity: non_empty_var(KERNEL_INSTANCE_CAPACITY),
    })
}

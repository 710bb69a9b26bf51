use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Controller tunables. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Upper bound on one reconcile pass.
    pub reconcile_timeout_secs: u64,
    /// Retry delay after a failed pass.
    pub short_wait_secs: u64,
    /// Steady-state re-poll interval.
    pub long_wait_secs: u64,
    /// Re-poll interval while a data dependency is unsatisfied.
    pub depend_check_wait_secs: u64,
    /// Revisions kept per component.
    pub revision_limit: usize,
    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout_secs: 60,
            short_wait_secs: 30,
            long_wait_secs: 60,
            depend_check_wait_secs: 10,
            revision_limit: 50,
            field_manager: "keel".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

impl ControllerConfig {
    /// Defaults overridden by `KEEL_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            reconcile_timeout_secs: env_or("KEEL_RECONCILE_TIMEOUT_SECS", d.reconcile_timeout_secs),
            short_wait_secs: env_or("KEEL_SHORT_WAIT_SECS", d.short_wait_secs),
            long_wait_secs: env_or("KEEL_LONG_WAIT_SECS", d.long_wait_secs),
            depend_check_wait_secs: env_or("KEEL_DEPEND_CHECK_WAIT_SECS", d.depend_check_wait_secs),
            revision_limit: env_or("KEEL_REVISION_LIMIT", d.revision_limit),
            field_manager: std::env::var("KEEL_FIELD_MANAGER").unwrap_or(d.field_manager),
        }
    }

    pub fn reconcile_timeout(&self) -> Duration { Duration::from_secs(self.reconcile_timeout_secs) }
    pub fn short_wait(&self) -> Duration { Duration::from_secs(self.short_wait_secs) }
    pub fn long_wait(&self) -> Duration { Duration::from_secs(self.long_wait_secs) }
    pub fn depend_check_wait(&self) -> Duration { Duration::from_secs(self.depend_check_wait_secs) }
}

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_KEY_PREFIX, DEFAULT_MAX_ATTEMPTS, DEFAULT_SHUTDOWN_GRACE_MS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RedqSettings {
    pub redis_dsn: String,
    /// Prefix for every broker key (`<prefix>:job:<id>`, `<prefix>:<type>:jobs`, ...).
    pub key_prefix: String,
    pub default_max_attempts: i64,
    /// Grace period applied when `pause` is invoked without an explicit timeout.
    pub shutdown_grace_ms: u64,
}

impl Default for RedqSettings {
    fn default() -> Self {
        Self {
            redis_dsn: "redis://localhost:6379/0".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

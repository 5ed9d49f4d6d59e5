pub const DEFAULT_KEY_PREFIX: &str = "q";
pub const DEFAULT_MAX_ATTEMPTS: i64 = 1;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Value pushed onto a notification list, one per claimable job. The
/// content is never inspected; the pop is only a wake-up signal.
pub const NOTIFICATION_TOKEN: &str = "1";

pub const PRIORITY_LOW: i64 = 10;
pub const PRIORITY_NORMAL: i64 = 0;
pub const PRIORITY_MEDIUM: i64 = -5;
pub const PRIORITY_HIGH: i64 = -10;
pub const PRIORITY_CRITICAL: i64 = -15;

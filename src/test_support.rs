use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::events::EventBus;
use crate::settings::RedqSettings;
use crate::store::JobStore;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serialized access to the test Redis database. Each context flushes the
/// DB, so tests must not run against a shared instance.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: RedqSettings,
    pub store: JobStore,
    pub events: EventBus,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = RedqSettings::default();
        settings.redis_dsn = std::env::var("REDQ_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        let mut store = JobStore::new(settings.clone()).await?;
        store.flushdb().await?;
        let events = EventBus::new(settings.clone()).await?;
        Ok(Self {
            _guard: guard,
            settings,
            store,
            events,
        })
    }

    /// Job types are unique per test so parked workers and registry
    /// entries from one test cannot observe another's keys.
    pub fn unique_kind(&self) -> String {
        format!("kind-{}", Uuid::new_v4())
    }
}

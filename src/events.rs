use anyhow::Result;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde_json::{Value, json};

use crate::settings::RedqSettings;
use crate::store::JobStore;

/// Per-job lifecycle event fan-out over Redis pub/sub. Every message is a
/// JSON object `{id, event, args}` on the shared `<prefix>:events`
/// channel; consumers filter by job id.
#[derive(Clone)]
pub struct EventBus {
    conn: MultiplexedConnection,
    channel: String,
}

impl EventBus {
    pub async fn new(settings: RedqSettings) -> Result<Self> {
        let store = JobStore::new(settings).await?;
        let channel = store.events_channel();
        Ok(Self::with_connection(store.into_connection(), channel))
    }

    pub fn with_connection(conn: MultiplexedConnection, channel: String) -> Self {
        Self { conn, channel }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn emit(&mut self, job_id: &str, event: &str, args: Option<Value>) -> Result<()> {
        let payload = json!({
            "id": job_id,
            "event": event,
            "args": args,
        });
        let _: i64 = self.conn.publish(&self.channel, payload.to_string()).await?;
        Ok(())
    }
}

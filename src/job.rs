use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{
    PRIORITY_CRITICAL, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MEDIUM, PRIORITY_NORMAL,
};
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Inactive,
    Active,
    Complete,
    Failed,
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Inactive => "inactive",
            JobState::Active => "active",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inactive" => Some(JobState::Inactive),
            "active" => Some(JobState::Active),
            "complete" => Some(JobState::Complete),
            "failed" => Some(JobState::Failed),
            "delayed" => Some(JobState::Delayed),
            _ => None,
        }
    }
}

/// Named priority levels mapped onto sorted-set scores. Lower scores are
/// claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn score(self) -> i64 {
        match self {
            Priority::Low => PRIORITY_LOW,
            Priority::Normal => PRIORITY_NORMAL,
            Priority::Medium => PRIORITY_MEDIUM,
            Priority::High => PRIORITY_HIGH,
            Priority::Critical => PRIORITY_CRITICAL,
        }
    }
}

/// Retry backoff configuration persisted with the job. `Custom` is a
/// marker; the function itself is process-local and attached at runtime
/// (see [`Job::attach_backoff_fn`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Backoff {
    Fixed,
    Exponential,
    Custom,
}

/// `(attempts so far, stored delay ms) -> next delay ms`.
pub type BackoffFn = dyn Fn(i64, i64) -> Result<i64> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    pub remaining: i64,
    pub attempts: i64,
    pub max: i64,
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub job_id: Option<String>,
    pub priority: Option<Priority>,
    pub max_attempts: Option<i64>,
    pub delay_ms: Option<i64>,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: bool,
}

/// A persisted job record. One Redis hash per job, with per-state sorted
/// sets mirroring `state` (see the transition group in the store).
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub kind: String,
    pub data: Value,
    pub state: JobState,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Wall-clock processing time in milliseconds, set on completion.
    pub duration_ms: Option<i64>,
    /// Serialized JSON result, set on completion when the processor
    /// returned one.
    pub result: Option<String>,
    pub error: Option<String>,
    pub max_attempts: i64,
    pub attempts: i64,
    pub delay_ms: i64,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: bool,
    custom_backoff: Option<Arc<BackoffFn>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("delay_ms", &self.delay_ms)
            .field("backoff", &self.backoff)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn create(kind: impl Into<String>, data: Value, options: JobOptions) -> Self {
        Self {
            id: options.job_id.unwrap_or_else(Job::new_id),
            kind: kind.into(),
            data,
            state: JobState::Inactive,
            priority: options.priority.unwrap_or(Priority::Normal).score(),
            created_at: Utc::now(),
            updated_at: None,
            started_at: None,
            failed_at: None,
            duration_ms: None,
            result: None,
            error: None,
            max_attempts: options.max_attempts.unwrap_or(1),
            attempts: 0,
            delay_ms: options.delay_ms.unwrap_or(0),
            backoff: options.backoff,
            remove_on_complete: options.remove_on_complete,
            custom_backoff: None,
        }
    }

    /// Score used for claim ordering: priority dominates, insertion time
    /// breaks ties.
    pub fn queue_score(&self) -> f64 {
        (self.priority as f64) * 1e10 + self.created_at.timestamp() as f64
    }

    pub async fn get(store: &mut JobStore, id: &str) -> Result<Option<Job>> {
        let Some(map) = store.get_job_data_map(id).await? else {
            return Ok(None);
        };
        Job::from_map(map).map(Some)
    }

    /// Persist the hash and enter the `inactive` state, which scores the
    /// job into the claimable set and pushes one notification token.
    pub async fn save(&mut self, store: &mut JobStore) -> Result<()> {
        store.save_job(self).await?;
        self.set_state(store, JobState::Inactive).await
    }

    pub async fn set_state(&mut self, store: &mut JobStore, to: JobState) -> Result<()> {
        let now = Utc::now();
        self.updated_at = Some(now);
        match to {
            JobState::Active => self.started_at = Some(now),
            JobState::Failed => self.failed_at = Some(now),
            _ => {}
        }
        store.change_state(self, to).await?;
        self.state = to;
        Ok(())
    }

    pub async fn active(&mut self, store: &mut JobStore) -> Result<()> {
        self.set_state(store, JobState::Active).await
    }

    pub async fn complete(&mut self, store: &mut JobStore) -> Result<()> {
        self.set_state(store, JobState::Complete).await
    }

    pub async fn failed(&mut self, store: &mut JobStore) -> Result<()> {
        self.set_state(store, JobState::Failed).await
    }

    pub async fn inactive(&mut self, store: &mut JobStore) -> Result<()> {
        self.set_state(store, JobState::Inactive).await
    }

    pub async fn delayed(&mut self, store: &mut JobStore) -> Result<()> {
        self.set_state(store, JobState::Delayed).await
    }

    /// Attach error info; persisted by the next `failed` transition.
    pub fn set_error(&mut self, message: impl Into<String>) -> &mut Self {
        self.error = Some(message.into());
        self
    }

    /// Atomically consume one attempt. Yields the remaining budget along
    /// with the consumed count and the maximum.
    pub async fn attempt(&mut self, store: &mut JobStore) -> Result<AttemptInfo> {
        let (attempts, max) = store.consume_attempt(&self.id, self.max_attempts).await?;
        self.attempts = attempts;
        self.max_attempts = max;
        Ok(AttemptInfo {
            remaining: (max - attempts).max(0),
            attempts,
            max,
        })
    }

    pub fn attach_backoff_fn(&mut self, backoff_fn: Option<Arc<BackoffFn>>) {
        self.custom_backoff = backoff_fn;
    }

    /// The function used to compute the retry delay, where one exists:
    /// the builtin for `Exponential`, the attached function for `Custom`.
    /// `Fixed` (and a `Custom` job with nothing attached) has none; the
    /// stored delay is used as-is.
    pub fn backoff_impl(&self) -> Option<Arc<BackoffFn>> {
        match self.backoff? {
            Backoff::Fixed => None,
            Backoff::Exponential => Some(Arc::new(|attempts: i64, delay: i64| {
                let exponent = (attempts.clamp(1, 30) - 1) as i32;
                Ok(((delay as f64) * 2f64.powi(exponent)).round() as i64)
            })),
            Backoff::Custom => self.custom_backoff.clone(),
        }
    }

    /// Flush all mutable fields back to the hash.
    pub async fn update(&mut self, store: &mut JobStore) -> Result<()> {
        self.updated_at = Some(Utc::now());
        store.save_job(self).await
    }

    pub async fn set(&mut self, store: &mut JobStore, field: &str, value: &str) -> Result<()> {
        store.set_job_field(&self.id, field, value).await
    }

    /// Delete the persisted record and every index entry.
    pub async fn remove(&self, store: &mut JobStore) -> Result<()> {
        store.remove_job(self).await
    }

    pub fn to_field_mapping(&self) -> Result<Vec<(String, String)>> {
        let data_json = serde_json::to_string(&self.data)?;

        let mut mapping: Vec<(String, String)> = vec![
            ("id".to_string(), self.id.clone()),
            ("type".to_string(), self.kind.clone()),
            ("data".to_string(), data_json),
            ("state".to_string(), self.state.as_str().to_string()),
            ("priority".to_string(), self.priority.to_string()),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            ("max_attempts".to_string(), self.max_attempts.to_string()),
            ("attempts".to_string(), self.attempts.to_string()),
            ("delay".to_string(), self.delay_ms.to_string()),
            (
                "remove_on_complete".to_string(),
                if self.remove_on_complete { "1" } else { "0" }.to_string(),
            ),
        ];

        if let Some(value) = self.updated_at {
            mapping.push(("updated_at".to_string(), value.to_rfc3339()));
        }
        if let Some(value) = self.started_at {
            mapping.push(("started_at".to_string(), value.to_rfc3339()));
        }
        if let Some(value) = self.failed_at {
            mapping.push(("failed_at".to_string(), value.to_rfc3339()));
        }
        if let Some(value) = self.duration_ms {
            mapping.push(("duration".to_string(), value.to_string()));
        }
        if let Some(value) = self.result.as_ref() {
            mapping.push(("result".to_string(), value.clone()));
        }
        if let Some(value) = self.error.as_ref() {
            mapping.push(("error".to_string(), value.clone()));
        }
        if let Some(value) = self.backoff.as_ref() {
            let backoff_json = serde_json::to_string(value)?;
            mapping.push(("backoff".to_string(), backoff_json));
        }

        Ok(mapping)
    }

    pub fn from_map(map: HashMap<String, String>) -> Result<Job> {
        let id = map
            .get("id")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("job hash missing id"))?;
        let kind = map
            .get("type")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("job {id} missing type"))?;
        let state = map
            .get("state")
            .and_then(|raw| JobState::parse(raw))
            .ok_or_else(|| anyhow::anyhow!("job {id} has invalid state"))?;
        let created_at = map
            .get("created_at")
            .and_then(|raw| Self::parse_datetime(raw))
            .ok_or_else(|| anyhow::anyhow!("job {id} has invalid created_at"))?;

        let data = map
            .get("data")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null);
        let backoff = map
            .get("backoff")
            .and_then(|raw| serde_json::from_str(raw).ok());

        Ok(Job {
            kind,
            data,
            state,
            priority: Self::parse_int(&map, "priority").unwrap_or(0),
            created_at,
            updated_at: map.get("updated_at").and_then(|raw| Self::parse_datetime(raw)),
            started_at: map.get("started_at").and_then(|raw| Self::parse_datetime(raw)),
            failed_at: map.get("failed_at").and_then(|raw| Self::parse_datetime(raw)),
            duration_ms: Self::parse_int(&map, "duration"),
            result: map.get("result").cloned(),
            error: map.get("error").cloned(),
            max_attempts: Self::parse_int(&map, "max_attempts").unwrap_or(1),
            attempts: Self::parse_int(&map, "attempts").unwrap_or(0),
            delay_ms: Self::parse_int(&map, "delay").unwrap_or(0),
            backoff,
            remove_on_complete: map.get("remove_on_complete").map(String::as_str) == Some("1"),
            custom_backoff: None,
            id,
        })
    }

    fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn parse_int(map: &HashMap<String, String>, field: &str) -> Option<i64> {
        map.get(field).and_then(|raw| raw.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    #[test]
    fn job_state_round_trip() {
        let states = [
            JobState::Inactive,
            JobState::Active,
            JobState::Complete,
            JobState::Failed,
            JobState::Delayed,
        ];
        for state in states {
            let text = state.as_str();
            assert_eq!(JobState::parse(text), Some(state));
        }
        assert_eq!(JobState::parse("nope"), None);
    }

    #[test]
    fn priority_scores_order_claims() {
        assert!(Priority::Critical.score() < Priority::High.score());
        assert!(Priority::High.score() < Priority::Normal.score());
        assert!(Priority::Normal.score() < Priority::Low.score());
    }

    #[test]
    fn backoff_serde_round_trip() {
        for backoff in [Backoff::Fixed, Backoff::Exponential, Backoff::Custom] {
            let raw = serde_json::to_string(&backoff).unwrap();
            let parsed: Backoff = serde_json::from_str(&raw).unwrap();
            assert_eq!(parsed, backoff);
        }
        assert_eq!(
            serde_json::to_string(&Backoff::Exponential).unwrap(),
            r#"{"type":"exponential"}"#
        );
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let job = Job::create(
            "mail",
            Value::Null,
            JobOptions {
                backoff: Some(Backoff::Exponential),
                delay_ms: Some(100),
                ..Default::default()
            },
        );
        let backoff_fn = job.backoff_impl().unwrap();
        assert_eq!(backoff_fn(1, 100).unwrap(), 100);
        assert_eq!(backoff_fn(2, 100).unwrap(), 200);
        assert_eq!(backoff_fn(3, 100).unwrap(), 400);
    }

    #[test]
    fn fixed_backoff_has_no_impl() {
        let job = Job::create(
            "mail",
            Value::Null,
            JobOptions {
                backoff: Some(Backoff::Fixed),
                ..Default::default()
            },
        );
        assert!(job.backoff_impl().is_none());
        assert!(job.backoff.is_some());
    }

    #[tokio::test]
    async fn save_persists_hash_and_enqueues() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let kind = ctx.unique_kind();
        let mut job = Job::create(
            &kind,
            json!({"to": "user@example.com"}),
            JobOptions {
                priority: Some(Priority::High),
                max_attempts: Some(3),
                ..Default::default()
            },
        );
        job.save(&mut ctx.store).await.unwrap();

        let loaded = Job::get(&mut ctx.store, &job.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, kind);
        assert_eq!(loaded.state, JobState::Inactive);
        assert_eq!(loaded.priority, Priority::High.score());
        assert_eq!(loaded.max_attempts, 3);
        assert_eq!(loaded.data, json!({"to": "user@example.com"}));

        let inactive = ctx
            .store
            .state_card(&kind, JobState::Inactive)
            .await
            .unwrap();
        assert_eq!(inactive, 1);
        let tokens = ctx.store.notification_len(&kind).await.unwrap();
        assert_eq!(tokens, 1);
    }

    #[tokio::test]
    async fn state_transitions_move_index_entries() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let kind = ctx.unique_kind();
        let mut job = Job::create(&kind, Value::Null, JobOptions::default());
        job.save(&mut ctx.store).await.unwrap();

        job.active(&mut ctx.store).await.unwrap();
        assert_eq!(
            ctx.store
                .state_card(&kind, JobState::Inactive)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            ctx.store.state_card(&kind, JobState::Active).await.unwrap(),
            1
        );

        job.set_error("boom");
        job.failed(&mut ctx.store).await.unwrap();
        assert_eq!(
            ctx.store.state_card(&kind, JobState::Active).await.unwrap(),
            0
        );
        assert_eq!(
            ctx.store.state_card(&kind, JobState::Failed).await.unwrap(),
            1
        );

        let loaded = Job::get(&mut ctx.store, &job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert!(loaded.failed_at.is_some());
    }

    #[tokio::test]
    async fn attempt_consumes_budget_atomically() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let kind = ctx.unique_kind();
        let mut job = Job::create(
            &kind,
            Value::Null,
            JobOptions {
                max_attempts: Some(3),
                ..Default::default()
            },
        );
        job.save(&mut ctx.store).await.unwrap();

        let first = job.attempt(&mut ctx.store).await.unwrap();
        assert_eq!(
            first,
            AttemptInfo {
                remaining: 2,
                attempts: 1,
                max: 3
            }
        );
        let second = job.attempt(&mut ctx.store).await.unwrap();
        assert_eq!(second.remaining, 1);
        let third = job.attempt(&mut ctx.store).await.unwrap();
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn remove_deletes_record_and_indexes() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let kind = ctx.unique_kind();
        let mut job = Job::create(&kind, Value::Null, JobOptions::default());
        job.save(&mut ctx.store).await.unwrap();

        job.remove(&mut ctx.store).await.unwrap();
        assert!(Job::get(&mut ctx.store, &job.id).await.unwrap().is_none());
        assert_eq!(
            ctx.store
                .state_card(&kind, JobState::Inactive)
                .await
                .unwrap(),
            0
        );
    }
}

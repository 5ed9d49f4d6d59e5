use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::Value;
use tokio::time::Duration;

use crate::events::EventBus;
use crate::job::{Job, JobOptions};
use crate::settings::RedqSettings;
use crate::store::JobStore;
use crate::worker::{Processor, Worker};

/// User-facing queue handle: builds and enqueues jobs, starts workers,
/// and shuts them down. One per process is typical; workers of the same
/// type share the per-type blocking connection regardless.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    settings: RedqSettings,
    store: JobStore,
    events: EventBus,
    workers: Mutex<Vec<Arc<Worker>>>,
}

impl Queue {
    pub async fn new(settings: RedqSettings) -> Result<Self> {
        let store = JobStore::new(settings.clone()).await?;
        let events = EventBus::new(settings.clone()).await?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                settings,
                store,
                events,
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn settings(&self) -> &RedqSettings {
        &self.inner.settings
    }

    /// Build a job of the given type; `save` persists and enqueues it.
    pub fn create(&self, kind: impl Into<String>, data: Value, mut options: JobOptions) -> Job {
        if options.max_attempts.is_none() {
            options.max_attempts = Some(self.inner.settings.default_max_attempts);
        }
        Job::create(kind, data, options)
    }

    /// Persist and enqueue a job, announcing it on the event bus.
    pub async fn save(&self, job: &mut Job) -> Result<()> {
        let mut store = self.inner.store.clone();
        job.save(&mut store).await?;
        let mut events = self.inner.events.clone();
        events
            .emit(&job.id, "enqueue", Some(Value::String(job.kind.clone())))
            .await?;
        tracing::info!(kind = %job.kind, job_id = %job.id, "job enqueued");
        Ok(())
    }

    /// Start a worker for `kind` backed by `processor`.
    pub fn process(&self, kind: impl Into<String>, processor: Arc<dyn Processor>) -> Arc<Worker> {
        let worker = Worker::new(
            self.inner.settings.clone(),
            kind,
            self.inner.store.clone(),
            self.inner.events.clone(),
            processor,
            None,
        );
        worker.start();
        self.inner.workers.lock().unwrap().push(worker.clone());
        worker
    }

    /// Shut down every worker, or only those of one type, draining each
    /// in-flight job within the grace period.
    pub async fn shutdown(&self, grace: Option<Duration>, kind: Option<&str>) -> Result<()> {
        let targets: Vec<Arc<Worker>> = {
            let workers = self.inner.workers.lock().unwrap();
            workers
                .iter()
                .filter(|worker| kind.is_none_or(|kind| worker.kind() == kind))
                .cloned()
                .collect()
        };
        for worker in targets {
            worker.shutdown(grace).await?;
        }
        Ok(())
    }
}

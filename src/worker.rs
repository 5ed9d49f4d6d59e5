use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use crate::events::EventBus;
use crate::job::{Backoff, BackoffFn, Job};
use crate::settings::RedqSettings;
use crate::store::{self, JobStore};

/// Delay before retrying a failed claim. Claim errors are recovered
/// locally and the loop retries forever.
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(50);

/// User-supplied job handler. Completion is reported through the return
/// value, so it is single-shot by construction: `Ok(result)` completes the
/// job, `Err` routes it through the retry path.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: Job, ctl: WorkerCtl) -> Result<Option<Value>>;
}

pub type ProcessorFuture = Pin<Box<dyn Future<Output = Result<Option<Value>>> + Send>>;

struct FnProcessor<F>(F);

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(Job, WorkerCtl) -> ProcessorFuture + Send + Sync,
{
    async fn process(&self, job: Job, ctl: WorkerCtl) -> Result<Option<Value>> {
        (self.0)(job, ctl).await
    }
}

/// Adapt an async closure into a [`Processor`].
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn Processor>
where
    F: Fn(Job, WorkerCtl) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Arc::new(FnProcessor(
        move |job, ctl| -> ProcessorFuture { Box::pin(f(job, ctl)) },
    ))
}

#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let message = err.to_string();
        let stack = format!("{err:?}");
        let stack = if stack == message { None } else { Some(stack) };
        Self { message, stack }
    }
}

/// Worker-local lifecycle events, fanned out on a broadcast channel.
/// `Error` carries the job being worked when one was in scope.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Error {
        error: ErrorInfo,
        job: Option<Job>,
    },
    JobComplete(Job),
    JobFailed(Job),
    JobFailedAttempt(Job),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started, or fully shut down.
    Idle,
    Running,
    Paused,
    ShuttingDown,
}

/// What the worker currently holds. `Reserving` marks a claim in
/// progress, distinct from both no job and a real one; the shutdown grace
/// timer keys off this distinction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentJob {
    NoJob,
    Reserving,
    Holding(String),
}

struct WorkerState {
    running: RunState,
    current: CurrentJob,
}

/// Control surface handed to the processor alongside each job.
#[derive(Clone)]
pub struct WorkerCtl {
    worker: Arc<Worker>,
}

impl WorkerCtl {
    /// Stop claiming new jobs for this worker's type. The in-flight job
    /// (the caller's own) is drained, or force-failed once `grace`
    /// elapses; `None` uses the configured default.
    pub fn pause(&self, grace: Option<Duration>) {
        self.worker.pause(grace);
    }

    /// Flip the worker from paused back to running. Returns whether a
    /// flip occurred; the claim loop re-arms only when it did.
    pub fn resume(&self) -> bool {
        self.worker.resume()
    }
}

enum ClaimOutcome {
    Job(Job),
    /// A notification arrived but a peer drained the set first.
    Drained,
    Shutdown,
    Error(anyhow::Error),
}

enum RunOutcome {
    Finished(Result<Option<Value>>),
    ForceFailed,
}

/// A long-lived agent bound to one broker and one job type. At most one
/// job is in flight per worker; terminal transitions happen-before the
/// next claim.
pub struct Worker {
    kind: String,
    settings: RedqSettings,
    store: JobStore,
    events: EventBus,
    processor: Arc<dyn Processor>,
    custom_backoff: Option<Arc<BackoffFn>>,
    state: Mutex<WorkerState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    /// Wakes the claim loop out of its paused park.
    park_wake: Notify,
    /// Grace-timer force-fail request, carrying the target job id.
    force_fail: watch::Sender<Option<String>>,
    local: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(
        settings: RedqSettings,
        kind: impl Into<String>,
        store: JobStore,
        events: EventBus,
        processor: Arc<dyn Processor>,
        custom_backoff: Option<Arc<BackoffFn>>,
    ) -> Arc<Self> {
        let (local, _) = broadcast::channel(256);
        let (force_fail, _) = watch::channel(None);
        Arc::new(Self {
            kind: kind.into(),
            settings,
            store,
            events,
            processor,
            custom_backoff,
            state: Mutex::new(WorkerState {
                running: RunState::Idle,
                current: CurrentJob::NoJob,
            }),
            loop_handle: Mutex::new(None),
            park_wake: Notify::new(),
            force_fail,
            local,
        })
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn run_state(&self) -> RunState {
        self.state.lock().unwrap().running
    }

    pub fn is_running(&self) -> bool {
        self.run_state() == RunState::Running
    }

    pub fn current(&self) -> CurrentJob {
        self.state.lock().unwrap().current.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.local.subscribe()
    }

    /// Start the claim loop. Idempotent: a worker that is already
    /// running, paused, or shutting down is left alone.
    pub fn start(self: &Arc<Self>) {
        {
            let mut st = self.state.lock().unwrap();
            match st.running {
                RunState::Idle => st.running = RunState::Running,
                _ => return,
            }
        }
        tracing::info!(kind = %self.kind, "worker started");
        let worker = self.clone();
        let handle = tokio::spawn(async move { worker.run_loop().await });
        *self.loop_handle.lock().unwrap() = Some(handle);
    }

    pub fn pause(self: &Arc<Self>, grace: Option<Duration>) {
        {
            let mut st = self.state.lock().unwrap();
            if st.running != RunState::Running {
                return;
            }
            st.running = RunState::Paused;
        }
        tracing::info!(kind = %self.kind, "worker paused");
        let grace =
            grace.unwrap_or_else(|| Duration::from_millis(self.settings.shutdown_grace_ms));
        let worker = self.clone();
        tokio::spawn(async move {
            sleep(grace).await;
            worker.force_fail_if_holding(RunState::Paused);
        });
    }

    pub fn resume(&self) -> bool {
        {
            let mut st = self.state.lock().unwrap();
            if st.running != RunState::Paused {
                return false;
            }
            st.running = RunState::Running;
        }
        tracing::info!(kind = %self.kind, "worker resumed");
        self.park_wake.notify_waiters();
        true
    }

    /// Graceful shutdown. Stops new claims, wakes a parked blocking wait
    /// with a recovery token, drains the in-flight job (force-failing it
    /// once `grace` elapses), then releases the shared per-type
    /// connection. Idempotent: a second call returns with no broker side
    /// effects.
    pub async fn shutdown(self: &Arc<Self>, grace: Option<Duration>) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            match st.running {
                RunState::Idle | RunState::ShuttingDown => return Ok(()),
                RunState::Running | RunState::Paused => st.running = RunState::ShuttingDown,
            }
        }
        tracing::info!(kind = %self.kind, "worker shutting down");

        // A claim parked on the blocking wait is woken by the token; it
        // observes the state flip, pushes the token back for peers, and
        // exits. A paused park is woken directly.
        let mut store = self.store.clone();
        if let Err(err) = store.push_notification(&self.kind).await {
            tracing::warn!(kind = %self.kind, "failed to push recovery token: {err}");
        }
        self.park_wake.notify_waiters();

        let grace_timer = grace.map(|grace| {
            let worker = self.clone();
            tokio::spawn(async move {
                sleep(grace).await;
                // Only an in-flight job is force-failed; a claim still
                // reserving settles on its own and a drained worker has
                // already exited.
                worker.force_fail_if_holding(RunState::ShuttingDown);
            })
        });

        let handle = self.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(kind = %self.kind, "worker loop ended abnormally: {err}");
            }
        }
        if let Some(timer) = grace_timer {
            timer.abort();
        }

        store::release_blocking(&self.settings, &self.kind).await;
        self.force_fail.send_replace(None);
        {
            let mut st = self.state.lock().unwrap();
            st.current = CurrentJob::NoJob;
            st.running = RunState::Idle;
        }
        tracing::info!(kind = %self.kind, "worker shut down");
        Ok(())
    }

    fn force_fail_if_holding(&self, expected: RunState) {
        let target = {
            let st = self.state.lock().unwrap();
            if st.running != expected {
                return;
            }
            match &st.current {
                CurrentJob::Holding(id) => Some(id.clone()),
                _ => None,
            }
        };
        if let Some(id) = target {
            self.force_fail.send_replace(Some(id));
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            match self.run_state() {
                RunState::Idle | RunState::ShuttingDown => break,
                RunState::Paused => {
                    let mut wake = std::pin::pin!(self.park_wake.notified());
                    wake.as_mut().enable();
                    if self.run_state() == RunState::Paused {
                        wake.await;
                    }
                    continue;
                }
                RunState::Running => {}
            }
            match self.claim().await {
                ClaimOutcome::Job(job) => self.run_job(job).await,
                ClaimOutcome::Drained => continue,
                ClaimOutcome::Shutdown => continue,
                ClaimOutcome::Error(err) => {
                    self.emit_error(&err, None);
                    sleep(CLAIM_RETRY_DELAY).await;
                }
            }
        }
        tracing::debug!(kind = %self.kind, "claim loop exited");
    }

    /// Two-phase claim: the notification list is a coarse wake-up
    /// channel, the sorted-set pop is the authoritative claim.
    async fn claim(&self) -> ClaimOutcome {
        {
            let mut st = self.state.lock().unwrap();
            if st.running != RunState::Running {
                return ClaimOutcome::Shutdown;
            }
            st.current = CurrentJob::Reserving;
        }

        let mut blocking = match store::acquire_blocking(&self.settings, &self.kind).await {
            Ok(conn) => conn,
            Err(err) => {
                self.reset_current();
                return ClaimOutcome::Error(err);
            }
        };
        let list_key = self.store.notification_key(&self.kind);
        let waited = JobStore::wait_for_notification(&mut blocking, &list_key).await;
        drop(blocking);

        let mut store = self.store.clone();
        if let Err(err) = waited {
            // Unblock any peer parked on the same list before surfacing.
            if let Err(push_err) = store.push_notification(&self.kind).await {
                tracing::warn!(kind = %self.kind, "failed to push recovery token: {push_err}");
            }
            self.reset_current();
            return ClaimOutcome::Error(err);
        }
        if !self.is_running() {
            // Woke up mid-shutdown or mid-pause: hand the token back so
            // no peer stays parked on an empty list.
            if let Err(push_err) = store.push_notification(&self.kind).await {
                tracing::warn!(kind = %self.kind, "failed to push recovery token: {push_err}");
            }
            self.reset_current();
            return ClaimOutcome::Shutdown;
        }

        let id = match store.pop_first(&self.kind).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                // A peer drained the set between the notification and the
                // pop; benign, the loop re-parks.
                self.reset_current();
                return ClaimOutcome::Drained;
            }
            Err(err) => {
                self.reset_current();
                return ClaimOutcome::Error(err);
            }
        };
        match Job::get(&mut store, &id).await {
            Ok(Some(mut job)) => {
                if job.backoff == Some(Backoff::Custom) {
                    job.attach_backoff_fn(self.custom_backoff.clone());
                }
                let mut st = self.state.lock().unwrap();
                st.current = CurrentJob::Holding(id);
                ClaimOutcome::Job(job)
            }
            Ok(None) => {
                self.reset_current();
                ClaimOutcome::Error(anyhow::anyhow!("job {id} does not exist"))
            }
            Err(err) => {
                self.reset_current();
                ClaimOutcome::Error(err)
            }
        }
    }

    /// Drive one claimed job to a terminal state.
    async fn run_job(self: &Arc<Self>, mut job: Job) {
        let mut store = self.store.clone();
        if let Err(err) = job.active(&mut store).await {
            self.emit_error(&err, Some(&job));
            self.reset_current();
            return;
        }
        let start = Instant::now();

        let ctl = WorkerCtl {
            worker: self.clone(),
        };
        let processor = self.processor.clone();
        let snapshot = job.clone();
        let mut task = tokio::spawn(async move { processor.process(snapshot, ctl).await });
        let mut force_rx = self.force_fail.subscribe();

        let outcome = loop {
            let force_requested =
                force_rx.borrow_and_update().as_deref() == Some(job.id.as_str());
            if force_requested {
                task.abort();
                self.force_fail.send_replace(None);
                break RunOutcome::ForceFailed;
            }
            tokio::select! {
                joined = &mut task => {
                    break RunOutcome::Finished(match joined {
                        Ok(result) => result,
                        Err(join_err) => {
                            Err(anyhow::anyhow!("processor task failed: {join_err}"))
                        }
                    });
                }
                _ = force_rx.changed() => {}
            }
        };

        match outcome {
            RunOutcome::Finished(Ok(result)) => self.handle_success(&mut job, result, start).await,
            RunOutcome::Finished(Err(err)) => self.handle_failure(&mut job, err).await,
            RunOutcome::ForceFailed => self.handle_force_fail(&mut job).await,
        }
        self.reset_current();
    }

    async fn handle_success(&self, job: &mut Job, result: Option<Value>, start: Instant) {
        let mut store = self.store.clone();
        let duration = start.elapsed().as_millis() as i64;
        job.duration_ms = Some(duration);
        if let Err(err) = job.set(&mut store, "duration", &duration.to_string()).await {
            self.emit_error(&err, Some(&*job));
        }
        if let Some(value) = result.as_ref() {
            let serialized = match serde_json::to_string(value) {
                Ok(serialized) => serialized,
                Err(_) => json!({
                    "error": true,
                    "message": format!("Invalid JSON Result: {value}"),
                })
                .to_string(),
            };
            job.result = Some(serialized.clone());
            if let Err(err) = job.set(&mut store, "result", &serialized).await {
                self.emit_error(&err, Some(&*job));
            }
        }
        if let Err(err) = job.complete(&mut store).await {
            self.emit_error(&err, Some(&*job));
            return;
        }
        if let Err(err) = job.attempt(&mut store).await {
            self.emit_error(&err, Some(&*job));
        }
        if job.remove_on_complete {
            if let Err(err) = job.remove(&mut store).await {
                self.emit_error(&err, Some(&*job));
            }
        }
        tracing::info!(kind = %self.kind, job_id = %job.id, duration_ms = duration, "job complete");
        self.emit_local(WorkerEvent::JobComplete(job.clone()));
        self.emit_bus(job, "complete", result).await;
    }

    async fn handle_failure(&self, job: &mut Job, err: anyhow::Error) {
        let mut store = self.store.clone();
        job.set_error(err.to_string());
        if let Err(transition_err) = job.failed(&mut store).await {
            self.emit_error(&transition_err, Some(&*job));
            return;
        }
        let attempt = match job.attempt(&mut store).await {
            Ok(attempt) => attempt,
            Err(bookkeeping_err) => {
                self.emit_error(&bookkeeping_err, Some(&*job));
                return;
            }
        };
        if attempt.remaining > 0 {
            if job.backoff.is_some() {
                let mut delay = job.delay_ms;
                if let Some(backoff_fn) = job.backoff_impl() {
                    match backoff_fn(attempt.attempts, job.delay_ms) {
                        Ok(computed) => delay = computed,
                        Err(backoff_err) => self.emit_error(&backoff_err, Some(&*job)),
                    }
                }
                job.delay_ms = delay;
                if let Err(set_err) = job.set(&mut store, "delay", &delay.to_string()).await {
                    self.emit_error(&set_err, Some(&*job));
                }
                if let Err(transition_err) = job.delayed(&mut store).await {
                    self.emit_error(&transition_err, Some(&*job));
                    return;
                }
            } else if let Err(transition_err) = job.inactive(&mut store).await {
                self.emit_error(&transition_err, Some(&*job));
                return;
            }
            tracing::warn!(
                kind = %self.kind,
                job_id = %job.id,
                attempts = attempt.attempts,
                max = attempt.max,
                "job failed, will retry"
            );
            self.emit_local(WorkerEvent::JobFailedAttempt(job.clone()));
            self.emit_bus(job, "failed attempt", Some(json!(attempt.attempts)))
                .await;
        } else {
            tracing::error!(kind = %self.kind, job_id = %job.id, "job failed");
            self.emit_local(WorkerEvent::JobFailed(job.clone()));
            self.emit_bus(job, "failed", None).await;
        }
    }

    async fn handle_force_fail(&self, job: &mut Job) {
        let mut store = self.store.clone();
        let marker = json!({"error": true, "message": "Shutdown"});
        job.set_error(marker.to_string());
        if let Err(err) = job.failed(&mut store).await {
            self.emit_error(&err, Some(&*job));
        }
        tracing::warn!(kind = %self.kind, job_id = %job.id, "job force-failed by grace timer");
        self.emit_local(WorkerEvent::JobFailed(job.clone()));
        self.emit_bus(job, "failed", None).await;
    }

    fn reset_current(&self) {
        let mut st = self.state.lock().unwrap();
        st.current = CurrentJob::NoJob;
    }

    fn emit_error(&self, err: &anyhow::Error, job: Option<&Job>) {
        tracing::error!(
            kind = %self.kind,
            job_id = job.map(|job| job.id.as_str()).unwrap_or("-"),
            "worker error: {err:#}"
        );
        self.emit_local(WorkerEvent::Error {
            error: ErrorInfo::from_error(err),
            job: job.cloned(),
        });
    }

    fn emit_local(&self, event: WorkerEvent) {
        let _ = self.local.send(event);
    }

    async fn emit_bus(&self, job: &Job, event: &str, args: Option<Value>) {
        let mut events = self.events.clone();
        if let Err(err) = events.emit(&job.id, event, args).await {
            self.emit_error(&err, Some(job));
        }
    }
}

pub mod config;
pub mod constants;
pub mod events;
pub mod job;
pub mod queue;
pub mod settings;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::{load_toml_settings, resolve_config_path};
pub use events::EventBus;
pub use job::{AttemptInfo, Backoff, BackoffFn, Job, JobOptions, JobState, Priority};
pub use queue::Queue;
pub use settings::RedqSettings;
pub use store::JobStore;
pub use worker::{
    CurrentJob, ErrorInfo, Processor, RunState, Worker, WorkerCtl, WorkerEvent, processor_fn,
};

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod kv;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod test_utils;

use services::ingest::JobRunner;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::JobScheduler;

pub struct AppState {
    pub jobs: Arc<JobRunner>,
    /// Bearer secret for the job endpoints; `None` rejects every trigger.
    pub cron_secret: Option<String>,
    pub scheduler: Mutex<Option<JobScheduler>>,
}

mod health;
mod jobs;

pub use health::health_handler;
pub use jobs::{create_job_handler, get_job_handler, get_run_handler, list_jobs_handler};

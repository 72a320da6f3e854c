pub mod health;
pub mod jobs;

pub use health::health_handler;
pub use jobs::{jobs_status_handler, pause_handler, resume_handler, run_now_handler};

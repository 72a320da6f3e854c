pub mod audit;

pub use audit::{log_audit_event, log_job_run_log, Actor};

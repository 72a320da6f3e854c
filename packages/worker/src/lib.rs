//! Tenant graph sync worker.
//!
//! A long-running worker that mirrors a directory/collaboration graph
//! (users, groups, sites, drives, drive items and per-item permissions)
//! from the Microsoft Graph API into Postgres, keeps dependent
//! materialized views fresh, and exposes a small internal admin surface.

pub mod common;
pub mod config;
pub mod jobs;
pub mod kernel;
pub mod server;

pub use config::Config;

//! Collaboration framework API module
//!
//! Contains the resource types and the HTTP client used by tool handlers to
//! talk to the pentest collaboration backend.

pub mod client;
pub mod types;

pub use client::{CollabApi, HttpCollabClient, RetryPolicy};
pub use types::{ListQuery, Resource};

//! Client-side coordination layer for the CV processing backend.
//!
//! - [`requests`]: keyed single-flight deduplication with a short result cache.
//! - [`jobs`]: shared, debounced job-document subscriptions.
//! - [`sync`]: multi-tab / multi-device session state sync with conflict resolution.
//! - [`recovery`]: error classification and per-class retry advice.
//!
//! [`coordinator::Coordinator`] owns one instance of each; the binary serves a small
//! debug/control HTTP surface over it.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod jobs;
pub mod recovery;
pub mod requests;
pub mod routes;
pub mod state;
pub mod sync;

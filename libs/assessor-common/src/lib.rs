//! Shared model for the assessment engine: catalog entities, test-case
//! payloads, submitted artifacts, session/progress records, evaluation
//! results, the error taxonomy, Redis key semantics and runtime config.

pub mod artifact;
pub mod config;
pub mod error;
pub mod payload;
pub mod progress;
pub mod redis;
pub mod results;
pub mod types;

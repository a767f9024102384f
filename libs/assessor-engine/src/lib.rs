//! Grading engine: catalog, sessions, sandboxes, dispatch, evaluators,
//! scoring and the admin harness.
//!
//! The layering mirrors the flow of a submission: the [`session`] manager
//! resolves who is submitting, [`submission`] maps the raw request onto one
//! artifact, the [`dispatcher`] fans test cases out to the [`evaluator`]s,
//! and the [`tracker`] folds outcomes into stored progress.

pub mod catalog;
pub mod clock;
pub mod dispatcher;
pub mod evaluator;
pub mod harness;
pub mod languages;
pub mod sandbox;
pub mod scorer;
pub mod session;
pub mod store;
pub mod submission;
pub mod tracker;

#[cfg(test)]
pub(crate) mod fixtures;

//! Shared plumbing for the query orchestrator crates: tunable knobs, the
//! runtime abstraction and error reporting.

pub mod errors;
pub mod knobs;
mod metrics;
pub mod runtime;

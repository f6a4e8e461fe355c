//! precedent library crate
//!
//! Finds closed GitLab issues similar to a new one, looks at the merge
//! requests that resolved them, and suggests the configuration edits those
//! merge requests made. The CLI in `main.rs` is a thin shell over
//! [`analyze::Analyzer`]; benchmarks and tests use the modules directly.

pub mod analyze;
pub mod config;
pub mod error;
pub mod gitlab;
pub mod logging;
pub mod model;
pub mod patterns;
pub mod score;
pub mod search;
pub mod store;
pub mod suggest;
pub mod text;

//! Flakestat workspace-level test utilities.
//!
//! This crate exists solely to support workspace-level integration tests,
//! particularly the BDD/cucumber tests in `tests/cucumber.rs`.
//!
//! The actual flakestat functionality is in the workspace member crates:
//! - `flakestat-types`: Wire formats, records and JSON schemas
//! - `flakestat-domain`: Classification, aggregation and log scanning
//! - `flakestat-adapters`: Process runner, artifact store and report loading
//! - `flakestat-app`: Application use cases and renderers
//! - `flakestat-cli`: The `flakestat` binary

//! Shared test utilities for labflow integration tests.
//!
//! - `TestHarness` wires a store, a queue and an orchestrator over one
//!   on-disk database in a temp directory
//! - `ScriptedHandler` and registry builders for programmable stages

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{RecordingSleeper, TestHarness};

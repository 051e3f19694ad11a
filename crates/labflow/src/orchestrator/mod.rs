//! Drives admitted jobs through the stage registry.

pub mod engine;
pub mod error;
pub mod terminal;

pub use engine::{JobOutcome, Orchestrator, SkipReason, ORCHESTRATOR_STAGE};
pub use error::OrchestratorError;
pub use terminal::{
    CommandTerminal, CompletionNotifier, ErrorHandler, LoggingTerminal, TERMINAL_ATTEMPTS,
};

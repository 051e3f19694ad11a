//! Job lifecycle events for downstream collaborators.

pub mod job_events;

pub use job_events::{JobEvent, JobEventBroadcaster, JobEventKind};

//! Broadcasting modules for real-time event streaming.
//!
//! Front ends (desktop shell, HTTP server-sent events) subscribe here to
//! follow jobs as their steps complete.

pub mod workflow_events;

pub use workflow_events::{WorkflowEvent, WorkflowEventBroadcaster, WorkflowEventKind};

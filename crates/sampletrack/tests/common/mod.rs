//! Shared test utilities for sampletrack integration tests.
//!
//! This module provides:
//! - `TestHarness` with an in-memory database, a manual clock and a
//!   recording notifier
//! - Builder patterns for jobs and flow configurations

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{Recorded, RecordingNotifier, TestHarness};

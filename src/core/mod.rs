//! Core domain models for pipelines
//!
//! This module defines the fundamental data structures that represent
//! pipeline definitions, runs, and their parameters and state.

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod params;
pub mod pipeline;
pub mod run;
pub mod state;
pub mod template;

pub use error::{PipelineError, Result};
pub use event::RunEvent;
pub use pipeline::*;
pub use run::{Run, TaskExecution};
pub use state::*;

//! Plate run sequencing.
//!
//! - [`engine`]: the event-driven state machine
//! - [`state`]: per-well and per-plate progress
//! - [`naming`]: field selection and image naming
//! - [`lock`]: per-key async locks

pub mod engine;
pub mod lock;
pub mod naming;
pub mod state;

pub use engine::{Collaborators, WorkflowEngine};
pub use state::{Phase, RunState, WellState};

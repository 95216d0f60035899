//! Instrument implementations.
//!
//! Real transports implement [`Instrument`](crate::core::Instrument) outside this
//! crate; [`mock`] holds the simulated ones used by tests and the CLI.

pub mod mock;

pub use mock::{Action, ActionLog, DryRunInstrument, RecordingInstrument};

//! Core library for the rust_camacq application.
//!
//! This library drives an automated multi-well microscope run: for every well it
//! probes a few fields at a ladder of detector gains, estimates the best gain per
//! fluorescence channel from the probe histograms, programs those gains, runs the
//! full-field acquisition and tracks completion until the plate is done.
//!
//! - [`workflow`]: the event-driven state machine sequencing the run
//! - [`gain`]: the histogram-based gain estimation
//! - [`bus`] and [`event`]: typed events and their delivery
//! - [`core`]: traits of the outbound collaborators (instrument, sample store, gain calculation)

pub mod bus;
pub mod command;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod event;
pub mod gain;
pub mod instrument;
pub mod sample;
pub mod workflow;

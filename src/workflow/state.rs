//! Per-well and per-plate progress.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::sample::{FieldCoord, ImageRecord, WellCoord};

/// Stage of a well in the run, in order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Not touched yet
    #[default]
    Pending,
    /// Probe jobs are queued
    Probing,
    /// Gains were calculated
    GainMeasured,
    /// A gain is programmed for every channel
    AllGainsSet,
    /// Acquisition jobs are queued
    Acquiring,
    /// Every field is imaged
    Complete,
}

/// Progress of one well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WellState {
    /// Current phase
    pub phase: Phase,
    /// Programmed gain per channel
    pub measured_gains: BTreeMap<String, u32>,
    /// Fields whose last acquisition job finished
    pub fields_completed: BTreeSet<FieldCoord>,
    /// Probe images collected for the gain calculation
    pub probe_images: Vec<ImageRecord>,
    /// The run moved on from this well after it completed
    pub handed_off: bool,
}

impl WellState {
    /// Probe images are still collected and may trigger a gain calculation.
    pub fn accepts_probe(&self) -> bool {
        matches!(self.phase, Phase::Pending | Phase::Probing)
    }

    /// A gain is recorded for each of `channel_count` channels.
    pub fn all_gains_measured(&self, channel_count: usize) -> bool {
        self.measured_gains.len() >= channel_count
    }

    /// Keep a probe image, once per path.
    pub fn record_probe_image(&mut self, image: ImageRecord) {
        if !self.probe_images.iter().any(|known| known.path == image.path) {
            self.probe_images.push(image);
        }
    }

    /// Move forward to `phase`; never moves backwards.
    pub fn advance_to(&mut self, phase: Phase) {
        self.phase = self.phase.max(phase);
    }
}

/// Wells still to be imaged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlateState {
    wells_remaining: BTreeSet<WellCoord>,
}

impl PlateState {
    /// Plate with `wells` left to image.
    pub fn new(wells: impl IntoIterator<Item = WellCoord>) -> Self {
        Self {
            wells_remaining: wells.into_iter().collect(),
        }
    }

    /// Next well in imaging order.
    pub fn next_well(&self) -> Option<&WellCoord> {
        self.wells_remaining.iter().next()
    }

    /// Mark a well as dispatched.
    pub fn remove(&mut self, well: &WellCoord) -> bool {
        self.wells_remaining.remove(well)
    }

    /// Number of wells left.
    pub fn remaining(&self) -> usize {
        self.wells_remaining.len()
    }
}

/// Run-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Wells are being imaged
    Running,
    /// Every well is done
    Finished,
}

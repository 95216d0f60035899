//! Detector gain estimation.
//!
//! Probe images are taken at a ladder of candidate gains per fluorescence channel.
//! Each probe image is reduced to an intensity histogram; the estimator fits the
//! histogram tail, finds a trend-consistent run of (box, gain) points and
//! extrapolates the gain at which the brightest pixels reach the top of the
//! 8-bit range.
//!
//! - [`fit`]: power-law least squares
//! - [`histogram`]: histograms, max projections and image decoding
//! - [`estimator`]: the pure estimation algorithm
//! - [`plot`]: optional diagnostic plots
//! - [`service`]: the gain calculation action used by the workflow

pub mod estimator;
pub mod fit;
pub mod histogram;
pub mod plot;
pub mod service;

use serde::{Deserialize, Serialize};

use crate::gain::histogram::Histogram;

pub use estimator::{estimate, estimate_with_plots};
pub use service::GainService;

/// A probe image reduced to a histogram, tagged with the gain it was taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Configured channel the probe belongs to
    pub channel_name: String,
    /// Detector gain the probe image was acquired with
    pub candidate_gain: u32,
    /// Probe channel id on the instrument, used to label diagnostics
    pub probe_channel: u32,
    /// Intensity histogram of the (projected) probe image
    pub histogram: Histogram,
}

/// Recommended gain for one channel of one well.
///
/// `gain == None` means undetermined: there was not enough usable probe data.
/// That is a normal outcome, handled downstream by falling back to the
/// channel's default gain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainResult {
    /// Configured channel name
    pub channel_name: String,
    /// Recommended gain, if one could be determined
    pub gain: Option<u32>,
}

impl GainResult {
    /// A result with a determined gain.
    pub fn new(channel_name: impl Into<String>, gain: u32) -> Self {
        Self {
            channel_name: channel_name.into(),
            gain: Some(gain),
        }
    }

    /// A result without a usable gain.
    pub fn undetermined(channel_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            gain: None,
        }
    }

    /// Whether a gain was determined.
    pub fn is_determined(&self) -> bool {
        self.gain.is_some()
    }
}

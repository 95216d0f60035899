//! Gain estimation from probe histograms.
//!
//! # Algorithm
//!
//! For every probe sample of a channel:
//!
//! 1. Select the histogram tail (the region of interest): bins with
//!    `0 < box < 255`, `10 <= count <= 100` and `box > max_occupied_box - 175`.
//!    Samples with fewer than three such bins are skipped.
//! 2. Fit `box = alpha * count^beta` over the tail and evaluate it at a count of 2,
//!    giving the box value where the tail runs out. A negative `beta` marks the
//!    point as valid.
//!
//! The `(box, gain)` points of a channel are then sorted by gain. A point is
//! trend-consistent when it is valid, its box value is at most 600 and it does
//! not drop relative to its predecessor or does not exceed its successor. The
//! longest run of consecutive trend-consistent points is fitted with
//! `gain = alpha * box^beta`, and the fit evaluated at box 255 (rounded) is the
//! recommended gain. Runs shorter than three points, and every failed fit, leave
//! the channel undetermined.
//!
//! Everything here is pure and synchronous. Callers on an async runtime should
//! run [`estimate`] on a blocking thread.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gain::fit::{fit_power_law, PowerLaw};
use crate::gain::histogram::Histogram;
use crate::gain::plot::{NullPlotSink, PlotSink};
use crate::gain::{GainResult, ProbeSample};

// =============================================================================
// Constants
// =============================================================================

/// Count at which the histogram tail is considered to have run out.
pub const COUNT_CLOSE_TO_ZERO: f64 = 2.0;

/// Smallest bin count taken into the region of interest.
pub const ROI_MIN_COUNT: u64 = 10;

/// Largest bin count taken into the region of interest.
pub const ROI_MAX_COUNT: u64 = 100;

/// Saturated 8-bit box, excluded from the region of interest.
pub const SATURATED_BOX: u32 = 255;

/// Region of interest only covers boxes within this span below the highest occupied box.
pub const ROI_BOX_SPAN: u32 = 175;

/// Minimum region of interest for a histogram fit.
pub const MIN_ROI_POINTS: usize = 3;

/// Box values above this are treated as outliers.
pub const MAX_TREND_BOX: f64 = 600.0;

/// Minimum trend run for the final gain fit.
pub const MIN_RUN_POINTS: usize = 3;

/// Box value the recommended gain should bring the brightest pixels to.
pub const TARGET_BOX: f64 = 255.0;

const HISTOGRAM_GUESS: PowerLaw = PowerLaw::new(1000.0, -1.0);
const GAIN_GUESS: PowerLaw = PowerLaw::new(1.0, 1.0);

// =============================================================================
// Points
// =============================================================================

/// One probe sample condensed to the box value where its histogram tail ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxGainPoint {
    /// Box value at which the fitted tail reaches a count of 2
    pub box_value: f64,
    /// Gain the probe was taken at
    pub gain: u32,
    /// Whether the tail fit had a negative exponent
    pub valid: bool,
}

impl BoxGainPoint {
    /// Create a point.
    pub fn new(box_value: f64, gain: u32, valid: bool) -> Self {
        Self {
            box_value,
            gain,
            valid,
        }
    }
}

/// Region of interest of a histogram as `(count, box)` pairs.
pub fn region_of_interest(histogram: &Histogram) -> Vec<(f64, f64)> {
    let Some(max_box) = histogram.max_occupied_box() else {
        return Vec::new();
    };
    let lowest_box = i64::from(max_box) - i64::from(ROI_BOX_SPAN);
    histogram
        .bins()
        .filter(|&(bin, count)| {
            bin > 0
                && bin < SATURATED_BOX
                && (ROI_MIN_COUNT..=ROI_MAX_COUNT).contains(&count)
                && i64::from(bin) > lowest_box
        })
        .map(|(bin, count)| (count as f64, f64::from(bin)))
        .collect()
}

/// Fit a histogram tail. `None` if the sample has to be skipped.
pub fn histogram_point(sample: &ProbeSample, plots: &dyn PlotSink) -> Option<BoxGainPoint> {
    let roi = region_of_interest(&sample.histogram);
    if roi.len() < MIN_ROI_POINTS {
        debug!(
            channel = %sample.channel_name,
            gain = sample.candidate_gain,
            roi = roi.len(),
            "Skipping probe sample with too small histogram tail"
        );
        return None;
    }
    let model = match fit_power_law(&roi, HISTOGRAM_GUESS) {
        Ok(model) => model,
        Err(err) => {
            debug!(
                channel = %sample.channel_name,
                gain = sample.candidate_gain,
                error = %err,
                "Histogram fit failed"
            );
            return None;
        }
    };
    plots.histogram_fit(sample, &model);
    Some(BoxGainPoint::new(
        model.eval(COUNT_CLOSE_TO_ZERO),
        sample.candidate_gain,
        model.beta < 0.0,
    ))
}

// =============================================================================
// Trend runs
// =============================================================================

/// Trend consistency of each point; `points` must be sorted by gain.
pub fn trend_flags(points: &[BoxGainPoint]) -> Vec<bool> {
    points
        .iter()
        .enumerate()
        .map(|(idx, point)| {
            let usable = point.valid
                && point.box_value.is_finite()
                && point.box_value > 0.0
                && point.box_value <= MAX_TREND_BOX;
            let rises_from_prev = idx == 0 || point.box_value >= points[idx - 1].box_value;
            let rises_to_next =
                idx + 1 == points.len() || point.box_value <= points[idx + 1].box_value;
            usable && (rises_from_prev || rises_to_next)
        })
        .collect()
}

/// Longest run of consecutive trend-consistent points. Ties go to the earliest run.
pub fn longest_trend_run(points: &[BoxGainPoint]) -> &[BoxGainPoint] {
    let flags = trend_flags(points);
    let mut best = 0..0;
    let mut start = 0;
    while start < flags.len() {
        let end = flags[start..]
            .iter()
            .position(|&flag| flag != flags[start])
            .map_or(flags.len(), |len| start + len);
        if flags[start] && end - start > best.len() {
            best = start..end;
        }
        start = end;
    }
    &points[best]
}

// =============================================================================
// Estimation
// =============================================================================

/// Estimate the gain for one channel from its probe samples.
pub fn estimate_channel(
    channel_name: &str,
    samples: &[ProbeSample],
    plots: &dyn PlotSink,
) -> GainResult {
    let mut points: Vec<BoxGainPoint> = samples
        .iter()
        .filter_map(|sample| histogram_point(sample, plots))
        .collect();
    points.sort_by_key(|point| point.gain);

    let run = longest_trend_run(&points);
    if run.len() < MIN_RUN_POINTS {
        debug!(
            channel = channel_name,
            points = points.len(),
            run = run.len(),
            "Not enough trend-consistent points, gain undetermined"
        );
        return GainResult::undetermined(channel_name);
    }

    let fit_points: Vec<(f64, f64)> = run
        .iter()
        .map(|point| (point.box_value, f64::from(point.gain)))
        .collect();
    let model = match fit_power_law(&fit_points, GAIN_GUESS) {
        Ok(model) => model,
        Err(err) => {
            debug!(channel = channel_name, error = %err, "Gain fit failed");
            return GainResult::undetermined(channel_name);
        }
    };
    plots.gain_fit(channel_name, &points, &model);

    let gain = model.eval(TARGET_BOX).round();
    if !gain.is_finite() || gain < 0.0 || gain > f64::from(u32::MAX) {
        debug!(channel = channel_name, gain, "Extrapolated gain out of range");
        return GainResult::undetermined(channel_name);
    }
    GainResult::new(channel_name, gain as u32)
}

/// Estimate gains for every channel in `samples`.
pub fn estimate(samples: &BTreeMap<String, Vec<ProbeSample>>) -> BTreeMap<String, GainResult> {
    estimate_with_plots(samples, &NullPlotSink)
}

/// Like [`estimate`], also handing every fit to a diagnostic plot sink.
///
/// The sink never changes the returned values.
pub fn estimate_with_plots(
    samples: &BTreeMap<String, Vec<ProbeSample>>,
    plots: &dyn PlotSink,
) -> BTreeMap<String, GainResult> {
    samples
        .iter()
        .map(|(channel, channel_samples)| {
            (
                channel.clone(),
                estimate_channel(channel, channel_samples, plots),
            )
        })
        .collect()
}

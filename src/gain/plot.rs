//! Diagnostic plots of the gain fits.
//!
//! Plots are side output only. A sink can never influence the estimate, and
//! write failures are logged and swallowed.

use std::path::{Path, PathBuf};

use crate::gain::estimator::BoxGainPoint;
use crate::gain::fit::PowerLaw;
use crate::gain::ProbeSample;

/// Receives every successful fit made by the estimator.
pub trait PlotSink: Send + Sync {
    /// A histogram tail fit (`box = alpha * count^beta`) of one probe sample.
    fn histogram_fit(&self, sample: &ProbeSample, model: &PowerLaw);

    /// The final gain fit of a channel, with all of the channel's points.
    fn gain_fit(&self, channel_name: &str, points: &[BoxGainPoint], model: &PowerLaw);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlotSink;

impl PlotSink for NullPlotSink {
    fn histogram_fit(&self, _sample: &ProbeSample, _model: &PowerLaw) {}

    fn gain_fit(&self, _channel_name: &str, _points: &[BoxGainPoint], _model: &PowerLaw) {}
}

/// Plot file for a histogram fit: `{dir}/{well}_C{probe_channel:02}.ome.svg`.
pub fn histogram_plot_path(dir: &Path, well_name: &str, probe_channel: u32) -> PathBuf {
    dir.join(format!("{well_name}_C{probe_channel:02}.ome.svg"))
}

/// Plot file for a gain fit: `{dir}/{well}_{channel}.svg`.
pub fn gain_plot_path(dir: &Path, well_name: &str, channel_name: &str) -> PathBuf {
    dir.join(format!("{well_name}_{channel_name}.svg"))
}

#[cfg(feature = "diagnostic_plots")]
pub use svg_sink::SvgPlotSink;

#[cfg(feature = "diagnostic_plots")]
mod svg_sink {
    use std::path::{Path, PathBuf};

    use svg::node::element::path::Data;
    use svg::node::element::{Circle, Line, Path as SvgPath, Rectangle, Text};
    use svg::Document;
    use tracing::warn;

    use super::{gain_plot_path, histogram_plot_path, PlotSink};
    use crate::gain::estimator::BoxGainPoint;
    use crate::gain::fit::PowerLaw;
    use crate::gain::ProbeSample;

    const W: f64 = 640.0;
    const H: f64 = 480.0;
    const MARGIN: f64 = 50.0;
    const CURVE_STEPS: usize = 64;

    /// Log-log axes fitted around a set of positive points.
    struct LogAxes {
        x_min: f64,
        x_max: f64,
        y_min: f64,
        y_max: f64,
    }

    impl LogAxes {
        fn around(points: &[(f64, f64)]) -> Option<Self> {
            let positive: Vec<(f64, f64)> = points
                .iter()
                .copied()
                .filter(|&(x, y)| x > 0.0 && y > 0.0 && x.is_finite() && y.is_finite())
                .map(|(x, y)| (x.log10(), y.log10()))
                .collect();
            let (first, _) = positive.split_first()?;
            let mut axes = Self {
                x_min: first.0,
                x_max: first.0,
                y_min: first.1,
                y_max: first.1,
            };
            for &(x, y) in &positive {
                axes.x_min = axes.x_min.min(x);
                axes.x_max = axes.x_max.max(x);
                axes.y_min = axes.y_min.min(y);
                axes.y_max = axes.y_max.max(y);
            }
            // Keep a visible extent for single-valued axes
            if axes.x_max - axes.x_min < 1e-9 {
                axes.x_min -= 0.5;
                axes.x_max += 0.5;
            }
            if axes.y_max - axes.y_min < 1e-9 {
                axes.y_min -= 0.5;
                axes.y_max += 0.5;
            }
            Some(axes)
        }

        fn project(&self, x: f64, y: f64) -> Option<(f64, f64)> {
            if !(x > 0.0 && y > 0.0 && x.is_finite() && y.is_finite()) {
                return None;
            }
            let px = MARGIN + (x.log10() - self.x_min) / (self.x_max - self.x_min) * (W - 2.0 * MARGIN);
            let py = H - MARGIN - (y.log10() - self.y_min) / (self.y_max - self.y_min) * (H - 2.0 * MARGIN);
            Some((px, py))
        }
    }

    fn render(points: &[(f64, f64)], model: &PowerLaw, label: &str) -> Option<Document> {
        let axes = LogAxes::around(points)?;
        let mut doc = Document::new()
            .set("viewBox", (0.0, 0.0, W, H))
            .set("width", W)
            .set("height", H)
            .add(
                Rectangle::new()
                    .set("x", 0)
                    .set("y", 0)
                    .set("width", W)
                    .set("height", H)
                    .set("fill", "#ffffff"),
            )
            .add(
                Line::new()
                    .set("x1", MARGIN)
                    .set("y1", H - MARGIN)
                    .set("x2", W - MARGIN)
                    .set("y2", H - MARGIN)
                    .set("stroke", "#000000"),
            )
            .add(
                Line::new()
                    .set("x1", MARGIN)
                    .set("y1", MARGIN)
                    .set("x2", MARGIN)
                    .set("y2", H - MARGIN)
                    .set("stroke", "#000000"),
            );

        for &(x, y) in points {
            if let Some((px, py)) = axes.project(x, y) {
                doc = doc.add(
                    Circle::new()
                        .set("cx", px)
                        .set("cy", py)
                        .set("r", 3)
                        .set("fill", "#0000ff"),
                );
            }
        }

        let mut data = Data::new();
        let mut started = false;
        for step in 0..=CURVE_STEPS {
            let log_x = axes.x_min + (axes.x_max - axes.x_min) * step as f64 / CURVE_STEPS as f64;
            let x = 10f64.powf(log_x);
            if let Some((px, py)) = axes.project(x, model.eval(x)) {
                let vertex = (px as f32, py as f32);
                data = if started {
                    data.line_to(vertex)
                } else {
                    data.move_to(vertex)
                };
                started = true;
            }
        }
        if started {
            doc = doc.add(
                SvgPath::new()
                    .set("fill", "none")
                    .set("stroke", "#008000")
                    .set("stroke-width", 2)
                    .set("d", data),
            );
        }

        Some(
            doc.add(
                Text::new(format!("{label}: {model}"))
                    .set("x", MARGIN)
                    .set("y", MARGIN / 2.0)
                    .set("font-family", "sans-serif")
                    .set("font-size", 14),
            ),
        )
    }

    /// Writes log-log SVG plots for one well into a directory.
    #[derive(Debug, Clone)]
    pub struct SvgPlotSink {
        dir: PathBuf,
        well_name: String,
    }

    impl SvgPlotSink {
        /// Plots for `well_name` go into `dir`, which must exist.
        pub fn new(dir: impl Into<PathBuf>, well_name: impl Into<String>) -> Self {
            Self {
                dir: dir.into(),
                well_name: well_name.into(),
            }
        }

        fn save(&self, path: &Path, doc: Option<Document>) {
            let Some(doc) = doc else {
                return;
            };
            if let Err(err) = svg::save(path, &doc) {
                warn!(path = %path.display(), error = %err, "Failed to write plot");
            }
        }
    }

    impl PlotSink for SvgPlotSink {
        fn histogram_fit(&self, sample: &ProbeSample, model: &PowerLaw) {
            let points: Vec<(f64, f64)> = sample
                .histogram
                .bins()
                .map(|(bin, count)| (count as f64, f64::from(bin)))
                .collect();
            let path = histogram_plot_path(&self.dir, &self.well_name, sample.probe_channel);
            self.save(&path, render(&points, model, "count-box"));
        }

        fn gain_fit(&self, channel_name: &str, points: &[BoxGainPoint], model: &PowerLaw) {
            let points: Vec<(f64, f64)> = points
                .iter()
                .map(|point| (point.box_value, f64::from(point.gain)))
                .collect();
            let path = gain_plot_path(&self.dir, &self.well_name, channel_name);
            self.save(&path, render(&points, model, "box-gain"));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_gain_plot_is_written() {
            let dir = tempfile::tempdir().unwrap();
            let sink = SvgPlotSink::new(dir.path(), "U01--V02");
            let points = [
                BoxGainPoint::new(100.0, 500, true),
                BoxGainPoint::new(150.0, 600, true),
            ];

            sink.gain_fit("green", &points, &PowerLaw::new(50.0, 0.5));

            let written = std::fs::read_to_string(dir.path().join("U01--V02_green.svg")).unwrap();
            assert!(written.contains("<svg"));
            assert!(written.contains("circle"));
        }

        #[test]
        fn test_missing_dir_is_not_fatal() {
            let sink = SvgPlotSink::new("/nonexistent/plots", "U00--V00");
            sink.gain_fit("red", &[BoxGainPoint::new(1.0, 1, true)], &PowerLaw::new(1.0, 1.0));
        }
    }
}

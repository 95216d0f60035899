//! Gain calculation action.
//!
//! [`GainService`] is the [`GainCalculator`] used by the workflow. For one well it
//! turns the probe images into histograms, pairs every probe channel with its
//! place in the configured gain ladder, runs the estimator on a blocking thread
//! and keeps the results in a table that is saved to `output_gains.csv` when a
//! save directory is configured.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{GainCalculator, SampleStore};
use crate::data::storage::{GainTableWriter, SavedGains};
use crate::error::AppResult;
use crate::gain::estimator::estimate_with_plots;
use crate::gain::histogram::{Histogram, HistogramSource};
use crate::gain::plot::{NullPlotSink, PlotSink};
use crate::gain::{GainResult, ProbeSample};
use crate::sample::{ImageRecord, WellCoord};

/// Calculates gains for wells from their probe images.
pub struct GainService {
    gain_job_id: u32,
    ladder: Vec<(String, u32)>,
    channels: Vec<String>,
    save_dir: Option<PathBuf>,
    source: Arc<dyn HistogramSource>,
    samples: Option<Arc<dyn SampleStore>>,
    saved: Mutex<SavedGains>,
}

impl GainService {
    /// Service for the channels and gain ladder of `config`, reading histograms from `source`.
    pub fn new(config: &Config, source: Arc<dyn HistogramSource>) -> Self {
        Self {
            gain_job_id: config.production.gain_job_id,
            ladder: config.gain_ladder(),
            channels: config
                .production
                .channels
                .iter()
                .map(|spec| spec.channel_name.clone())
                .collect(),
            save_dir: config.gain.save_dir.clone(),
            source,
            samples: None,
            saved: Mutex::new(SavedGains::new()),
        }
    }

    /// Fall back to the images recorded in `samples` when called without images.
    pub fn with_sample_store(mut self, samples: Arc<dyn SampleStore>) -> Self {
        self.samples = Some(samples);
        self
    }

    /// Gains calculated so far, keyed by well name.
    pub fn saved_gains(&self) -> SavedGains {
        self.saved.lock().clone()
    }

    /// Pair histograms with the gain ladder, grouped by channel.
    ///
    /// Probe channels outside the ladder are ignored.
    pub fn probe_samples(&self, histograms: BTreeMap<u32, Histogram>) -> BTreeMap<String, Vec<ProbeSample>> {
        let mut samples: BTreeMap<String, Vec<ProbeSample>> = BTreeMap::new();
        for (probe_channel, histogram) in histograms {
            let Some((channel_name, candidate_gain)) = self.ladder.get(probe_channel as usize) else {
                warn!(probe_channel, "Probe channel is outside the gain ladder");
                continue;
            };
            samples
                .entry(channel_name.clone())
                .or_default()
                .push(ProbeSample {
                    channel_name: channel_name.clone(),
                    candidate_gain: *candidate_gain,
                    probe_channel,
                    histogram,
                });
        }
        samples
    }

    async fn probe_images(&self, well: &WellCoord, images: &[ImageRecord]) -> AppResult<Vec<ImageRecord>> {
        let images = match (&self.samples, images.is_empty()) {
            (Some(samples), true) => samples.well_images(well).await?,
            _ => images.to_vec(),
        };
        Ok(images
            .into_iter()
            .filter(|image| image.job_id == self.gain_job_id && image.well() == *well)
            .collect())
    }

    async fn save(&self) {
        let Some(save_dir) = &self.save_dir else {
            return;
        };
        let writer = GainTableWriter::new(save_dir);
        let gains = self.saved_gains();
        let channels = self.channels.clone();
        let written = tokio::task::spawn_blocking(move || writer.write(&gains, &channels)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "Failed to save gains table"),
            Err(err) => warn!(error = %err, "Gains table task failed"),
        }
    }
}

fn run_estimate(
    samples: BTreeMap<String, Vec<ProbeSample>>,
    plot_dir: Option<PathBuf>,
    well_name: String,
) -> BTreeMap<String, GainResult> {
    let sink = plot_sink(plot_dir, well_name);
    estimate_with_plots(&samples, sink.as_ref())
}

#[cfg(feature = "diagnostic_plots")]
fn plot_sink(plot_dir: Option<PathBuf>, well_name: String) -> Box<dyn PlotSink> {
    use crate::gain::plot::SvgPlotSink;

    match plot_dir {
        Some(dir) => {
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %err, "Failed to create plot directory");
                return Box::new(NullPlotSink);
            }
            Box::new(SvgPlotSink::new(dir, well_name))
        }
        None => Box::new(NullPlotSink),
    }
}

#[cfg(not(feature = "diagnostic_plots"))]
fn plot_sink(_plot_dir: Option<PathBuf>, _well_name: String) -> Box<dyn PlotSink> {
    Box::new(NullPlotSink)
}

#[async_trait]
impl GainCalculator for GainService {
    async fn calc_gain(
        &self,
        well: &WellCoord,
        images: &[ImageRecord],
    ) -> AppResult<BTreeMap<String, GainResult>> {
        let probe_images = self.probe_images(well, images).await?;
        let histograms = self.source.load(&probe_images).await?;
        debug!(
            %well,
            images = probe_images.len(),
            histograms = histograms.len(),
            "Loaded probe histograms"
        );

        let samples = self.probe_samples(histograms);
        let plot_dir = self.save_dir.as_ref().map(|dir| dir.join("plots"));
        let well_name = well.name();
        let estimates =
            tokio::task::spawn_blocking(move || run_estimate(samples, plot_dir, well_name)).await?;

        let results: BTreeMap<String, GainResult> = self
            .channels
            .iter()
            .map(|channel| {
                let result = estimates
                    .get(channel)
                    .cloned()
                    .unwrap_or_else(|| GainResult::undetermined(channel.clone()));
                (channel.clone(), result)
            })
            .collect();
        info!(
            %well,
            gains = ?results.values().map(|r| (&r.channel_name, r.gain)).collect::<Vec<_>>(),
            "Calculated gains"
        );

        self.saved.lock().insert(
            well.name(),
            results
                .iter()
                .map(|(channel, result)| (channel.clone(), result.gain))
                .collect(),
        );
        self.save().await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gain::histogram::StaticHistograms;

    const CONFIG: &str = r#"
        [production]
        gain_pattern_name = "p10xgain"
        gain_job_id = 3
        gain_job_channels = 3
        exp_pattern_name = "p10xexp"
        exp_job_ids = [3, 4, 6]
        well_layout = { x_fields = 2, y_fields = 1 }

        [[production.channels]]
        channel = "green"
        job_name = "green10x"
        detector_num = 1
        default_gain = 800
        max_gain = 800

        [[production.channels]]
        channel = "blue"
        job_name = "blue10x"
        detector_num = 1
        default_gain = 505
        max_gain = 610

        [[gain.channels]]
        channel = "blue"
        init_gain = [400]

        [[gain.channels]]
        channel = "green"
        init_gain = [450, 600]
    "#;

    fn service() -> GainService {
        let config = Config::from_toml_str(CONFIG).unwrap();
        let histograms = (0..3).map(|id| (id, Histogram::from_counts([100]))).collect();
        GainService::new(&config, Arc::new(StaticHistograms::new(histograms)))
    }

    #[test]
    fn test_probe_samples_follow_ladder() {
        let service = service();
        let histograms = (0..4).map(|id| (id, Histogram::default())).collect();

        let samples = service.probe_samples(histograms);

        assert_eq!(samples["blue"].len(), 1);
        assert_eq!(samples["blue"][0].candidate_gain, 400);
        let green: Vec<(u32, u32)> = samples["green"]
            .iter()
            .map(|s| (s.probe_channel, s.candidate_gain))
            .collect();
        assert_eq!(green, vec![(1, 450), (2, 600)]);
    }

    #[tokio::test]
    async fn test_every_configured_channel_gets_a_result() {
        let service = service();
        let well = WellCoord::new("00", 0, 0);

        let results = service.calc_gain(&well, &[]).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.values().all(|r| !r.is_determined()));
        assert_eq!(
            service.saved_gains()["U00--V00"],
            BTreeMap::from([("green".to_string(), None), ("blue".to_string(), None)])
        );
    }
}

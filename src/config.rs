//! Configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. A TOML (or YAML, by extension) file
//! 2. Environment variables prefixed with `CAMACQ_`, nested keys split on `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! CAMACQ_PLATE_NAME=01
//! CAMACQ_PRODUCTION__GAIN_JOB_ID=3
//! CAMACQ_GAIN__SAVE_DIR=/data/gains
//! ```
//!
//! # Example
//!
//! ```toml
//! [production]
//! gain_pattern_name = "p10xgain"
//! gain_job_id = 3
//! gain_job_channels = 32
//! exp_pattern_name = "p10xexp"
//! exp_job_ids = [3, 4, 6]
//! well_layout = { x_fields = 2, y_fields = 3 }
//!
//! [[production.channels]]
//! channel = "green"
//! job_name = "green10x"
//! detector_num = 1
//! default_gain = 800
//! max_gain = 800
//!
//! [[gain.channels]]
//! channel = "green"
//! init_gain = [450, 495, 540]
//! ```
//!
//! Loaded configuration is validated before any instrument command is issued.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, FlowError};
use crate::sample::{read_sample_state, SampleRecord};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Workflow settings
    pub production: ProductionConfig,
    /// Gain calculation settings
    pub gain: GainConfig,
    /// CSV file seeding the sample state and the wells to image
    #[serde(default)]
    pub sample_state_file: Option<PathBuf>,
    /// Plate imaged when no sample state file is given
    #[serde(default = "default_plate_name")]
    pub plate_name: String,
    /// Well grid imaged when no sample state file is given
    #[serde(default)]
    pub plate_layout: PlateLayout,
}

/// Workflow settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionConfig {
    /// Job pattern used for probe images
    pub gain_pattern_name: String,
    /// Job id of the probe images
    pub gain_job_id: u32,
    /// Number of probe channels (length of the flattened gain ladder)
    pub gain_job_channels: u32,
    /// Job pattern used for the full acquisition
    pub exp_pattern_name: String,
    /// Job ids of the full acquisition, in acquisition order
    pub exp_job_ids: [u32; 3],
    /// Channels in configured order; the last one completes a well's gain setup
    pub channels: Vec<ChannelSpec>,
    /// Field grid of a well
    pub well_layout: WellLayout,
}

impl ProductionConfig {
    /// Position and spec of a channel.
    pub fn channel(&self, channel_name: &str) -> Option<(usize, &ChannelSpec)> {
        self.channels
            .iter()
            .enumerate()
            .find(|(_, spec)| spec.channel_name == channel_name)
    }

    /// The last configured channel.
    pub fn last_channel(&self) -> Option<&ChannelSpec> {
        self.channels.last()
    }

    /// Job id whose images mark a field as done.
    pub fn last_exp_job_id(&self) -> u32 {
        self.exp_job_ids[2]
    }
}

/// One fluorescence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel name
    #[serde(rename = "channel")]
    pub channel_name: String,
    /// Acquisition job the channel's detector belongs to
    pub job_name: String,
    /// Detector number in the job
    #[serde(rename = "detector_num")]
    pub detector_number: u32,
    /// Gain used when no gain could be calculated
    pub default_gain: u32,
    /// Gain is never programmed above this
    pub max_gain: u32,
}

impl ChannelSpec {
    /// Gain to program for a calculated estimate.
    ///
    /// Undetermined estimates fall back to the default; the result never
    /// exceeds `max_gain`.
    pub fn clamp_gain(&self, estimate: Option<u32>) -> u32 {
        estimate.unwrap_or(self.default_gain).min(self.max_gain)
    }
}

/// Field grid of a well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellLayout {
    /// Field columns
    pub x_fields: u32,
    /// Field rows
    pub y_fields: u32,
}

/// Well grid of a plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateLayout {
    /// Well columns
    #[serde(default = "default_x_wells")]
    pub x_wells: u32,
    /// Well rows
    #[serde(default = "default_y_wells")]
    pub y_wells: u32,
}

impl Default for PlateLayout {
    fn default() -> Self {
        Self {
            x_wells: default_x_wells(),
            y_wells: default_y_wells(),
        }
    }
}

/// Gain calculation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainConfig {
    /// Probe gain ladder per channel
    pub channels: Vec<GainLadder>,
    /// Directory for the saved gains table and plots
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
}

/// Candidate gains probed for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GainLadder {
    /// Channel name
    pub channel: String,
    /// Gains, one probe channel each
    pub init_gain: Vec<u32>,
}

fn default_plate_name() -> String {
    "00".to_string()
}

fn default_x_wells() -> u32 {
    12
}

fn default_y_wells() -> u32 {
    8
}

impl Config {
    /// Load and validate configuration from a file, with environment overrides.
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, everything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Config`] if the file can not be read or deserialized and
    /// [`FlowError::Configuration`] if it fails validation.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        let figment = if is_yaml {
            Figment::new().merge(Yaml::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        let config: Self = figment
            .merge(Env::prefixed("CAMACQ_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - At least one channel, with unique names
    /// - A field grid with at least two columns (two probe fields) and one row
    /// - Three distinct acquisition job ids
    /// - The gain ladder covers exactly `gain_job_channels` probe channels
    /// - Gain ladder channels match the production channels
    /// - `save_dir`, if given, is an existing directory
    pub fn validate(&self) -> AppResult<()> {
        let production = &self.production;
        if production.channels.is_empty() {
            return Err(FlowError::Configuration(
                "production.channels must not be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for spec in &production.channels {
            if !names.insert(spec.channel_name.as_str()) {
                return Err(FlowError::Configuration(format!(
                    "Duplicate channel '{}'",
                    spec.channel_name
                )));
            }
        }

        let layout = production.well_layout;
        if layout.x_fields < 2 || layout.y_fields < 1 {
            return Err(FlowError::Configuration(format!(
                "Invalid well_layout {}x{}. Need at least 2 field columns and 1 field row",
                layout.x_fields, layout.y_fields
            )));
        }

        let [first, second, third] = production.exp_job_ids;
        if first == second || second == third || first == third {
            return Err(FlowError::Configuration(format!(
                "exp_job_ids must be distinct, got {:?}",
                production.exp_job_ids
            )));
        }

        if production.gain_job_channels == 0 {
            return Err(FlowError::Configuration(
                "gain_job_channels must be at least 1".to_string(),
            ));
        }
        let ladder_len: usize = self.gain.channels.iter().map(|c| c.init_gain.len()).sum();
        if ladder_len != production.gain_job_channels as usize {
            return Err(FlowError::Configuration(format!(
                "Gain ladder has {ladder_len} gains but gain_job_channels is {}",
                production.gain_job_channels
            )));
        }

        let ladder_names: HashSet<&str> =
            self.gain.channels.iter().map(|c| c.channel.as_str()).collect();
        if ladder_names != names || ladder_names.len() != self.gain.channels.len() {
            return Err(FlowError::Configuration(format!(
                "Gain ladder channels {:?} do not match production channels {:?}",
                self.gain.channels.iter().map(|c| &c.channel).collect::<Vec<_>>(),
                production
                    .channels
                    .iter()
                    .map(|c| &c.channel_name)
                    .collect::<Vec<_>>()
            )));
        }

        if let Some(dir) = &self.gain.save_dir {
            if !dir.is_dir() {
                return Err(FlowError::Configuration(format!(
                    "save_dir {} is not an existing directory",
                    dir.display()
                )));
            }
        }

        if self.plate_layout.x_wells == 0 || self.plate_layout.y_wells == 0 {
            return Err(FlowError::Configuration(
                "plate_layout must have at least one well".to_string(),
            ));
        }

        Ok(())
    }

    /// `(channel_name, candidate_gain)` per probe channel id, in ladder order.
    pub fn gain_ladder(&self) -> Vec<(String, u32)> {
        self.gain
            .channels
            .iter()
            .flat_map(|ladder| {
                ladder
                    .init_gain
                    .iter()
                    .map(move |gain| (ladder.channel.clone(), *gain))
            })
            .collect()
    }

    /// Initial sample state: the sample state file, or every well of the default plate.
    pub fn sample_records(&self) -> AppResult<Vec<SampleRecord>> {
        match &self.sample_state_file {
            Some(path) => read_sample_state(path),
            None => Ok((0..self.plate_layout.x_wells)
                .flat_map(|well_x| {
                    (0..self.plate_layout.y_wells)
                        .map(move |well_y| SampleRecord::well(self.plate_name.clone(), well_x, well_y))
                })
                .collect()),
        }
    }
}

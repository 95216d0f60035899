//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rust_camacq::config::Config;
use rust_camacq::event::Event;
use rust_camacq::gain::histogram::Histogram;
use rust_camacq::sample::{FieldCoord, ImageRecord, WellCoord};

/// Probe ladders, in probe channel order.
pub const LADDERS: [(&str, &[u32]); 4] = [
    ("green", &[450, 495, 540, 585, 630, 675, 720, 765, 810, 855, 900]),
    ("blue", &[400, 435, 470, 505, 540, 575, 610]),
    ("yellow", &[550, 585, 620, 655, 690, 725, 760]),
    ("red", &[525, 560, 595, 630, 665, 700, 735]),
];

/// Gain at which each channel's synthetic tail ends at box 255.
pub const TARGETS: [(&str, u32); 4] = [("green", 740), ("blue", 480), ("yellow", 805), ("red", 745)];

/// Four channels, a 2x3 field grid and the ladders above.
pub fn config_toml(save_dir: Option<&Path>) -> String {
    let save_dir = save_dir
        .map(|dir| format!("save_dir = {:?}\n", dir.display().to_string()))
        .unwrap_or_default();
    let ladders: String = LADDERS
        .iter()
        .map(|(channel, gains)| {
            format!("[[gain.channels]]\nchannel = \"{channel}\"\ninit_gain = {gains:?}\n\n")
        })
        .collect();
    format!(
        r#"
plate_name = "00"

[production]
gain_pattern_name = "p10xgain"
gain_job_id = 3
gain_job_channels = 32
exp_pattern_name = "p10xexp"
exp_job_ids = [3, 4, 6]
well_layout = {{ x_fields = 2, y_fields = 3 }}

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

[[production.channels]]
channel = "yellow"
job_name = "blue10x"
detector_num = 2
default_gain = 695
max_gain = 800

[[production.channels]]
channel = "red"
job_name = "red10x"
detector_num = 2
default_gain = 700
max_gain = 800

[gain]
{save_dir}
{ladders}"#
    )
}

pub fn config() -> Config {
    Config::from_toml_str(&config_toml(None)).unwrap()
}

/// Histogram with a 4th power tail ending near `box_end`.
pub fn tail_histogram(box_end: f64) -> Histogram {
    Histogram::from_counts((0..256u32).map(|bin| {
        if bin == 0 {
            50_000
        } else {
            (2.0 * (box_end / f64::from(bin)).powi(4) + 0.5).floor() as u64
        }
    }))
}

/// Probe histograms for all 32 probe channels, tails ending at `255 * (gain / target)^2`.
pub fn probe_histograms() -> BTreeMap<u32, Histogram> {
    let targets: BTreeMap<&str, u32> = TARGETS.into_iter().collect();
    let mut histograms = BTreeMap::new();
    let mut probe_channel = 0;
    for (channel, gains) in LADDERS {
        for &gain in gains {
            let ratio = f64::from(gain) / f64::from(targets[channel]);
            histograms.insert(probe_channel, tail_histogram(255.0 * ratio * ratio));
            probe_channel += 1;
        }
    }
    histograms
}

pub fn image(well: &WellCoord, field: FieldCoord, job_id: u32, channel_id: u32) -> ImageRecord {
    ImageRecord {
        path: PathBuf::from(format!(
            "/data/image--U{:02}--V{:02}--E{job_id:02}--X{:02}--Y{:02}--Z00--C{channel_id:02}.ome.tif",
            well.well_x, well.well_y, field.field_x, field.field_y
        )),
        plate_name: well.plate_name.clone(),
        well_x: well.well_x,
        well_y: well.well_y,
        field_x: field.field_x,
        field_y: field.field_y,
        job_id,
        channel_id,
        z_slice: 0,
    }
}

pub fn image_event(well: &WellCoord, field: FieldCoord, job_id: u32, channel_id: u32) -> Event {
    Event::ImageArrived(image(well, field, job_id, channel_id))
}

//! Field selection and image naming rules.

use crate::config::WellLayout;
use crate::sample::FieldCoord;

/// Field whose last probe image triggers the gain calculation.
///
/// This is the right-hand one of the two most centered fields.
pub fn gain_trigger_field(layout: &WellLayout) -> FieldCoord {
    FieldCoord::new(layout.x_fields.div_ceil(2), layout.y_fields.div_ceil(2).saturating_sub(1))
}

/// The two most centered fields of a well, imaged at every probe gain.
pub fn probe_fields(layout: &WellLayout) -> [FieldCoord; 2] {
    let last = gain_trigger_field(layout);
    [
        FieldCoord::new(last.field_x.saturating_sub(1), last.field_y),
        last,
    ]
}

/// Every field of a well, column by column.
pub fn acquisition_fields(layout: &WellLayout) -> impl Iterator<Item = FieldCoord> + '_ {
    (0..layout.x_fields)
        .flat_map(move |field_x| (0..layout.y_fields).map(move |field_y| FieldCoord::new(field_x, field_y)))
}

/// Output channel of an acquisition image.
///
/// The instrument multiplexes four output channels over the three acquisition
/// jobs:
///
/// | job            | channel | output |
/// |----------------|---------|--------|
/// | `exp_job_ids[0]` | 0 / 1 | 0 / 1  |
/// | `exp_job_ids[1]` | 0     | 1      |
/// | `exp_job_ids[1]` | 1     | 2      |
/// | `exp_job_ids[2]` | 0 / 1 | 3      |
///
/// Every other combination has no output channel and is not renamed.
pub fn output_channel(exp_job_ids: &[u32; 3], job_id: u32, channel_id: u32) -> Option<u32> {
    if channel_id > 1 {
        return None;
    }
    match exp_job_ids.iter().position(|&id| id == job_id)? {
        0 => Some(channel_id),
        1 => Some(channel_id + 1),
        _ => Some(3),
    }
}

/// Canonical name of an acquisition image.
pub fn image_name(
    well_x: u32,
    well_y: u32,
    job_id: u32,
    field: FieldCoord,
    z_slice: u32,
    channel: u32,
) -> String {
    format!(
        "U{well_x:02}--V{well_y:02}--E{job_id:02}--X{:02}--Y{:02}--Z{z_slice:02}--C{channel:02}.ome.tif",
        field.field_x, field.field_y
    )
}

/// Coordinates parsed from an instrument image file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageNameParts {
    /// `U` well column
    pub well_x: u32,
    /// `V` well row
    pub well_y: u32,
    /// `E` job id
    pub job_id: u32,
    /// `X` field column
    pub field_x: u32,
    /// `Y` field row
    pub field_y: u32,
    /// `Z` z-slice
    pub z_slice: u32,
    /// `C` channel id
    pub channel_id: u32,
}

/// Parse a `--`-separated image name such as
/// `image--L0000--S00--U00--V01--J08--E03--O00--X01--Y00--T0000--Z00--C31.ome.tif`.
///
/// Tags the name does not contain stay zero; a name without a `C` tag is rejected.
pub fn parse_image_name(file_name: &str) -> Option<ImageNameParts> {
    let stem = file_name.split('.').next()?;
    let mut parts = ImageNameParts::default();
    let mut has_channel = false;
    for segment in stem.split("--") {
        let mut chars = segment.chars();
        let Some(tag) = chars.next() else {
            continue;
        };
        let Ok(value) = chars.as_str().parse::<u32>() else {
            continue;
        };
        match tag {
            'U' => parts.well_x = value,
            'V' => parts.well_y = value,
            'E' => parts.job_id = value,
            'X' => parts.field_x = value,
            'Y' => parts.field_y = value,
            'Z' => parts.z_slice = value,
            'C' => {
                parts.channel_id = value;
                has_channel = true;
            }
            _ => {}
        }
    }
    has_channel.then_some(parts)
}

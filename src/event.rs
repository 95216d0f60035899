//! Typed events exchanged with the instrument and the sample store.
//!
//! Every event kind has a fixed record type. Events serialize as internally
//! tagged JSON, e.g.
//!
//! ```json
//! {"type": "gain_estimated", "plate_name": "00", "well_x": 0, "well_y": 1,
//!  "channel_name": "green", "gain": 740}
//! ```
//!
//! Missing or unknown fields are rejected when an event is decoded.

use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::sample::{FieldCoord, ImageRecord, WellCoord};

/// Discriminant of [`Event`], used to subscribe to one kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The run was started
    Start,
    /// A field of a well was updated
    WellUpdated,
    /// A channel of a well was updated
    ChannelUpdated,
    /// An image arrived from the instrument
    ImageArrived,
    /// A gain was calculated for a channel of a well
    GainEstimated,
}

/// An event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Starts the run.
    Start,
    /// A field of a well was set; `done` tells whether the whole well is imaged.
    WellUpdated(WellEvent),
    /// A channel of a well was set.
    ChannelUpdated(ChannelEvent),
    /// The instrument wrote an image.
    ImageArrived(ImageRecord),
    /// A gain calculation finished for one channel.
    GainEstimated(GainEvent),
}

impl Event {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Start => EventKind::Start,
            Event::WellUpdated(_) => EventKind::WellUpdated,
            Event::ChannelUpdated(_) => EventKind::ChannelUpdated,
            Event::ImageArrived(_) => EventKind::ImageArrived,
            Event::GainEstimated(_) => EventKind::GainEstimated,
        }
    }

    /// Decode one JSON event.
    pub fn from_json(line: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Payload of a well update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WellEvent {
    /// Plate name
    pub plate_name: String,
    /// Well column
    pub well_x: u32,
    /// Well row
    pub well_y: u32,
    /// Field column that was updated
    pub field_x: u32,
    /// Field row that was updated
    pub field_y: u32,
    /// All fields of the well are imaged
    pub done: bool,
}

impl WellEvent {
    /// Update of `field` in `well`.
    pub fn new(well: &WellCoord, field: FieldCoord, done: bool) -> Self {
        Self {
            plate_name: well.plate_name.clone(),
            well_x: well.well_x,
            well_y: well.well_y,
            field_x: field.field_x,
            field_y: field.field_y,
            done,
        }
    }

    /// The updated well.
    pub fn well(&self) -> WellCoord {
        WellCoord::new(self.plate_name.clone(), self.well_x, self.well_y)
    }

    /// The updated field.
    pub fn field(&self) -> FieldCoord {
        FieldCoord::new(self.field_x, self.field_y)
    }
}

/// Payload of a channel update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelEvent {
    /// Plate name
    pub plate_name: String,
    /// Well column
    pub well_x: u32,
    /// Well row
    pub well_y: u32,
    /// Updated channel
    pub channel_name: String,
}

impl ChannelEvent {
    /// Update of `channel_name` in `well`.
    pub fn new(well: &WellCoord, channel_name: impl Into<String>) -> Self {
        Self {
            plate_name: well.plate_name.clone(),
            well_x: well.well_x,
            well_y: well.well_y,
            channel_name: channel_name.into(),
        }
    }

    /// The updated well.
    pub fn well(&self) -> WellCoord {
        WellCoord::new(self.plate_name.clone(), self.well_x, self.well_y)
    }
}

/// Payload of a finished gain calculation.
///
/// `gain` is required but may be `null`, meaning undetermined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GainEvent {
    /// Plate name
    pub plate_name: String,
    /// Well column
    pub well_x: u32,
    /// Well row
    pub well_y: u32,
    /// Channel the gain is for
    pub channel_name: String,
    /// Calculated gain, `None` if undetermined
    #[serde(deserialize_with = "required_option")]
    pub gain: Option<u32>,
}

impl GainEvent {
    /// Calculated gain for `channel_name` in `well`.
    pub fn new(well: &WellCoord, channel_name: impl Into<String>, gain: Option<u32>) -> Self {
        Self {
            plate_name: well.plate_name.clone(),
            well_x: well.well_x,
            well_y: well.well_y,
            channel_name: channel_name.into(),
            gain,
        }
    }

    /// The well the gain is for.
    pub fn well(&self) -> WellCoord {
        WellCoord::new(self.plate_name.clone(), self.well_x, self.well_y)
    }
}

/// Deserialize an `Option` whose key must be present (`null` allowed).
fn required_option<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<u32>::deserialize(deserializer)
}

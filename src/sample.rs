//! Sample state: plates, wells, fields, channels and images.
//!
//! The workflow only consumes the sample store through the
//! [`SampleStore`](crate::core::SampleStore) trait. [`InMemorySampleStore`] is
//! the implementation used by the CLI and the tests. Like a real store it
//! publishes `channel_updated` after a channel is set and `well_updated` after a
//! field is set, which is what drives the later workflow rules.
//!
//! Sample state can be seeded from a CSV file with one row per sample:
//!
//! ```text
//! name,plate_name,well_x,well_y,field_x,field_y
//! field,00,0,0,0,0
//! well,00,0,1
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::{EventBus, Subscription};
use crate::core::SampleStore;
use crate::error::{AppResult, FlowError};
use crate::event::{ChannelEvent, Event, EventKind, WellEvent};

// =============================================================================
// Coordinates
// =============================================================================

/// Identifies a well on a plate.
///
/// Ordering is `(plate_name, well_x, well_y)`, which is the order wells are imaged in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WellCoord {
    /// Plate name
    pub plate_name: String,
    /// Well column, zero-based
    pub well_x: u32,
    /// Well row, zero-based
    pub well_y: u32,
}

impl WellCoord {
    /// Create a well coordinate.
    pub fn new(plate_name: impl Into<String>, well_x: u32, well_y: u32) -> Self {
        Self {
            plate_name: plate_name.into(),
            well_x,
            well_y,
        }
    }

    /// Well name used in file names and the saved gains table: `U{xx}--V{yy}`.
    pub fn name(&self) -> String {
        format!("U{:02}--V{:02}", self.well_x, self.well_y)
    }
}

impl fmt::Display for WellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plate_name, self.name())
    }
}

/// Identifies a field inside a well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldCoord {
    /// Field column, zero-based
    pub field_x: u32,
    /// Field row, zero-based
    pub field_y: u32,
}

impl FieldCoord {
    /// Create a field coordinate.
    pub const fn new(field_x: u32, field_y: u32) -> Self {
        Self { field_x, field_y }
    }
}

/// An image written by the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageRecord {
    /// Location of the image file
    pub path: PathBuf,
    /// Plate name
    pub plate_name: String,
    /// Well column
    pub well_x: u32,
    /// Well row
    pub well_y: u32,
    /// Field column
    pub field_x: u32,
    /// Field row
    pub field_y: u32,
    /// Instrument job that produced the image
    pub job_id: u32,
    /// Channel within the job
    pub channel_id: u32,
    /// Z-slice index
    pub z_slice: u32,
}

impl ImageRecord {
    /// Well the image belongs to.
    pub fn well(&self) -> WellCoord {
        WellCoord::new(self.plate_name.clone(), self.well_x, self.well_y)
    }

    /// Field the image belongs to.
    pub fn field(&self) -> FieldCoord {
        FieldCoord::new(self.field_x, self.field_y)
    }
}

// =============================================================================
// Sample state records
// =============================================================================

/// Kind of a sample state row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// A well, optionally without any field
    Well,
    /// A field of a well
    Field,
    /// A channel slot of a well
    Channel,
}

/// One row of a sample state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Row kind
    pub name: SampleKind,
    /// Plate name
    pub plate_name: String,
    /// Well column
    pub well_x: u32,
    /// Well row
    pub well_y: u32,
    /// Field column, required for field rows
    #[serde(default)]
    pub field_x: Option<u32>,
    /// Field row, required for field rows
    #[serde(default)]
    pub field_y: Option<u32>,
    /// Channel slot, required for channel rows
    #[serde(default)]
    pub channel_id: Option<u32>,
    /// Channel name
    #[serde(default)]
    pub channel_name: Option<String>,
    /// Channel gain
    #[serde(default)]
    pub gain: Option<u32>,
    /// Whether the field has been imaged
    #[serde(default)]
    pub img_ok: Option<bool>,
}

impl SampleRecord {
    /// A well row.
    pub fn well(plate_name: impl Into<String>, well_x: u32, well_y: u32) -> Self {
        Self {
            name: SampleKind::Well,
            plate_name: plate_name.into(),
            well_x,
            well_y,
            field_x: None,
            field_y: None,
            channel_id: None,
            channel_name: None,
            gain: None,
            img_ok: None,
        }
    }

    /// Well the row belongs to.
    pub fn well_coord(&self) -> WellCoord {
        WellCoord::new(self.plate_name.clone(), self.well_x, self.well_y)
    }

    /// Check that the row carries the coordinates its kind needs.
    pub fn validate(&self) -> Result<(), String> {
        match self.name {
            SampleKind::Well => Ok(()),
            SampleKind::Field if self.field_x.is_none() || self.field_y.is_none() => {
                Err("field rows need field_x and field_y".to_string())
            }
            SampleKind::Field => Ok(()),
            SampleKind::Channel if self.channel_id.is_none() => {
                Err("channel rows need channel_id".to_string())
            }
            SampleKind::Channel => Ok(()),
        }
    }
}

/// Read and validate a sample state CSV file.
///
/// Any invalid row is an error naming the row (the header is row 1).
#[cfg(feature = "storage_csv")]
pub fn read_sample_state(path: &Path) -> AppResult<Vec<SampleRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut records = Vec::new();
    for (idx, row) in reader.deserialize::<SampleRecord>().enumerate() {
        let row_number = idx + 2;
        let record = row.map_err(|err| {
            FlowError::Configuration(format!(
                "sample state file {} has invalid data at row {row_number}: {err}",
                path.display()
            ))
        })?;
        record.validate().map_err(|reason| {
            FlowError::Configuration(format!(
                "sample state file {} has invalid data at row {row_number}: {reason}",
                path.display()
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Sample state files need CSV support.
#[cfg(not(feature = "storage_csv"))]
pub fn read_sample_state(_path: &Path) -> AppResult<Vec<SampleRecord>> {
    Err(FlowError::FeatureNotEnabled("storage_csv".to_string()))
}

// =============================================================================
// In-memory store
// =============================================================================

/// Stored state of a channel slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRecord {
    /// Channel name
    pub channel_name: Option<String>,
    /// Programmed gain
    pub gain: Option<u32>,
}

/// Stored state of a well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WellRecord {
    /// Known fields and whether they have been imaged
    pub fields: BTreeMap<FieldCoord, bool>,
    /// Channel slots by channel id
    pub channels: BTreeMap<u32, ChannelRecord>,
    /// Images by path
    pub images: BTreeMap<PathBuf, ImageRecord>,
}

impl WellRecord {
    /// All known fields are imaged.
    pub fn img_ok(&self) -> bool {
        !self.fields.is_empty() && self.fields.values().all(|ok| *ok)
    }
}

/// Sample store kept in memory.
#[derive(Default)]
pub struct InMemorySampleStore {
    wells: Mutex<BTreeMap<WellCoord, WellRecord>>,
    bus: Option<Arc<EventBus>>,
}

impl InMemorySampleStore {
    /// A store that publishes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that publishes its updates on `bus`.
    pub fn with_bus(bus: Arc<EventBus>) -> Self {
        Self {
            wells: Mutex::new(BTreeMap::new()),
            bus: Some(bus),
        }
    }

    /// Apply sample state records without publishing events.
    pub fn load(&self, records: &[SampleRecord]) {
        let mut wells = self.wells.lock();
        for record in records {
            let well = wells.entry(record.well_coord()).or_default();
            match record.name {
                SampleKind::Well => {}
                SampleKind::Field => {
                    if let (Some(field_x), Some(field_y)) = (record.field_x, record.field_y) {
                        well.fields
                            .insert(FieldCoord::new(field_x, field_y), record.img_ok.unwrap_or(false));
                    }
                }
                SampleKind::Channel => {
                    if let Some(channel_id) = record.channel_id {
                        let channel = well.channels.entry(channel_id).or_default();
                        channel.channel_name = record.channel_name.clone().or(channel.channel_name.take());
                        channel.gain = record.gain.or(channel.gain);
                    }
                }
            }
        }
        debug!(wells = wells.len(), "Loaded sample state");
    }

    /// Record an image without publishing events.
    pub fn add_image(&self, image: ImageRecord) {
        self.wells
            .lock()
            .entry(image.well())
            .or_default()
            .images
            .insert(image.path.clone(), image);
    }

    /// Snapshot of a well.
    pub fn well(&self, well: &WellCoord) -> Option<WellRecord> {
        self.wells.lock().get(well).cloned()
    }

    /// All wells known to the store, in imaging order.
    pub fn wells(&self) -> Vec<WellCoord> {
        self.wells.lock().keys().cloned().collect()
    }

    /// Record every image arriving on `bus`.
    pub fn track_images(self: &Arc<Self>, bus: &Arc<EventBus>) -> Subscription {
        let store = Arc::downgrade(self);
        bus.register(EventKind::ImageArrived, "sample_store_images", move |event| {
            let store = store.clone();
            async move {
                if let (Some(store), Event::ImageArrived(image)) = (store.upgrade(), event) {
                    store.add_image(image);
                }
                Ok(())
            }
        })
    }

    async fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.notify(event).await;
        }
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn set_channel(
        &self,
        well: &WellCoord,
        channel_id: u32,
        channel_name: &str,
        gain: u32,
    ) -> AppResult<()> {
        {
            let mut wells = self.wells.lock();
            let channel = wells
                .entry(well.clone())
                .or_default()
                .channels
                .entry(channel_id)
                .or_default();
            channel.channel_name = Some(channel_name.to_string());
            channel.gain = Some(gain);
        }
        self.publish(Event::ChannelUpdated(ChannelEvent::new(well, channel_name)))
            .await;
        Ok(())
    }

    async fn set_field(&self, well: &WellCoord, field: FieldCoord, img_ok: bool) -> AppResult<()> {
        let done = {
            let mut wells = self.wells.lock();
            let record = wells.entry(well.clone()).or_default();
            record.fields.insert(field, img_ok);
            record.img_ok()
        };
        self.publish(Event::WellUpdated(WellEvent::new(well, field, done)))
            .await;
        Ok(())
    }

    async fn well_images(&self, well: &WellCoord) -> AppResult<Vec<ImageRecord>> {
        Ok(self
            .wells
            .lock()
            .get(well)
            .map(|record| record.images.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(path: &str, channel_id: u32) -> ImageRecord {
        ImageRecord {
            path: PathBuf::from(path),
            plate_name: "00".to_string(),
            well_x: 1,
            well_y: 0,
            field_x: 0,
            field_y: 0,
            job_id: 3,
            channel_id,
            z_slice: 0,
        }
    }

    #[test]
    fn test_well_name_is_zero_padded() {
        assert_eq!(WellCoord::new("00", 3, 11).name(), "U03--V11");
        assert_eq!(WellCoord::new("00", 3, 11).to_string(), "00/U03--V11");
    }

    #[test]
    fn test_well_order_is_x_then_y() {
        let mut wells = vec![
            WellCoord::new("00", 1, 0),
            WellCoord::new("00", 0, 1),
            WellCoord::new("00", 0, 0),
        ];
        wells.sort();
        assert_eq!(
            wells,
            vec![
                WellCoord::new("00", 0, 0),
                WellCoord::new("00", 0, 1),
                WellCoord::new("00", 1, 0),
            ]
        );
    }

    #[test]
    fn test_record_validation() {
        let mut record = SampleRecord::well("00", 0, 0);
        assert!(record.validate().is_ok());
        record.name = SampleKind::Field;
        assert!(record.validate().is_err());
        record.field_x = Some(0);
        record.field_y = Some(1);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_image_record_rejects_unknown_fields() {
        let json = r#"{"path":"a.tif","plate_name":"00","well_x":0,"well_y":0,"field_x":0,
            "field_y":0,"job_id":3,"channel_id":0,"z_slice":0,"colour":"red"}"#;
        assert!(serde_json::from_str::<ImageRecord>(json).is_err());
    }

    #[tokio::test]
    async fn test_load_is_silent_and_tracks_fields() {
        let bus = Arc::new(EventBus::new());
        let store = InMemorySampleStore::with_bus(bus);
        let mut field = SampleRecord::well("00", 0, 0);
        field.name = SampleKind::Field;
        field.field_x = Some(0);
        field.field_y = Some(0);
        store.load(&[field, SampleRecord::well("00", 0, 1)]);

        assert_eq!(store.wells().len(), 2);
        let well = store.well(&WellCoord::new("00", 0, 0)).unwrap();
        assert_eq!(well.fields.get(&FieldCoord::new(0, 0)), Some(&false));
        assert!(!well.img_ok());
    }

    #[tokio::test]
    async fn test_set_field_reports_done_once_all_fields_ok() {
        let store = InMemorySampleStore::new();
        let well = WellCoord::new("00", 0, 0);
        store.set_field(&well, FieldCoord::new(0, 0), true).await.unwrap();
        store.set_field(&well, FieldCoord::new(0, 1), false).await.unwrap();
        assert!(!store.well(&well).unwrap().img_ok());
        store.set_field(&well, FieldCoord::new(0, 1), true).await.unwrap();
        assert!(store.well(&well).unwrap().img_ok());
    }

    #[tokio::test]
    async fn test_well_images() {
        let store = InMemorySampleStore::new();
        store.add_image(image("b.tif", 1));
        store.add_image(image("a.tif", 0));
        store.add_image(image("a.tif", 0));

        let images = store.well_images(&WellCoord::new("00", 1, 0)).await.unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].path, PathBuf::from("a.tif"));
        assert!(store
            .well_images(&WellCoord::new("00", 5, 5))
            .await
            .unwrap()
            .is_empty());
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_read_sample_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.csv");
        std::fs::write(
            &path,
            "name,plate_name,well_x,well_y,field_x,field_y\n\
             field,00,0,0,0,0\n\
             field,00,0,0,0,1\n\
             well,00,0,1\n\
             well,00,1,0\n",
        )
        .unwrap();

        let records = read_sample_state(&path).unwrap();

        assert_eq!(records.len(), 4);
        assert_eq!(records[0].name, SampleKind::Field);
        assert_eq!(records[1].field_y, Some(1));
        assert_eq!(records[2].well_coord(), WellCoord::new("00", 0, 1));
        assert_eq!(records[3].field_x, None);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_read_sample_state_reports_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.csv");
        std::fs::write(
            &path,
            "name,plate_name,well_x,well_y,field_x,field_y\nwell,00,0,0\nfield,00,0,1\n",
        )
        .unwrap();

        let err = read_sample_state(&path).unwrap_err();

        assert!(err.to_string().contains("row 3"), "{err}");
    }
}

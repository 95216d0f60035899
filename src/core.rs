//! Core collaborator traits of the acquisition workflow.
//!
//! The workflow engine never talks to hardware, storage or the gain calculation
//! directly. It drives three outbound collaborators:
//!
//! - [`Instrument`]: command transport to the microscope
//! - [`SampleStore`]: plate/well/field/channel state
//! - [`GainCalculator`]: turns a well's probe images into gains
//!
//! # Data Flow
//!
//! ```text
//! instrument --[Event]--> EventBus --> WorkflowEngine --[commands]--> Instrument
//!                                            |--[set_channel/set_field]--> SampleStore --[Event]--> EventBus
//!                                            '--[calc_gain]--> GainCalculator
//! ```
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync` so one instance can be shared by every
//! event handler task.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::gain::GainResult;
use crate::sample::{FieldCoord, ImageRecord, WellCoord};

/// Command transport to the microscope.
///
/// Implementations must acknowledge a command before returning, so that
/// awaiting each call keeps commands in program order.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Send a single command.
    async fn send_command(&self, command: &str) -> AppResult<()>;

    /// Send a batch of commands in order.
    async fn send_commands(&self, commands: &[String]) -> AppResult<()> {
        for command in commands {
            self.send_command(command).await?;
        }
        Ok(())
    }

    /// Start imaging.
    async fn start_imaging(&self) -> AppResult<()>;

    /// Stop imaging.
    async fn stop_imaging(&self) -> AppResult<()>;

    /// Rename an image file in place, keeping its directory.
    async fn rename_image(&self, old_path: &Path, new_name: &str) -> AppResult<()> {
        let new_path = old_path.with_file_name(new_name);
        tokio::fs::rename(old_path, new_path).await?;
        Ok(())
    }
}

/// Plate/well/field/channel state store.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Record the gain programmed for a channel slot of a well.
    async fn set_channel(
        &self,
        well: &WellCoord,
        channel_id: u32,
        channel_name: &str,
        gain: u32,
    ) -> AppResult<()>;

    /// Record whether a field has been imaged.
    async fn set_field(&self, well: &WellCoord, field: FieldCoord, img_ok: bool) -> AppResult<()>;

    /// Images recorded for a well.
    async fn well_images(&self, well: &WellCoord) -> AppResult<Vec<ImageRecord>>;
}

/// Gain calculation for one well.
#[async_trait]
pub trait GainCalculator: Send + Sync {
    /// Calculate gains from the probe images of `well`, keyed by channel name.
    ///
    /// An empty `images` list means "use what the sample store has for the well".
    /// Undetermined gains are regular results, not errors.
    async fn calc_gain(
        &self,
        well: &WellCoord,
        images: &[ImageRecord],
    ) -> AppResult<BTreeMap<String, GainResult>>;
}

//! Simulated collaborators for tests and dry runs.
//!
//! - [`RecordingInstrument`] / [`RecordingSampleStore`] append every outbound
//!   action to a shared [`ActionLog`], so tests can assert on the exact order
//!   of instrument and sample store calls.
//! - [`DryRunInstrument`] logs commands through `tracing` and touches nothing.
//! - [`ScriptedGains`] returns fixed gains and remembers how many images each
//!   call was given.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::command::Command;
use crate::core::{GainCalculator, Instrument, SampleStore};
use crate::error::{AppResult, FlowError};
use crate::gain::GainResult;
use crate::sample::{FieldCoord, ImageRecord, WellCoord};

/// One outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `send_command`
    SendCommand(String),
    /// `send_commands`
    SendCommands(Vec<String>),
    /// `start_imaging`
    StartImaging,
    /// `stop_imaging`
    StopImaging,
    /// `rename_image`
    RenameImage {
        /// Image that was renamed
        old_path: PathBuf,
        /// New file name
        new_name: String,
    },
    /// `set_channel`
    SetChannel {
        /// Well of the channel
        well: WellCoord,
        /// Channel slot
        channel_id: u32,
        /// Channel name
        channel_name: String,
        /// Programmed gain
        gain: u32,
    },
    /// `set_field`
    SetField {
        /// Well of the field
        well: WellCoord,
        /// Field
        field: FieldCoord,
        /// Imaged
        img_ok: bool,
    },
}

/// Ordered, shared record of outbound calls.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    actions: Arc<Mutex<Vec<Action>>>,
}

impl ActionLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action.
    pub fn push(&self, action: Action) {
        self.actions.lock().push(action);
    }

    /// Copy of all actions so far.
    pub fn snapshot(&self) -> Vec<Action> {
        self.actions.lock().clone()
    }

    /// Number of recorded actions matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Action) -> bool) -> usize {
        self.actions.lock().iter().filter(|action| predicate(action)).count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.actions.lock().clear();
    }
}

/// Instrument that records every call.
#[derive(Debug, Clone, Default)]
pub struct RecordingInstrument {
    log: ActionLog,
    fail_commands: Arc<Mutex<bool>>,
}

impl RecordingInstrument {
    /// Record into `log`.
    pub fn new(log: ActionLog) -> Self {
        Self {
            log,
            fail_commands: Arc::new(Mutex::new(false)),
        }
    }

    /// Make command sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *self.fail_commands.lock() = failing;
    }

    fn check(&self) -> AppResult<()> {
        if *self.fail_commands.lock() {
            return Err(FlowError::Instrument("simulated transport failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Instrument for RecordingInstrument {
    async fn send_command(&self, command: &str) -> AppResult<()> {
        self.check()?;
        self.log.push(Action::SendCommand(command.to_string()));
        Ok(())
    }

    async fn send_commands(&self, commands: &[String]) -> AppResult<()> {
        self.check()?;
        self.log.push(Action::SendCommands(commands.to_vec()));
        Ok(())
    }

    async fn start_imaging(&self) -> AppResult<()> {
        self.check()?;
        self.log.push(Action::StartImaging);
        Ok(())
    }

    async fn stop_imaging(&self) -> AppResult<()> {
        self.check()?;
        self.log.push(Action::StopImaging);
        Ok(())
    }

    async fn rename_image(&self, old_path: &Path, new_name: &str) -> AppResult<()> {
        self.log.push(Action::RenameImage {
            old_path: old_path.to_path_buf(),
            new_name: new_name.to_string(),
        });
        Ok(())
    }
}

/// Instrument that only logs what it would do.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunInstrument;

#[async_trait]
impl Instrument for DryRunInstrument {
    async fn send_command(&self, command: &str) -> AppResult<()> {
        info!(command, "Send command");
        Ok(())
    }

    async fn send_commands(&self, commands: &[String]) -> AppResult<()> {
        info!(count = commands.len(), "Send commands");
        for command in commands {
            info!(command = %command, "  queued");
        }
        Ok(())
    }

    async fn start_imaging(&self) -> AppResult<()> {
        info!(command = %Command::StartScan, "Start imaging");
        Ok(())
    }

    async fn stop_imaging(&self) -> AppResult<()> {
        info!(command = %Command::StopScan, "Stop imaging");
        Ok(())
    }

    async fn rename_image(&self, old_path: &Path, new_name: &str) -> AppResult<()> {
        info!(from = %old_path.display(), to = new_name, "Rename image");
        Ok(())
    }
}

/// Sample store wrapper that records `set_channel`/`set_field` before delegating.
pub struct RecordingSampleStore<S> {
    inner: S,
    log: ActionLog,
}

impl<S: SampleStore> RecordingSampleStore<S> {
    /// Record into `log`, delegating to `inner`.
    pub fn new(inner: S, log: ActionLog) -> Self {
        Self { inner, log }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SampleStore> SampleStore for RecordingSampleStore<S> {
    async fn set_channel(
        &self,
        well: &WellCoord,
        channel_id: u32,
        channel_name: &str,
        gain: u32,
    ) -> AppResult<()> {
        self.log.push(Action::SetChannel {
            well: well.clone(),
            channel_id,
            channel_name: channel_name.to_string(),
            gain,
        });
        self.inner
            .set_channel(well, channel_id, channel_name, gain)
            .await
    }

    async fn set_field(&self, well: &WellCoord, field: FieldCoord, img_ok: bool) -> AppResult<()> {
        self.log.push(Action::SetField {
            well: well.clone(),
            field,
            img_ok,
        });
        self.inner.set_field(well, field, img_ok).await
    }

    async fn well_images(&self, well: &WellCoord) -> AppResult<Vec<ImageRecord>> {
        self.inner.well_images(well).await
    }
}

/// Gain calculator returning the same gains for every well.
#[derive(Debug, Default)]
pub struct ScriptedGains {
    gains: BTreeMap<String, Option<u32>>,
    image_counts: Mutex<Vec<usize>>,
}

impl ScriptedGains {
    /// Return `gains` (channel name to gain) on every call.
    pub fn new(gains: impl IntoIterator<Item = (String, Option<u32>)>) -> Self {
        Self {
            gains: gains.into_iter().collect(),
            image_counts: Mutex::new(Vec::new()),
        }
    }

    /// Number of calculations so far.
    pub fn calls(&self) -> usize {
        self.image_counts.lock().len()
    }

    /// Number of images handed to each calculation, in call order.
    pub fn image_counts(&self) -> Vec<usize> {
        self.image_counts.lock().clone()
    }
}

#[async_trait]
impl GainCalculator for ScriptedGains {
    async fn calc_gain(
        &self,
        _well: &WellCoord,
        images: &[ImageRecord],
    ) -> AppResult<BTreeMap<String, GainResult>> {
        self.image_counts.lock().push(images.len());
        // Let concurrent callers interleave like a real off-thread calculation
        tokio::task::yield_now().await;
        Ok(self
            .gains
            .iter()
            .map(|(channel, gain)| {
                (
                    channel.clone(),
                    GainResult {
                        channel_name: channel.clone(),
                        gain: *gain,
                    },
                )
            })
            .collect())
    }
}

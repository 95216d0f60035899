//! Event-driven plate workflow.
//!
//! [`WorkflowEngine`] sequences one plate run. Every event kind has one dispatch
//! method; the bus handlers installed by [`WorkflowEngine::install`] only forward
//! to them.
//!
//! | event             | dispatch                                   | rules |
//! |-------------------|--------------------------------------------|-------|
//! | `start`           | [`on_start`](WorkflowEngine::on_start)     | probe the first well |
//! | `well_updated`    | [`on_well_updated`](WorkflowEngine::on_well_updated) | probe the next well, or finish |
//! | `image_arrived`   | [`on_probe_image`](WorkflowEngine::on_probe_image) | collect probe images, calculate gains |
//! | `gain_estimated`  | [`on_gain_estimated`](WorkflowEngine::on_gain_estimated) | program and record a channel gain |
//! | `channel_updated` | [`on_channel_updated`](WorkflowEngine::on_channel_updated) | queue the full acquisition |
//! | `image_arrived`   | [`on_acquisition_image`](WorkflowEngine::on_acquisition_image) | rename images, mark fields done |
//!
//! Probe and acquisition jobs may share a job id, so the acquisition image
//! handler goes by the phase of the image's well: only wells that are acquiring
//! or complete get their images renamed. Late images of a completed well are
//! still renamed after the run moved on to the next well.
//!
//! # Concurrency
//!
//! Handlers run as independent tasks; only image events of the same well are
//! delivered in arrival order. A well's gain calculation runs under a
//! per-well lock; the set of wells still to image sits behind an async mutex
//! held from selecting a well until its probe jobs are queued. Duplicate and late
//! events are dropped at debug level.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Subscription};
use crate::command::Command;
use crate::config::ProductionConfig;
use crate::core::{GainCalculator, Instrument, SampleStore};
use crate::error::{AppResult, FlowError};
use crate::event::{ChannelEvent, Event, EventKind, GainEvent, WellEvent};
use crate::sample::{FieldCoord, ImageRecord, WellCoord};
use crate::workflow::lock::KeyedLock;
use crate::workflow::naming::{acquisition_fields, gain_trigger_field, image_name, output_channel, probe_fields};
use crate::workflow::state::{Phase, PlateState, RunState, WellState};

/// Outbound collaborators of the engine.
#[derive(Clone)]
pub struct Collaborators {
    /// Command transport to the microscope
    pub instrument: Arc<dyn Instrument>,
    /// Sample state store
    pub samples: Arc<dyn SampleStore>,
    /// Gain calculation action
    pub gains: Arc<dyn GainCalculator>,
}

/// State machine driving one plate run.
pub struct WorkflowEngine {
    this: Weak<WorkflowEngine>,
    config: ProductionConfig,
    bus: Arc<EventBus>,
    instrument: Arc<dyn Instrument>,
    samples: Arc<dyn SampleStore>,
    gains: Arc<dyn GainCalculator>,
    plate: tokio::sync::Mutex<PlateState>,
    wells: Mutex<HashMap<WellCoord, WellState>>,
    well_locks: KeyedLock<WellCoord>,
    imaging: AtomicBool,
    started: AtomicBool,
    run_state: watch::Sender<RunState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl WorkflowEngine {
    /// Engine for a plate with `wells` left to image.
    ///
    /// Nothing is subscribed until [`install`](Self::install) is called.
    pub fn new(
        config: ProductionConfig,
        bus: Arc<EventBus>,
        collaborators: Collaborators,
        wells: impl IntoIterator<Item = WellCoord>,
    ) -> Arc<Self> {
        let (run_state, _) = watch::channel(RunState::Running);
        let plate = PlateState::new(wells);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            bus,
            instrument: collaborators.instrument,
            samples: collaborators.samples,
            gains: collaborators.gains,
            plate: tokio::sync::Mutex::new(plate),
            wells: Mutex::new(HashMap::new()),
            well_locks: KeyedLock::new(),
            imaging: AtomicBool::new(false),
            started: AtomicBool::new(false),
            run_state,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe all handlers on the bus.
    pub fn install(&self) {
        let subscriptions = vec![
            self.subscribe(EventKind::Start, "workflow_start", |engine, _| async move {
                engine.on_start().await
            }),
            self.subscribe(EventKind::WellUpdated, "workflow_next_well", |engine, event| async move {
                match event {
                    Event::WellUpdated(update) => engine.on_well_updated(&update).await,
                    _ => Ok(()),
                }
            }),
            self.subscribe(EventKind::ImageArrived, "workflow_gain_probe", |engine, event| async move {
                match event {
                    Event::ImageArrived(image) => engine.on_probe_image(&image).await,
                    _ => Ok(()),
                }
            }),
            self.subscribe(EventKind::GainEstimated, "workflow_set_gain", |engine, event| async move {
                match event {
                    Event::GainEstimated(estimate) => engine.on_gain_estimated(&estimate).await,
                    _ => Ok(()),
                }
            }),
            self.subscribe(EventKind::ChannelUpdated, "workflow_acquire", |engine, event| async move {
                match event {
                    Event::ChannelUpdated(update) => engine.on_channel_updated(&update).await,
                    _ => Ok(()),
                }
            }),
            self.subscribe(EventKind::ImageArrived, "workflow_acquisition_image", |engine, event| async move {
                match event {
                    Event::ImageArrived(image) => engine.on_acquisition_image(&image).await,
                    _ => Ok(()),
                }
            }),
        ];
        self.subscriptions.lock().extend(subscriptions);
    }

    /// Unsubscribe every handler.
    pub fn shutdown(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
    }

    /// Watch the run state.
    pub fn run_state(&self) -> watch::Receiver<RunState> {
        self.run_state.subscribe()
    }

    /// Wait until the run has finished.
    pub async fn finished(&self) {
        let mut state = self.run_state.subscribe();
        // The sender lives as long as the engine, so this only fails once it is gone
        let _ = state.wait_for(|state| *state == RunState::Finished).await;
    }

    /// Snapshot of a well's progress.
    pub fn well_state(&self, well: &WellCoord) -> Option<WellState> {
        self.wells.lock().get(well).cloned()
    }

    /// Number of wells not yet dispatched.
    pub async fn wells_remaining(&self) -> usize {
        self.plate.lock().await.remaining()
    }

    /// Whether the engine started imaging and has not stopped it since.
    pub fn is_imaging(&self) -> bool {
        self.imaging.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Start the run by probing the first well.
    ///
    /// Only the first start event has an effect.
    pub async fn on_start(&self) -> AppResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Run already started, ignoring start event");
            return Ok(());
        }
        info!("Starting plate run");
        let result = self.advance(false).await;
        if result.is_err() {
            self.started.store(false, Ordering::SeqCst);
        }
        result
    }

    /// After a well's last field is imaged, probe the next well or finish the run.
    pub async fn on_well_updated(&self, update: &WellEvent) -> AppResult<()> {
        let layout = self.config.well_layout;
        let last_field = FieldCoord::new(layout.x_fields - 1, layout.y_fields - 1);
        if !update.done || update.field() != last_field {
            return Ok(());
        }

        let well = update.well();
        {
            let mut wells = self.wells.lock();
            let state = wells.entry(well.clone()).or_default();
            if state.handed_off {
                debug!(%well, "Well already handed off, ignoring duplicate update");
                return Ok(());
            }
            state.handed_off = true;
        }

        let result = self.advance(true).await;
        if result.is_err() {
            if let Some(state) = self.wells.lock().get_mut(&well) {
                state.handed_off = false;
            }
        }
        result
    }

    /// Collect probe images and calculate gains once the last probe image of a well arrived.
    pub async fn on_probe_image(&self, image: &ImageRecord) -> AppResult<()> {
        if image.job_id != self.config.gain_job_id {
            return Ok(());
        }
        let well = image.well();
        {
            let mut wells = self.wells.lock();
            let state = wells.entry(well.clone()).or_default();
            if state.accepts_probe() {
                state.record_probe_image(image.clone());
            }
        }

        let trigger_channel = self.config.gain_job_channels - 1;
        if image.field() != gain_trigger_field(&self.config.well_layout)
            || image.channel_id != trigger_channel
        {
            return Ok(());
        }

        let guard = self.well_locks.lock(&well).await;
        let probe_images = {
            let wells = self.wells.lock();
            let Some(state) = wells.get(&well) else {
                return Ok(());
            };
            if !state.accepts_probe() || state.all_gains_measured(self.config.channels.len()) {
                debug!(%well, phase = ?state.phase, "Gain already measured, ignoring probe image");
                return Ok(());
            }
            state.probe_images.clone()
        };

        self.stop_imaging().await?;
        info!(%well, images = probe_images.len(), "Calculating gains");
        let results = self.gains.calc_gain(&well, &probe_images).await?;
        self.wells
            .lock()
            .entry(well.clone())
            .or_default()
            .advance_to(Phase::GainMeasured);
        drop(guard);

        for spec in &self.config.channels {
            let gain = results
                .get(&spec.channel_name)
                .and_then(|result| result.gain);
            self.bus
                .notify(Event::GainEstimated(GainEvent::new(&well, &spec.channel_name, gain)))
                .await;
        }
        Ok(())
    }

    /// Program a channel gain on the instrument and record it.
    ///
    /// The programmed gain is the estimate, or the channel default when
    /// undetermined, capped at the channel maximum.
    pub async fn on_gain_estimated(&self, estimate: &GainEvent) -> AppResult<()> {
        let (channel_id, spec) = self
            .config
            .channel(&estimate.channel_name)
            .ok_or_else(|| FlowError::UnknownChannel(estimate.channel_name.clone()))?;
        let well = estimate.well();
        if let Some(state) = self.wells.lock().get(&well) {
            if state.phase >= Phase::Acquiring {
                debug!(%well, channel = %spec.channel_name, "Well already acquiring, ignoring gain");
                return Ok(());
            }
        }

        let gain = spec.clamp_gain(estimate.gain);
        if estimate.gain.is_none() {
            debug!(%well, channel = %spec.channel_name, gain, "Gain undetermined, using default");
        }
        let command = Command::gain(&spec.job_name, spec.detector_number, gain);
        self.instrument.send_command(&command.to_string()).await?;
        info!(%well, channel = %spec.channel_name, gain, "Set gain");

        {
            let mut wells = self.wells.lock();
            let state = wells.entry(well.clone()).or_default();
            state.measured_gains.insert(spec.channel_name.clone(), gain);
            state.advance_to(Phase::GainMeasured);
            if state.all_gains_measured(self.config.channels.len()) {
                state.advance_to(Phase::AllGainsSet);
            }
        }

        let channel_id = u32::try_from(channel_id)
            .map_err(|_| FlowError::UnknownChannel(spec.channel_name.clone()))?;
        self.samples
            .set_channel(&well, channel_id, &spec.channel_name, gain)
            .await
    }

    /// Queue the full acquisition once the last channel of a well is set.
    pub async fn on_channel_updated(&self, update: &ChannelEvent) -> AppResult<()> {
        let Some(last) = self.config.last_channel() else {
            return Ok(());
        };
        if update.channel_name != last.channel_name {
            return Ok(());
        }

        let well = update.well();
        let ready = {
            let mut wells = self.wells.lock();
            let state = wells.entry(well.clone()).or_default();
            let ready = state.phase == Phase::AllGainsSet
                && state.measured_gains.len() == self.config.channels.len();
            if ready {
                state.phase = Phase::Acquiring;
            }
            ready
        };
        if !ready {
            debug!(%well, "Well not ready for acquisition, ignoring channel update");
            return Ok(());
        }

        let result = self.queue_acquisition(&well).await;
        if result.is_err() {
            if let Some(state) = self.wells.lock().get_mut(&well) {
                state.phase = Phase::AllGainsSet;
            }
        }
        result
    }

    /// Rename acquisition images and mark fields done after their last job.
    ///
    /// Images of wells that are not acquiring or complete are probe images and
    /// are left alone.
    pub async fn on_acquisition_image(&self, image: &ImageRecord) -> AppResult<()> {
        let job_ids = &self.config.exp_job_ids;
        if !job_ids.contains(&image.job_id) {
            return Ok(());
        }
        let well = image.well();
        let acquiring = self
            .wells
            .lock()
            .get(&well)
            .is_some_and(|state| state.phase >= Phase::Acquiring);
        if !acquiring {
            debug!(%well, job_id = image.job_id, "Well not acquiring, ignoring image");
            return Ok(());
        }

        if let Some(channel) = output_channel(job_ids, image.job_id, image.channel_id) {
            let new_name = image_name(
                image.well_x,
                image.well_y,
                image.job_id,
                image.field(),
                image.z_slice,
                channel,
            );
            self.instrument.rename_image(&image.path, &new_name).await?;
        }

        if image.job_id != self.config.last_exp_job_id() {
            return Ok(());
        }

        let layout = self.config.well_layout;
        let well_complete = {
            let mut wells = self.wells.lock();
            let state = wells.entry(well.clone()).or_default();
            state.fields_completed.insert(image.field());
            let all_fields = state.fields_completed.len() >= (layout.x_fields * layout.y_fields) as usize;
            if all_fields && state.phase == Phase::Acquiring {
                state.phase = Phase::Complete;
                true
            } else {
                false
            }
        };

        self.samples.set_field(&well, image.field(), true).await?;

        if well_complete {
            info!(%well, "Well complete");
            let last_field = FieldCoord::new(layout.x_fields - 1, layout.y_fields - 1);
            self.bus
                .notify(Event::WellUpdated(WellEvent::new(&well, last_field, true)))
                .await;
        }
        Ok(())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Probe the next remaining well; when none is left, finish if asked to.
    async fn advance(&self, finish_when_done: bool) -> AppResult<()> {
        let mut plate = self.plate.lock().await;
        let Some(well) = plate.next_well().cloned() else {
            drop(plate);
            if finish_when_done {
                return self.finish().await;
            }
            warn!("No wells left to image");
            return Ok(());
        };

        self.queue_probe(&well).await?;
        plate.remove(&well);
        let remaining = plate.remaining();
        drop(plate);

        self.wells
            .lock()
            .entry(well.clone())
            .or_default()
            .advance_to(Phase::Probing);
        info!(%well, remaining, "Probing well");
        Ok(())
    }

    async fn queue_probe(&self, well: &WellCoord) -> AppResult<()> {
        if self.is_imaging() {
            self.stop_imaging().await?;
        }
        self.instrument
            .send_command(&Command::DeleteList.to_string())
            .await?;
        for field in probe_fields(&self.config.well_layout) {
            let command = Command::cam_add(
                &self.config.gain_pattern_name,
                well.well_x,
                well.well_y,
                field.field_x,
                field.field_y,
            );
            self.instrument.send_command(&command.to_string()).await?;
        }
        self.start_imaging().await?;
        self.instrument
            .send_command(&Command::StartCamScan.to_string())
            .await
    }

    async fn queue_acquisition(&self, well: &WellCoord) -> AppResult<()> {
        let commands: Vec<String> = acquisition_fields(&self.config.well_layout)
            .map(|field| {
                Command::cam_add(
                    &self.config.exp_pattern_name,
                    well.well_x,
                    well.well_y,
                    field.field_x,
                    field.field_y,
                )
                .to_string()
            })
            .collect();

        self.instrument
            .send_command(&Command::DeleteList.to_string())
            .await?;
        self.instrument.send_commands(&commands).await?;
        self.start_imaging().await?;
        self.instrument
            .send_command(&Command::StartCamScan.to_string())
            .await?;
        info!(%well, jobs = commands.len(), "Acquiring well");
        Ok(())
    }

    async fn finish(&self) -> AppResult<()> {
        let first = self.run_state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Finished;
                true
            } else {
                false
            }
        });
        if !first {
            debug!("Run already finished");
            return Ok(());
        }
        self.stop_imaging().await?;
        info!("Experiment finished");
        Ok(())
    }

    async fn start_imaging(&self) -> AppResult<()> {
        self.instrument.start_imaging().await?;
        self.imaging.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_imaging(&self) -> AppResult<()> {
        self.instrument.stop_imaging().await?;
        self.imaging.store(false, Ordering::SeqCst);
        Ok(())
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    fn subscribe<F, Fut>(&self, kind: EventKind, name: &str, handler: F) -> Subscription
    where
        F: Fn(Arc<WorkflowEngine>, Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let engine = self.this.clone();
        self.bus.register(kind, name, move |event| {
            let dispatch = engine.upgrade().map(|engine| handler(engine, event));
            async move {
                match dispatch {
                    Some(dispatch) => dispatch.await,
                    None => Ok(()),
                }
            }
        })
    }
}

//! Plate runs through the workflow engine with recorded collaborators.

mod common;

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rust_camacq::bus::EventBus;
use rust_camacq::command::Command;
use rust_camacq::event::{Event, GainEvent, WellEvent};
use rust_camacq::gain::histogram::StaticHistograms;
use rust_camacq::gain::GainService;
use rust_camacq::instrument::mock::{Action, ActionLog, RecordingInstrument, RecordingSampleStore, ScriptedGains};
use rust_camacq::sample::{FieldCoord, InMemorySampleStore, WellCoord};
use rust_camacq::workflow::{Collaborators, Phase, RunState, WorkflowEngine};
use tokio::sync::mpsc;

struct Run {
    engine: Arc<WorkflowEngine>,
    bus: Arc<EventBus>,
    log: ActionLog,
    store: Arc<RecordingSampleStore<InMemorySampleStore>>,
}

fn run(wells: Vec<WellCoord>) -> Run {
    let config = common::config();
    let bus = Arc::new(EventBus::new());
    let log = ActionLog::new();
    let store = Arc::new(RecordingSampleStore::new(
        InMemorySampleStore::with_bus(Arc::clone(&bus)),
        log.clone(),
    ));
    let gains = GainService::new(
        &config,
        Arc::new(StaticHistograms::new(common::probe_histograms())),
    );
    let engine = WorkflowEngine::new(
        config.production,
        Arc::clone(&bus),
        Collaborators {
            instrument: Arc::new(RecordingInstrument::new(log.clone())),
            samples: store.clone(),
            gains: Arc::new(gains),
        },
        wells,
    );
    engine.install();
    Run {
        engine,
        bus,
        log,
        store,
    }
}

const PROBE_FIELDS: [FieldCoord; 2] = [FieldCoord::new(0, 1), FieldCoord::new(1, 1)];

async fn probe(bus: &EventBus, well: &WellCoord) {
    for field in PROBE_FIELDS {
        for channel_id in 0..32 {
            bus.notify(common::image_event(well, field, 3, channel_id)).await;
        }
    }
}

async fn acquire(bus: &EventBus, well: &WellCoord) {
    for field_x in 0..2 {
        for field_y in 0..3 {
            for job_id in [3, 4, 6] {
                for channel_id in [0, 1] {
                    bus.notify(common::image_event(
                        well,
                        FieldCoord::new(field_x, field_y),
                        job_id,
                        channel_id,
                    ))
                    .await;
                }
            }
        }
    }
}

/// Action kinds with command arguments stripped.
fn shape(action: &Action) -> String {
    match action {
        Action::SendCommand(command) => command
            .split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" "),
        Action::SendCommands(commands) => format!("batch {}", commands.len()),
        Action::StartImaging => "start".to_string(),
        Action::StopImaging => "stop".to_string(),
        Action::RenameImage { .. } => "rename".to_string(),
        Action::SetChannel { channel_name, .. } => format!("set_channel {channel_name}"),
        Action::SetField { .. } => "set_field".to_string(),
    }
}

fn shapes(log: &ActionLog) -> Vec<String> {
    log.snapshot().iter().map(shape).collect()
}

#[tokio::test]
async fn test_probe_then_acquire_order() {
    let well = WellCoord::new("00", 0, 0);
    let r = run(vec![well.clone(), WellCoord::new("00", 0, 1)]);

    r.bus.notify(Event::Start).await;
    assert_eq!(
        shapes(&r.log),
        vec!["/cmd:deletelist", "/cmd:add /tar:camlist", "/cmd:add /tar:camlist", "start", "/cmd:startcamscan"]
    );
    assert_eq!(
        r.log.snapshot()[1],
        Action::SendCommand(Command::cam_add("p10xgain", 0, 0, 0, 1).to_string())
    );
    r.log.clear();

    probe(&r.bus, &well).await;

    assert_eq!(
        shapes(&r.log),
        vec![
            "stop",
            "/cmd:adjust /tar:pmt",
            "set_channel green",
            "/cmd:adjust /tar:pmt",
            "set_channel blue",
            "/cmd:adjust /tar:pmt",
            "set_channel yellow",
            "/cmd:adjust /tar:pmt",
            "set_channel red",
            "/cmd:deletelist",
            "batch 6",
            "start",
            "/cmd:startcamscan",
        ]
    );

    let actions = r.log.snapshot();
    // Yellow estimates above its maximum and is capped
    assert_eq!(
        actions[5],
        Action::SendCommand(Command::gain("blue10x", 2, 800).to_string())
    );
    let Action::SendCommands(batch) = &actions[10] else {
        panic!("expected a command batch, got {:?}", actions[10]);
    };
    assert_eq!(batch[0], Command::cam_add("p10xexp", 0, 0, 0, 0).to_string());
    assert_eq!(batch[1], Command::cam_add("p10xexp", 0, 0, 0, 1).to_string());
    assert_eq!(batch[5], Command::cam_add("p10xexp", 0, 0, 1, 2).to_string());

    let state = r.engine.well_state(&well).unwrap();
    assert_eq!(state.phase, Phase::Acquiring);
    assert_eq!(state.measured_gains.len(), 4);
    let record = r.store.inner().well(&well).unwrap();
    assert_eq!(record.channels[&2].gain, Some(800));
}

#[tokio::test]
async fn test_probe_images_are_never_renamed() {
    let well = WellCoord::new("00", 0, 0);
    let r = run(vec![well.clone()]);
    r.bus.notify(Event::Start).await;

    r.bus.notify(common::image_event(&well, FieldCoord::new(0, 0), 4, 0)).await;
    r.bus.notify(common::image_event(&well, FieldCoord::new(0, 1), 3, 1)).await;

    assert_eq!(r.log.count(|a| matches!(a, Action::RenameImage { .. })), 0);
    assert_eq!(r.engine.well_state(&well).unwrap().phase, Phase::Probing);
}

#[tokio::test]
async fn test_acquisition_images_are_renamed() {
    let well = WellCoord::new("00", 0, 0);
    let r = run(vec![well.clone(), WellCoord::new("00", 0, 1)]);
    r.bus.notify(Event::Start).await;
    probe(&r.bus, &well).await;
    r.log.clear();

    let cases = [
        (3, 0, "C00"),
        (3, 1, "C01"),
        (4, 0, "C01"),
        (4, 1, "C02"),
        (6, 0, "C03"),
        (6, 1, "C03"),
    ];
    for (job_id, channel_id, channel) in cases {
        r.bus
            .notify(common::image_event(&well, FieldCoord::new(0, 1), job_id, channel_id))
            .await;
        let renamed = r.log.snapshot().into_iter().rev().find_map(|action| match action {
            Action::RenameImage { new_name, .. } => Some(new_name),
            _ => None,
        });
        assert_eq!(
            renamed,
            Some(format!("U00--V00--E{job_id:02}--X00--Y01--Z00--{channel}.ome.tif"))
        );
    }

    // No output channel: not renamed
    r.bus.notify(common::image_event(&well, FieldCoord::new(0, 0), 4, 7)).await;
    assert_eq!(r.log.count(|a| matches!(a, Action::RenameImage { .. })), 6);
}

#[tokio::test]
async fn test_plate_run_finishes_once() {
    let first = WellCoord::new("00", 0, 0);
    let second = WellCoord::new("00", 0, 1);
    let r = run(vec![first.clone(), second.clone()]);

    r.bus.notify(Event::Start).await;
    probe(&r.bus, &first).await;
    acquire(&r.bus, &first).await;

    assert_eq!(r.engine.well_state(&first).unwrap().phase, Phase::Complete);
    assert_eq!(r.engine.well_state(&second).unwrap().phase, Phase::Probing);
    assert_eq!(r.engine.wells_remaining().await, 0);
    // The last image arrives after the run moved on to the next well and is still renamed
    assert_eq!(r.log.count(|a| matches!(a, Action::RenameImage { .. })), 36);
    assert_eq!(r.log.count(|a| matches!(a, Action::SetField { .. })), 12);
    assert_eq!(
        r.log.snapshot().last(),
        Some(&Action::SetField {
            well: first.clone(),
            field: FieldCoord::new(1, 2),
            img_ok: true,
        })
    );

    // A repeated completion of the first well does not move the run on again
    let probes_before = r.log.count(|a| *a == Action::SendCommand("/cmd:deletelist".to_string()));
    let last_field = FieldCoord::new(1, 2);
    r.bus
        .notify(Event::WellUpdated(WellEvent::new(&first, last_field, true)))
        .await;
    assert_eq!(
        r.log.count(|a| *a == Action::SendCommand("/cmd:deletelist".to_string())),
        probes_before
    );

    probe(&r.bus, &second).await;
    acquire(&r.bus, &second).await;

    tokio::time::timeout(Duration::from_secs(5), r.engine.finished())
        .await
        .unwrap();
    assert_eq!(*r.engine.run_state().borrow(), RunState::Finished);
    assert!(!r.engine.is_imaging());

    let stops = r.log.count(|a| *a == Action::StopImaging);
    r.bus
        .notify(Event::WellUpdated(WellEvent::new(&second, last_field, true)))
        .await;
    assert_eq!(r.log.count(|a| *a == Action::StopImaging), stops);
}

/// Started engine for one well with fixed gains, fed through `run_inbound`.
async fn inbound_run(well: &WellCoord) -> (Arc<WorkflowEngine>, Arc<EventBus>, Arc<ScriptedGains>) {
    let config = common::config();
    let bus = Arc::new(EventBus::new());
    let gains = Arc::new(ScriptedGains::new(
        ["green", "blue", "yellow", "red"].map(|channel| (channel.to_string(), Some(600))),
    ));
    let engine = WorkflowEngine::new(
        config.production,
        Arc::clone(&bus),
        Collaborators {
            instrument: Arc::new(RecordingInstrument::new(ActionLog::new())),
            samples: Arc::new(InMemorySampleStore::with_bus(Arc::clone(&bus))),
            gains: gains.clone(),
        },
        vec![well.clone()],
    );
    engine.install();
    bus.notify(Event::Start).await;
    (engine, bus, gains)
}

#[tokio::test]
async fn test_concurrent_inbound_triggers_calculate_once() {
    let well = WellCoord::new("00", 0, 0);
    let (engine, bus, gains) = inbound_run(&well).await;

    let (tx, rx) = mpsc::channel(16);
    let delivery = tokio::spawn(Arc::clone(&bus).run_inbound(rx));
    for _ in 0..8 {
        tx.send(common::image_event(&well, FieldCoord::new(1, 1), 3, 31))
            .await
            .unwrap();
    }
    drop(tx);
    delivery.await.unwrap();

    assert_eq!(gains.calls(), 1);
    assert_eq!(engine.well_state(&well).unwrap().phase, Phase::Acquiring);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inbound_trigger_sees_every_earlier_image() {
    let well = WellCoord::new("00", 0, 0);
    for _ in 0..25 {
        let (engine, bus, gains) = inbound_run(&well).await;

        let (tx, rx) = mpsc::channel(64);
        let delivery = tokio::spawn(Arc::clone(&bus).run_inbound(rx));
        for field in PROBE_FIELDS {
            for channel_id in 0..32 {
                tx.send(common::image_event(&well, field, 3, channel_id))
                    .await
                    .unwrap();
            }
        }
        drop(tx);
        delivery.await.unwrap();

        assert_eq!(gains.image_counts(), vec![64]);
        assert_eq!(engine.well_state(&well).unwrap().phase, Phase::Acquiring);
        engine.shutdown();
    }
}

#[tokio::test]
async fn test_unknown_channel_estimate_changes_nothing() {
    let well = WellCoord::new("00", 0, 0);
    let r = run(vec![well.clone()]);

    r.bus
        .notify(Event::GainEstimated(GainEvent::new(&well, "purple", Some(500))))
        .await;

    assert!(r.log.snapshot().is_empty());
}

proptest! {
    #[test]
    fn programmed_gain_never_exceeds_max(
        estimate in proptest::option::of(0u32..2000),
        default_gain in 0u32..2000,
        max_gain in 1u32..2000,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut production = common::config().production;
        production.channels[0].default_gain = default_gain;
        production.channels[0].max_gain = max_gain;
        let log = ActionLog::new();
        let engine = WorkflowEngine::new(
            production,
            Arc::new(EventBus::new()),
            Collaborators {
                instrument: Arc::new(RecordingInstrument::new(log.clone())),
                samples: Arc::new(InMemorySampleStore::new()),
                gains: Arc::new(ScriptedGains::default()),
            },
            Vec::new(),
        );
        let well = WellCoord::new("00", 0, 0);

        runtime
            .block_on(engine.on_gain_estimated(&GainEvent::new(&well, "green", estimate)))
            .unwrap();

        let programmed = engine.well_state(&well).unwrap().measured_gains["green"];
        prop_assert!(programmed <= max_gain);
        prop_assert_eq!(programmed, estimate.unwrap_or(default_gain).min(max_gain));
        let command = Command::gain("green10x", 1, programmed).to_string();
        prop_assert!(log.snapshot().contains(&Action::SendCommand(command)));
    }
}

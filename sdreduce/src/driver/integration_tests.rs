use super::*;
use crate::checkpoint::{FsCheckpointStore, MemoryCheckpointStore, StageId};
use crate::config::SpectrumWindow;
use crate::events::CollectingEventSink;
use crate::reduction::testkit::raster_observation;
use pretty_assertions::assert_eq;

/// 12 science stages plus the cube stage, per pass.
const STAGES_PER_PASS: u64 = 13;

fn params() -> ReduceParams {
    // A beam small enough that the 0.001 degree raster spacing gives
    // one pointing per cell.
    ReduceParams {
        combine_radius: 0.0005,
        ..ReduceParams::default()
    }
}

fn started_stages(sink: &CollectingEventSink) -> Vec<(u64, String)> {
    sink.events()
        .iter()
        .filter(|(kind, _)| kind == "stage.started")
        .map(|(_, data)| {
            let data = data.as_ref().unwrap();
            (
                data["stage_id"].as_u64().unwrap(),
                data["stage_name"].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

#[test]
fn fresh_run_reduces_a_raster() {
    let observation = raster_observation(4, 4, 32);
    let mut driver = PipelineDriver::new(
        params(),
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let outputs = driver.run(&observation).unwrap();

    assert_eq!(outputs.stages, 1 + STAGES_PER_PASS);
    assert_eq!(outputs.tables.len(), 1);
    assert_eq!(outputs.cubes.len(), 1);
    assert_eq!(outputs.cubes[0].nchan, 32);
    for row in &outputs.rows {
        assert!(row.stats.post_fit_rms.is_some());
        assert!(row.stats.expected_rms.is_some());
    }
    let store = driver.into_store();
    assert_eq!(store.len(), (1 + STAGES_PER_PASS) as usize);
}

#[test]
fn stage_numbering_is_deterministic() {
    let observation = raster_observation(4, 4, 32);
    let mut sequences = Vec::new();
    for _ in 0..2 {
        let sink = Arc::new(CollectingEventSink::new());
        let mut driver = PipelineDriver::new(
            params(),
            PipelineRunMode::FreshRun,
            MemoryCheckpointStore::new(),
        )
        .unwrap()
        .with_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        driver.run(&observation).unwrap();
        sequences.push(started_stages(&sink));
    }
    assert_eq!(sequences[0], sequences[1]);
    // Gapless from one.
    for (pos, (id, _)) in sequences[0].iter().enumerate() {
        assert_eq!(*id, pos as u64 + 1);
    }
}

#[test]
fn resume_matches_fresh_at_every_point() {
    let observation = raster_observation(4, 4, 32);
    let mut driver = PipelineDriver::new(
        params(),
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let fresh = driver.run(&observation).unwrap();
    let mut store = driver.into_store();

    for k in 1..=fresh.stages {
        let sink = Arc::new(CollectingEventSink::new());
        let mut resumed_driver = PipelineDriver::new(
            params(),
            PipelineRunMode::ResumeRun {
                resume_point: StageId::new(k),
            },
            store,
        )
        .unwrap()
        .with_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
        let resumed = resumed_driver.run(&observation).unwrap();
        assert_eq!(resumed, fresh, "resume point {k}");

        let reloaded = sink
            .events()
            .iter()
            .filter(|(kind, _)| kind == "stage.reloaded")
            .count() as u64;
        let completed = sink
            .events()
            .iter()
            .filter(|(kind, _)| kind == "stage.completed")
            .count() as u64;
        assert_eq!(reloaded, k, "resume point {k}");
        assert_eq!(completed, fresh.stages - k, "resume point {k}");
        store = resumed_driver.into_store();
    }
}

#[test]
fn transient_run_never_persists() {
    let observation = raster_observation(4, 4, 32);
    let mut fresh_driver = PipelineDriver::new(
        params(),
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let fresh = fresh_driver.run(&observation).unwrap();

    let mut driver = PipelineDriver::new(
        params(),
        PipelineRunMode::TransientRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let transient = driver.run(&observation).unwrap();
    assert_eq!(transient, fresh);
    assert!(driver.into_store().is_empty());
}

#[test]
fn zero_row_combinations_contribute_no_stages() {
    // Two spectral windows, each present in a single polarization; the
    // two cross combinations must not shift the numbering.
    let mut observation = raster_observation(4, 4, 32);
    let half = observation.rows.len() / 2;
    for row in &mut observation.rows[half..] {
        row.spw = 1;
        row.pol = 1;
    }
    let axis = observation.abscissa[&0].clone();
    observation.abscissa.insert(1, axis);

    let mut driver = PipelineDriver::new(
        params(),
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let outputs = driver.run(&observation).unwrap();
    assert_eq!(outputs.stages, 1 + 2 * STAGES_PER_PASS);
    assert_eq!(outputs.tables.len(), 2);
}

#[test]
fn changed_selection_is_refused_on_resume() {
    let observation = raster_observation(4, 4, 32);
    let mut driver = PipelineDriver::new(
        params(),
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    driver.run(&observation).unwrap();
    let store = driver.into_store();

    let mut changed = params();
    changed.selection.spws = crate::config::AxisSelection::Only(vec![0]);
    let mut resumed = PipelineDriver::new(
        changed,
        PipelineRunMode::ResumeRun {
            resume_point: StageId::new(3),
        },
        store,
    )
    .unwrap();
    let err = resumed.run(&observation).unwrap_err();
    assert!(matches!(err, ReduceError::SelectionMismatch { .. }), "{err}");
}

#[test]
fn missing_checkpoint_is_fatal_on_resume() {
    let observation = raster_observation(4, 4, 32);
    let dir = tempfile::tempdir().unwrap();
    let store = FsCheckpointStore::open(dir.path()).unwrap();
    let mut driver =
        PipelineDriver::new(params(), PipelineRunMode::FreshRun, store).unwrap();
    driver.run(&observation).unwrap();
    drop(driver);

    std::fs::remove_file(dir.path().join("stage-000001.json")).unwrap();
    let store = FsCheckpointStore::open(dir.path()).unwrap();
    let mut resumed = PipelineDriver::new(
        params(),
        PipelineRunMode::ResumeRun {
            resume_point: StageId::new(5),
        },
        store,
    )
    .unwrap();
    let err = resumed.run(&observation).unwrap_err();
    assert!(matches!(err, ReduceError::CheckpointMissing { .. }), "{err}");
}

#[test]
fn spectrum_windows_replace_detection() {
    let observation = raster_observation(4, 4, 32);
    let run_params = ReduceParams {
        spectrum_windows: vec![SpectrumWindow::symmetric(45.016, 40.0)],
        iterations: 3,
        ..params()
    };
    // Windows force a single pass regardless of the iteration count.
    assert_eq!(run_params.iteration_passes(), 1);
    let mut driver = PipelineDriver::new(
        run_params,
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let outputs = driver.run(&observation).unwrap();
    assert_eq!(outputs.stages, 1 + STAGES_PER_PASS);
    for row in &outputs.rows {
        assert_eq!(row.masks.len(), 1);
    }
}

#[test]
fn iterations_repeat_the_science_sequence() {
    let observation = raster_observation(4, 4, 32);
    let run_params = ReduceParams {
        iterations: 2,
        ..params()
    };
    let mut driver = PipelineDriver::new(
        run_params,
        PipelineRunMode::FreshRun,
        MemoryCheckpointStore::new(),
    )
    .unwrap();
    let outputs = driver.run(&observation).unwrap();
    // Three full passes after the preparation stage.
    assert_eq!(outputs.stages, 1 + 3 * STAGES_PER_PASS);
    assert_eq!(outputs.tables.len(), 1);
}

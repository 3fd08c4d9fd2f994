//! Wraps a single scientific transformation with checkpoint bookkeeping.

use super::{PipelineRunMode, RestartController, StageCounter, Verdict};
use crate::bundle::StateBundle;
use crate::checkpoint::{CheckpointStore, StageId};
use crate::errors::ReduceError;
use crate::events::{EventSink, NoOpEventSink};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Runs stage bodies under the restart protocol.
///
/// For every stage: advance the counter, ask the [`RestartController`] for
/// a verdict, then either reload the stage's persisted slots (body not
/// invoked) or invoke the body and, on [`Verdict::RunAndPersist`], persist
/// the named slots. The checkpoint write happens strictly after the body
/// returns successfully: a failed stage leaves the prior stage's record as
/// the latest valid resume point.
pub struct StageRunner<S: CheckpointStore> {
    counter: StageCounter,
    controller: RestartController,
    store: S,
    sink: Arc<dyn EventSink>,
}

impl<S: CheckpointStore> StageRunner<S> {
    /// Creates a runner for one pipeline run.
    ///
    /// A [`PipelineRunMode::FreshRun`] clears the store up front; stale
    /// records mixed into a new run would corrupt later resumes.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::StoreUnavailable`] if a fresh run cannot
    /// clear the store, or [`ReduceError::InvalidResumePoint`] if the
    /// requested resume point lies beyond the recorded history.
    pub fn new(mode: PipelineRunMode, mut store: S) -> Result<Self, ReduceError> {
        match mode {
            PipelineRunMode::FreshRun => store.clear()?,
            PipelineRunMode::ResumeRun { resume_point } => {
                let last = store.last_stage_id()?;
                if resume_point > last {
                    return Err(ReduceError::InvalidResumePoint {
                        requested: resume_point,
                        last,
                    });
                }
            }
            PipelineRunMode::TransientRun => {}
        }
        Ok(Self {
            counter: StageCounter::new(),
            controller: RestartController::new(mode),
            store,
            sink: Arc::new(NoOpEventSink),
        })
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Returns the last stage id assigned.
    #[must_use]
    pub fn current_stage(&self) -> StageId {
        self.counter.current()
    }

    /// Returns the run mode.
    #[must_use]
    pub fn mode(&self) -> PipelineRunMode {
        self.controller.mode()
    }

    /// Gives the store back, consuming the runner.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Executes one stage under the restart protocol.
    ///
    /// `keys` names the bundle slots this stage persists; on a
    /// skip-and-reload verdict the same keys are reloaded instead and
    /// `body` is never invoked. A body failure is wrapped as
    /// [`ReduceError::StageBody`] carrying the stage id and name; no retry.
    ///
    /// # Errors
    ///
    /// Propagates [`ReduceError::CheckpointMissing`] and
    /// [`ReduceError::StoreUnavailable`] from the store, and
    /// [`ReduceError::StageBody`] for whatever the body returns.
    pub fn run<F>(
        &mut self,
        stage_name: &str,
        keys: &[&str],
        bundle: &mut StateBundle,
        body: F,
    ) -> Result<(), ReduceError>
    where
        F: FnOnce(&mut StateBundle) -> Result<(), ReduceError>,
    {
        let stage_id = self.counter.advance();
        let verdict = self.controller.decide(stage_id);
        let started = Instant::now();
        self.sink.emit(
            "stage.started",
            Some(serde_json::json!({
                "stage_id": stage_id.value(),
                "stage_name": stage_name,
                "verdict": verdict,
            })),
        );

        let result = match verdict {
            Verdict::SkipAndReload => self.store.read(stage_id, keys, bundle),
            Verdict::RunOnly => body(bundle)
                .map_err(|err| ReduceError::stage_body(stage_id, stage_name, err.to_string())),
            Verdict::RunAndPersist => body(bundle)
                .map_err(|err| ReduceError::stage_body(stage_id, stage_name, err.to_string()))
                .and_then(|()| self.store.write(stage_id, stage_name, keys, bundle)),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(()) => {
                info!(
                    stage_id = stage_id.value(),
                    stage_name,
                    verdict = ?verdict,
                    elapsed_ms,
                    "stage done"
                );
                let event = if verdict == Verdict::SkipAndReload {
                    "stage.reloaded"
                } else {
                    "stage.completed"
                };
                self.sink.emit(
                    event,
                    Some(serde_json::json!({
                        "stage_id": stage_id.value(),
                        "stage_name": stage_name,
                        "verdict": verdict,
                        "elapsed_ms": elapsed_ms,
                    })),
                );
            }
            Err(err) => {
                error!(
                    stage_id = stage_id.value(),
                    stage_name,
                    verdict = ?verdict,
                    %err,
                    "stage failed"
                );
                self.sink.emit(
                    "stage.failed",
                    Some(serde_json::json!({
                        "stage_id": stage_id.value(),
                        "stage_name": stage_name,
                        "error": err.to_string(),
                    })),
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::events::CollectingEventSink;
    use pretty_assertions::assert_eq;

    fn bump(slot: &'static str) -> impl FnOnce(&mut StateBundle) -> Result<(), ReduceError> {
        move |bundle| {
            let value: u64 = bundle.get(slot).unwrap_or(0);
            bundle.put(slot, &(value + 1))
        }
    }

    #[test]
    fn fresh_run_executes_and_persists() {
        let mut runner =
            StageRunner::new(PipelineRunMode::FreshRun, MemoryCheckpointStore::new()).unwrap();
        let mut bundle = StateBundle::new();

        runner.run("A", &["n"], &mut bundle, bump("n")).unwrap();
        runner.run("B", &["n"], &mut bundle, bump("n")).unwrap();

        assert_eq!(bundle.get::<u64>("n").unwrap(), 2);
        let store = runner.into_store();
        assert_eq!(store.len(), 2);
        assert_eq!(store.record(StageId::new(2)).unwrap().stage_name, "B");
    }

    #[test]
    fn transient_run_never_writes() {
        let mut runner =
            StageRunner::new(PipelineRunMode::TransientRun, MemoryCheckpointStore::new()).unwrap();
        let mut bundle = StateBundle::new();

        runner.run("A", &["n"], &mut bundle, bump("n")).unwrap();

        assert_eq!(bundle.get::<u64>("n").unwrap(), 1);
        assert!(runner.into_store().is_empty());
    }

    #[test]
    fn resume_skips_bodies_up_to_the_resume_point() {
        let mut store = MemoryCheckpointStore::new();
        {
            let mut runner = StageRunner::new(PipelineRunMode::FreshRun, &mut store).unwrap();
            let mut bundle = StateBundle::new();
            runner.run("A", &["n"], &mut bundle, bump("n")).unwrap();
            runner.run("B", &["n"], &mut bundle, bump("n")).unwrap();
            runner.run("C", &["n"], &mut bundle, bump("n")).unwrap();
        }

        let mode = PipelineRunMode::from_resume_point(StageId::new(2));
        let mut runner = StageRunner::new(mode, &mut store).unwrap();
        let mut bundle = StateBundle::new();
        let mut invoked = Vec::new();

        for name in ["A", "B", "C"] {
            runner
                .run(name, &["n"], &mut bundle, |b| {
                    invoked.push(name);
                    bump("n")(b)
                })
                .unwrap();
        }

        // A and B were reloaded, only C executed.
        assert_eq!(invoked, vec!["C"]);
        assert_eq!(bundle.get::<u64>("n").unwrap(), 3);
    }

    #[test]
    fn checkpoint_write_happens_only_after_body_success() {
        let mut runner =
            StageRunner::new(PipelineRunMode::FreshRun, MemoryCheckpointStore::new()).unwrap();
        let mut bundle = StateBundle::new();
        bundle.put("n", &0_u64).unwrap();

        let err = runner
            .run("A", &["n"], &mut bundle, |_| {
                Err(ReduceError::InvalidObservation("boom".to_string()))
            })
            .unwrap_err();

        // The failure carries the stage identity for the operator.
        match err {
            ReduceError::StageBody {
                stage_id,
                stage_name,
                message,
            } => {
                assert_eq!(stage_id, StageId::new(1));
                assert_eq!(stage_name, "A");
                assert!(message.contains("boom"), "{message}");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(runner.into_store().is_empty());
    }

    #[test]
    fn resume_past_history_is_rejected() {
        let store = MemoryCheckpointStore::new();
        let mode = PipelineRunMode::from_resume_point(StageId::new(4));
        // The runner itself is not Debug, so take the error side directly.
        let err = StageRunner::new(mode, store).err().unwrap();
        assert!(matches!(err, ReduceError::InvalidResumePoint { .. }));
    }

    #[test]
    fn missing_checkpoint_on_reload_is_fatal() {
        let mut store = MemoryCheckpointStore::new();
        {
            let mut runner = StageRunner::new(PipelineRunMode::FreshRun, &mut store).unwrap();
            let mut bundle = StateBundle::new();
            runner.run("A", &["n"], &mut bundle, bump("n")).unwrap();
        }

        let mode = PipelineRunMode::from_resume_point(StageId::new(1));
        let mut runner = StageRunner::new(mode, &mut store).unwrap();
        let mut bundle = StateBundle::new();
        // Ask the reload for a key stage 1 never persisted.
        let err = runner
            .run("A", &["other"], &mut bundle, bump("other"))
            .unwrap_err();
        assert!(matches!(err, ReduceError::CheckpointMissing { .. }));
    }

    #[test]
    fn emits_one_transition_event_pair_per_stage() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut runner =
            StageRunner::new(PipelineRunMode::FreshRun, MemoryCheckpointStore::new())
                .unwrap()
                .with_sink(sink.clone());
        let mut bundle = StateBundle::new();

        runner.run("A", &["n"], &mut bundle, bump("n")).unwrap();

        assert_eq!(
            sink.event_types(),
            vec!["stage.started".to_string(), "stage.completed".to_string()]
        );
    }
}

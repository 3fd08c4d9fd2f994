//! The restart decision state machine.
//!
//! Older reductions repeated the same `counter == restart_id` /
//! `counter > restart_id` branching at every stage call site; here the
//! branching exists in exactly one place and is consulted identically by
//! every stage.

use crate::checkpoint::StageId;
use serde::{Deserialize, Serialize};

/// How a pipeline run relates to checkpoint history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineRunMode {
    /// Clear all prior checkpoints and persist every stage.
    FreshRun,
    /// Reload state up to the resume point, execute and persist after it.
    ResumeRun {
        /// The stage whose persisted output is reloaded; execution starts
        /// at the following stage.
        resume_point: StageId,
    },
    /// Never touch the checkpoint store (history disabled).
    TransientRun,
}

impl PipelineRunMode {
    /// Interprets an operator-supplied resume point: 0 means start fresh.
    #[must_use]
    pub fn from_resume_point(resume_point: StageId) -> Self {
        if resume_point == StageId::ZERO {
            Self::FreshRun
        } else {
            Self::ResumeRun { resume_point }
        }
    }

    /// Returns the resume point, or [`StageId::ZERO`] for fresh and
    /// transient runs.
    #[must_use]
    pub fn resume_point(self) -> StageId {
        match self {
            Self::ResumeRun { resume_point } => resume_point,
            Self::FreshRun | Self::TransientRun => StageId::ZERO,
        }
    }
}

/// Position of the run relative to the resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    /// Stages before the resume point: skipped and reloaded.
    BeforeResumePoint,
    /// The exact stage whose output is reloaded rather than recomputed.
    AtResumePoint,
    /// Every stage past the resume point executes normally.
    AfterResumePoint,
}

/// Per-stage execution verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Reload persisted state; do not invoke the stage body.
    SkipAndReload,
    /// Invoke the body and persist the resulting state.
    RunAndPersist,
    /// Invoke the body without touching the store.
    RunOnly,
}

/// Decides, once per stage, how the stage interacts with history.
#[derive(Debug)]
pub struct RestartController {
    mode: PipelineRunMode,
    state: RestartState,
}

impl RestartController {
    /// Creates the controller for one pipeline run.
    ///
    /// Fresh and transient runs start (and stay) past the resume point;
    /// the three-state machine only engages for a resume.
    #[must_use]
    pub fn new(mode: PipelineRunMode) -> Self {
        let state = if mode.resume_point() > StageId::ZERO {
            RestartState::BeforeResumePoint
        } else {
            RestartState::AfterResumePoint
        };
        Self { mode, state }
    }

    /// Returns the run mode.
    #[must_use]
    pub fn mode(&self) -> PipelineRunMode {
        self.mode
    }

    /// Returns the current machine state.
    #[must_use]
    pub fn state(&self) -> RestartState {
        self.state
    }

    /// Returns the verdict for `stage_id` and advances the machine.
    pub fn decide(&mut self, stage_id: StageId) -> Verdict {
        if self.mode == PipelineRunMode::TransientRun {
            return Verdict::RunOnly;
        }
        let resume_point = self.mode.resume_point();
        if stage_id < resume_point {
            self.state = RestartState::BeforeResumePoint;
            Verdict::SkipAndReload
        } else if stage_id == resume_point {
            self.state = RestartState::AtResumePoint;
            Verdict::SkipAndReload
        } else {
            self.state = RestartState::AfterResumePoint;
            Verdict::RunAndPersist
        }
    }
}

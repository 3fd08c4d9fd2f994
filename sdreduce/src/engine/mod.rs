//! The checkpointed stage-execution engine.
//!
//! [`StageCounter`] assigns gapless monotonic stage ids; the
//! [`RestartController`] decides per stage whether to skip-and-reload,
//! run-and-persist, or run without touching history; [`StageRunner`] ties
//! both to the checkpoint store around each stage-body invocation.

mod counter;
mod restart;
mod runner;

pub use counter::StageCounter;
pub use restart::{PipelineRunMode, RestartController, RestartState, Verdict};
pub use runner::StageRunner;

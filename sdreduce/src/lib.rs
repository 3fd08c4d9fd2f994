//! # sdreduce
//!
//! A checkpointed batch reduction pipeline for single-dish radio
//! observations.
//!
//! The reduction walks a fixed sequence of science stages (grouping,
//! baseline removal, line detection, flagging, gridding) per spectral
//! window and polarization, and persists each stage's outputs as it goes:
//!
//! - **Gapless stage numbering**: every stage gets the next id whether it
//!   runs or is skipped, so numbering is identical across fresh and
//!   resumed runs
//! - **Skip-and-reload resume**: stages before the resume point reload
//!   their persisted outputs instead of executing
//! - **Write-after-success**: a stage's checkpoint is written only after
//!   its body returns cleanly, so a crash always leaves a valid resume
//!   point
//! - **Event-driven observability**: stage lifecycle events through a
//!   pluggable sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sdreduce::prelude::*;
//!
//! let store = FsCheckpointStore::open("checkpoints")?;
//! let mut driver = PipelineDriver::new(
//!     ReduceParams::default(),
//!     PipelineRunMode::FreshRun,
//!     store,
//! )?;
//! let outputs = driver.run(&observation)?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod reduction;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bundle::{slots, StateBundle};
    pub use crate::checkpoint::{
        CheckpointRecord, CheckpointStore, FsCheckpointStore, MemoryCheckpointStore, StageId,
    };
    pub use crate::config::{AxisSelection, ReduceParams, Selection, SpectrumWindow};
    pub use crate::driver::{PipelineDriver, ReductionOutputs};
    pub use crate::engine::{
        PipelineRunMode, RestartController, RestartState, StageCounter, StageRunner, Verdict,
    };
    pub use crate::errors::ReduceError;
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, RunIdentity};
    pub use crate::reduction::table::{DataRow, Observation};
}

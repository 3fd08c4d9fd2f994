//! Structured event emission for stage transitions.
//!
//! The engine emits one event per stage transition; rendering (log files,
//! HTML summaries) is an external collaborator behind the [`EventSink`]
//! trait.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

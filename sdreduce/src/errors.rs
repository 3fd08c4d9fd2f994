//! Error types for the reduction engine.
//!
//! Nothing in this taxonomy is recovered locally: a checkpoint problem or a
//! stage-body failure terminates the run, and the last successfully completed
//! stage id is the natural resume point for the next invocation.

use crate::checkpoint::StageId;
use thiserror::Error;

/// The main error type for reduction operations.
#[derive(Debug, Error)]
pub enum ReduceError {
    /// A skip-and-reload verdict could not find a required persisted key.
    ///
    /// Fatal: reloading a default value in its place would silently
    /// desynchronize the bundle from what downstream stages assume.
    #[error("no checkpoint record holds key '{key}' at or before stage {stage_id}")]
    CheckpointMissing {
        /// The stage id the reload was issued for.
        stage_id: StageId,
        /// The bundle slot that could not be resolved.
        key: String,
    },

    /// The checkpoint store could not reach durable storage.
    ///
    /// Fatal at the point of occurrence; never retried, since a partial
    /// write that already landed would desynchronize stage numbering.
    #[error("checkpoint store unavailable while {context}: {source}")]
    StoreUnavailable {
        /// What the store was doing when the failure occurred.
        context: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A scientific stage body failed.
    #[error("stage {stage_id} '{stage_name}' failed: {message}")]
    StageBody {
        /// The stage id at which the failure occurred.
        stage_id: StageId,
        /// The diagnostic stage label.
        stage_name: String,
        /// Description of the failure.
        message: String,
    },

    /// A requested bundle slot is not present.
    #[error("bundle slot '{0}' is not present")]
    MissingSlot(String),

    /// The operator requested a resume point beyond the recorded history.
    #[error("invalid resume point {requested}: last recorded stage is {last}")]
    InvalidResumePoint {
        /// The requested resume point.
        requested: StageId,
        /// The highest stage id present in the store.
        last: StageId,
    },

    /// Selection parameters differ from those of the checkpointed run.
    ///
    /// Resume is only defined for an unchanged selection; a different
    /// selection would renumber stages and silently corrupt the reload.
    #[error("selection changed since the checkpointed run (was {recorded}, now {current})")]
    SelectionMismatch {
        /// Fingerprint recorded by the prior run.
        recorded: String,
        /// Fingerprint of the current parameters.
        current: String,
    },

    /// The observation handed to the driver cannot be reduced.
    #[error("invalid observation: {0}")]
    InvalidObservation(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error outside the checkpoint store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReduceError {
    /// Wraps a store I/O failure with the operation that triggered it.
    pub fn store(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
            source,
        }
    }

    /// Builds a stage-body failure for the given stage identity.
    pub fn stage_body(
        stage_id: StageId,
        stage_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StageBody {
            stage_id,
            stage_name: stage_name.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_missing_names_stage_and_key() {
        let err = ReduceError::CheckpointMissing {
            stage_id: StageId::new(7),
            key: "data_table".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("stage 7"));
        assert!(msg.contains("data_table"));
    }

    #[test]
    fn store_unavailable_carries_context() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ReduceError::store("clearing history", io);
        assert!(err.to_string().contains("clearing history"));
    }

    #[test]
    fn stage_body_names_identity() {
        let err = ReduceError::stage_body(StageId::new(3), "BaselineFit:spw=0:pol=1", "fit failed");
        let msg = err.to_string();
        assert!(msg.contains("stage 3"));
        assert!(msg.contains("BaselineFit:spw=0:pol=1"));
    }
}

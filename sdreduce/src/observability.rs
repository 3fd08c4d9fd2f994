//! Tracing setup and run identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Installs the global tracing subscriber, filtered by `RUST_LOG`.
///
/// With `json` set the output is newline-delimited JSON, suitable for log
/// shipping from batch hosts. Returns `false` when a subscriber was already
/// installed, which is the normal case under test harnesses.
pub fn init_tracing(json: bool) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}

/// Identifies one reduction run in logs and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// When the run was constructed.
    pub started_at: DateTime<Utc>,
}

impl RunIdentity {
    /// Mints a fresh identity stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for RunIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunIdentity::new().run_id, RunIdentity::new().run_id);
    }
}

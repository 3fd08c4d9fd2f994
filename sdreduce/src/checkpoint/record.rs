//! Stage identity and the persisted checkpoint record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Monotonic identity of a stage within one pipeline run.
///
/// Ids assigned during a run are strictly increasing and gapless,
/// starting at 1; the value 0 denotes "before any stage" and doubles as
/// the "start fresh" resume point.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StageId(u64);

impl StageId {
    /// The id preceding the first stage.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw stage number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw stage number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the id of the following stage.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for StageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One persisted checkpoint: the named bundle slots a stage chose to keep.
///
/// A record never holds the whole bundle; stages persist only the slots they
/// created or mutated, and reads resolve each key against the most recent
/// record at or before the requested stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// The stage this record belongs to.
    pub stage_id: StageId,
    /// Diagnostic stage label; never used for identity or ordering.
    pub stage_name: String,
    /// When the record was written.
    pub written_at: DateTime<Utc>,
    /// The persisted slot subset.
    pub slots: BTreeMap<String, serde_json::Value>,
}

impl CheckpointRecord {
    /// Builds a record stamped with the current time.
    #[must_use]
    pub fn new(
        stage_id: StageId,
        stage_name: impl Into<String>,
        slots: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            stage_id,
            stage_name: stage_name.into(),
            written_at: Utc::now(),
            slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ids_order_by_value() {
        assert!(StageId::new(1) < StageId::new(2));
        assert_eq!(StageId::ZERO.next(), StageId::new(1));
        assert_eq!(StageId::new(5).value(), 5);
    }

    #[test]
    fn record_serde_round_trip() {
        let mut slots = BTreeMap::new();
        slots.insert("data_table".to_string(), serde_json::json!([1, 2, 3]));
        let record = CheckpointRecord::new(StageId::new(4), "Grouping:spw=0:pol=1", slots);

        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: CheckpointRecord = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.stage_id, StageId::new(4));
        assert_eq!(decoded.stage_name, "Grouping:spw=0:pol=1");
        assert_eq!(decoded.slots.len(), 1);
    }
}

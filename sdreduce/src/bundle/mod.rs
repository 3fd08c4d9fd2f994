//! The working-state bundle threaded through every stage.
//!
//! A [`StateBundle`] maps slot names to opaque serialized values. It is the
//! unit of persistence: the checkpoint store reads and writes named subsets
//! of slots, never individual values across calls. Stage bodies mutate slots
//! in place; a skip-and-reload replaces the relevant subset wholesale from
//! the store, so a bundle is never left partially invalidated.
//!
//! Slot names replace the positional buffer indices of older reductions
//! (`SpStorage[0]`, `SpStorage[1]`, ...) with an explicit mapping, see
//! [`slots`].

use crate::errors::ReduceError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Well-known slot names.
///
/// The spectral buffers map onto the positional storage of the original
/// reduction as follows: raw spectra as read (`SP_RAW`), the working copy
/// that baseline removal mutates (`SP_WORK`), the position-accumulated
/// spectra that line detection consumes (`SP_ACCUMULATED`), and the
/// re-gridded output (`SP_GRIDDED`).
pub mod slots {
    /// Per-row metadata table (statistics and flags included).
    pub const DATA_TABLE: &str = "data_table";
    /// Raw spectra exactly as read from the observation.
    pub const SP_RAW: &str = "sp_raw";
    /// Working spectra, mutated by tentative and polynomial baseline removal.
    pub const SP_WORK: &str = "sp_work";
    /// Spectra accumulated around each sky position.
    pub const SP_ACCUMULATED: &str = "sp_accumulated";
    /// Spectra combined onto the output grid.
    pub const SP_GRIDDED: &str = "sp_gridded";
    /// Position-grouping dictionary over the baseline rows.
    pub const POS_DICT_ALL: &str = "pos_dict_all";
    /// Position-grouping dictionary over the selected rows.
    pub const POS_DICT: &str = "pos_dict";
    /// Two-level time-grouping table.
    pub const TIME_TABLE: &str = "time_table";
    /// Small/large time-gap row lists.
    pub const TIME_GAP: &str = "time_gap";
    /// Observing-pattern classification.
    pub const PATTERN: &str = "pattern";
    /// Raw per-row line detections.
    pub const DETECTED_LINES: &str = "detected_lines";
    /// Cluster-validated line ranges.
    pub const LINES: &str = "lines";
    /// Selected polynomial fit order.
    pub const FIT_ORDER: &str = "fit_order";
    /// Output-grid cell assignment table.
    pub const GRID_TABLE: &str = "grid_table";
    /// Per-grid-cell result metadata.
    pub const RESULT_TABLE: &str = "result_table";
    /// Assembled image cube for the current spw/pol/iteration.
    pub const IMAGE_CUBE: &str = "image_cube";
    /// Fingerprint of the selection parameters, checked on resume.
    pub const SELECTION_FINGERPRINT: &str = "selection_fingerprint";
}

/// Named-slot working state for one pipeline run.
///
/// Values are stored as `serde_json::Value` so the engine stays agnostic of
/// the scientific payload types; [`StateBundle::put`] and [`StateBundle::get`]
/// convert at the boundary.
#[derive(Debug, Clone, Default)]
pub struct StateBundle {
    data: BTreeMap<String, serde_json::Value>,
}

impl StateBundle {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `value` into the named slot, overwriting any prior value.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `value` cannot be encoded.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), ReduceError> {
        let encoded = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), encoded);
        Ok(())
    }

    /// Deserializes the named slot into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ReduceError::MissingSlot`] if the slot is absent, or a
    /// serialization error if the stored value does not decode as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ReduceError> {
        let value = self
            .data
            .get(key)
            .ok_or_else(|| ReduceError::MissingSlot(key.to_string()))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Stores a raw value into the named slot.
    pub fn put_raw(&mut self, key: &str, value: serde_json::Value) {
        self.data.insert(key.to_string(), value);
    }

    /// Checks whether a slot is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Copies the named slots out of the bundle.
    ///
    /// # Errors
    ///
    /// Returns [`ReduceError::MissingSlot`] if any requested slot is absent;
    /// persisting a slot a stage never produced is a caller bug.
    pub fn extract(&self, keys: &[&str]) -> Result<BTreeMap<String, serde_json::Value>, ReduceError> {
        let mut out = BTreeMap::new();
        for &key in keys {
            let value = self
                .data
                .get(key)
                .ok_or_else(|| ReduceError::MissingSlot(key.to_string()))?;
            out.insert(key.to_string(), value.clone());
        }
        Ok(out)
    }

    /// Merges reloaded slots into the bundle, replacing existing values.
    ///
    /// Slots not named in `values` are left untouched.
    pub fn merge(&mut self, values: BTreeMap<String, serde_json::Value>) {
        self.data.extend(values);
    }

    /// Returns the slot names currently present.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    /// Returns the number of populated slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no slot is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

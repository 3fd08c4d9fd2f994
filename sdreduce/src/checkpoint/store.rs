//! Checkpoint store backends.
//!
//! The filesystem store keeps one JSON file per stage id and writes through
//! a temp file plus atomic rename, so no reader can observe a torn record.
//! The in-memory store backs unit tests.

use super::{CheckpointRecord, StageId};
use crate::bundle::StateBundle;
use crate::errors::ReduceError;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persists and retrieves per-stage state records.
///
/// Callers guarantee that each stage id is written at most once per run;
/// the store does not police duplicate writes (a fresh run always begins
/// with [`CheckpointStore::clear`]).
pub trait CheckpointStore {
    /// Deletes every persisted record for the current run.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::StoreUnavailable`] if the underlying
    /// storage cannot be cleared; continuing would silently mix old and
    /// new checkpoints.
    fn clear(&mut self) -> Result<(), ReduceError>;

    /// Persists the named subset of `bundle` as the record for `stage_id`.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::MissingSlot`] if a named slot is absent
    /// from the bundle, or [`ReduceError::StoreUnavailable`] on I/O failure.
    fn write(
        &mut self,
        stage_id: StageId,
        stage_name: &str,
        keys: &[&str],
        bundle: &StateBundle,
    ) -> Result<(), ReduceError>;

    /// Loads the named keys into `bundle`, resolving each against the most
    /// recent record at or before `stage_id`. Keys not requested are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::CheckpointMissing`] if any requested key
    /// has no record at or before `stage_id`; this is always fatal for the
    /// caller.
    fn read(
        &self,
        stage_id: StageId,
        keys: &[&str],
        bundle: &mut StateBundle,
    ) -> Result<(), ReduceError>;

    /// Returns the highest stage id with a persisted record, or
    /// [`StageId::ZERO`] when no history exists. This is the operator's
    /// upper bound when choosing a resume point.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::StoreUnavailable`] if the history cannot
    /// be enumerated.
    fn last_stage_id(&self) -> Result<StageId, ReduceError>;
}

impl<S: CheckpointStore + ?Sized> CheckpointStore for &mut S {
    fn clear(&mut self) -> Result<(), ReduceError> {
        (**self).clear()
    }

    fn write(
        &mut self,
        stage_id: StageId,
        stage_name: &str,
        keys: &[&str],
        bundle: &StateBundle,
    ) -> Result<(), ReduceError> {
        (**self).write(stage_id, stage_name, keys, bundle)
    }

    fn read(
        &self,
        stage_id: StageId,
        keys: &[&str],
        bundle: &mut StateBundle,
    ) -> Result<(), ReduceError> {
        (**self).read(stage_id, keys, bundle)
    }

    fn last_stage_id(&self) -> Result<StageId, ReduceError> {
        (**self).last_stage_id()
    }
}

fn merge_records<'a>(
    records: impl Iterator<Item = &'a CheckpointRecord>,
    stage_id: StageId,
    keys: &[&str],
    bundle: &mut StateBundle,
) -> Result<(), ReduceError> {
    let mut resolved: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    // Newest-first iteration; the first record holding a key wins.
    for record in records {
        for &key in keys {
            if !resolved.contains_key(key) {
                if let Some(value) = record.slots.get(key) {
                    resolved.insert(key.to_string(), value.clone());
                }
            }
        }
        if resolved.len() == keys.len() {
            break;
        }
    }
    for &key in keys {
        if !resolved.contains_key(key) {
            return Err(ReduceError::CheckpointMissing {
                stage_id,
                key: key.to_string(),
            });
        }
    }
    bundle.merge(resolved);
    Ok(())
}

/// Filesystem-backed checkpoint store: one JSON record per stage id.
#[derive(Debug)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    /// Opens (creating if necessary) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::StoreUnavailable`] if the directory cannot
    /// be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ReduceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ReduceError::store(format!("creating {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, stage_id: StageId) -> PathBuf {
        self.dir.join(format!("stage-{:06}.json", stage_id.value()))
    }

    /// Lists persisted stage ids in ascending order.
    fn stage_ids(&self) -> Result<Vec<StageId>, ReduceError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ReduceError::store(format!("listing {}", self.dir.display()), e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| ReduceError::store("listing checkpoint directory", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name
                .strip_prefix("stage-")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(StageId::new(id));
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn load(&self, stage_id: StageId) -> Result<CheckpointRecord, ReduceError> {
        let path = self.record_path(stage_id);
        let file = File::open(&path)
            .map_err(|e| ReduceError::store(format!("opening {}", path.display()), e))?;
        let record = serde_json::from_reader(BufReader::new(file))?;
        Ok(record)
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn clear(&mut self) -> Result<(), ReduceError> {
        for id in self.stage_ids()? {
            let path = self.record_path(id);
            fs::remove_file(&path)
                .map_err(|e| ReduceError::store(format!("removing {}", path.display()), e))?;
        }
        info!(dir = %self.dir.display(), "cleared checkpoint history");
        Ok(())
    }

    fn write(
        &mut self,
        stage_id: StageId,
        stage_name: &str,
        keys: &[&str],
        bundle: &StateBundle,
    ) -> Result<(), ReduceError> {
        let slots = bundle.extract(keys)?;
        let record = CheckpointRecord::new(stage_id, stage_name, slots);

        let tmp_path = self.dir.join(format!("stage-{:06}.tmp", stage_id.value()));
        let file = File::create(&tmp_path)
            .map_err(|e| ReduceError::store(format!("creating {}", tmp_path.display()), e))?;
        serde_json::to_writer(BufWriter::new(file), &record)?;

        let path = self.record_path(stage_id);
        fs::rename(&tmp_path, &path)
            .map_err(|e| ReduceError::store(format!("renaming to {}", path.display()), e))?;
        debug!(stage_id = stage_id.value(), stage_name, keys = ?keys, "checkpoint written");
        Ok(())
    }

    fn read(
        &self,
        stage_id: StageId,
        keys: &[&str],
        bundle: &mut StateBundle,
    ) -> Result<(), ReduceError> {
        let mut candidates: Vec<StageId> = self
            .stage_ids()?
            .into_iter()
            .filter(|id| *id <= stage_id)
            .collect();
        candidates.reverse();

        let mut records = Vec::with_capacity(candidates.len());
        for id in candidates {
            records.push(self.load(id)?);
        }
        merge_records(records.iter(), stage_id, keys, bundle)?;
        debug!(stage_id = stage_id.value(), keys = ?keys, "checkpoint reloaded");
        Ok(())
    }

    fn last_stage_id(&self) -> Result<StageId, ReduceError> {
        Ok(self.stage_ids()?.last().copied().unwrap_or(StageId::ZERO))
    }
}

/// In-memory checkpoint store for tests and transient tooling.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    records: BTreeMap<StageId, CheckpointRecord>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of persisted records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no record has been persisted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the record for `stage_id`, if present.
    #[must_use]
    pub fn record(&self, stage_id: StageId) -> Option<&CheckpointRecord> {
        self.records.get(&stage_id)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn clear(&mut self) -> Result<(), ReduceError> {
        self.records.clear();
        Ok(())
    }

    fn write(
        &mut self,
        stage_id: StageId,
        stage_name: &str,
        keys: &[&str],
        bundle: &StateBundle,
    ) -> Result<(), ReduceError> {
        let slots = bundle.extract(keys)?;
        self.records
            .insert(stage_id, CheckpointRecord::new(stage_id, stage_name, slots));
        Ok(())
    }

    fn read(
        &self,
        stage_id: StageId,
        keys: &[&str],
        bundle: &mut StateBundle,
    ) -> Result<(), ReduceError> {
        let records = self
            .records
            .range(..=stage_id)
            .rev()
            .map(|(_, record)| record);
        merge_records(records, stage_id, keys, bundle)
    }

    fn last_stage_id(&self) -> Result<StageId, ReduceError> {
        Ok(self
            .records
            .keys()
            .next_back()
            .copied()
            .unwrap_or(StageId::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bundle_with(pairs: &[(&str, serde_json::Value)]) -> StateBundle {
        let mut bundle = StateBundle::new();
        for (key, value) in pairs {
            bundle.put_raw(key, value.clone());
        }
        bundle
    }

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryCheckpointStore::new();
        let bundle = bundle_with(&[("a", serde_json::json!(1))]);
        store
            .write(StageId::new(1), "Stage1", &["a"], &bundle)
            .unwrap();

        let mut out = StateBundle::new();
        store.read(StageId::new(1), &["a"], &mut out).unwrap();
        assert_eq!(out.get::<u64>("a").unwrap(), 1);
    }

    #[test]
    fn read_resolves_keys_against_earlier_records() {
        let mut store = MemoryCheckpointStore::new();
        store
            .write(
                StageId::new(1),
                "Stage1",
                &["a"],
                &bundle_with(&[("a", serde_json::json!(10))]),
            )
            .unwrap();
        store
            .write(
                StageId::new(2),
                "Stage2",
                &["b"],
                &bundle_with(&[("b", serde_json::json!(20))]),
            )
            .unwrap();

        // Stage 2 never persisted "a"; it must come from stage 1.
        let mut out = StateBundle::new();
        store.read(StageId::new(2), &["a", "b"], &mut out).unwrap();
        assert_eq!(out.get::<u64>("a").unwrap(), 10);
        assert_eq!(out.get::<u64>("b").unwrap(), 20);
    }

    #[test]
    fn read_prefers_the_most_recent_record() {
        let mut store = MemoryCheckpointStore::new();
        store
            .write(
                StageId::new(1),
                "Stage1",
                &["a"],
                &bundle_with(&[("a", serde_json::json!(1))]),
            )
            .unwrap();
        store
            .write(
                StageId::new(3),
                "Stage3",
                &["a"],
                &bundle_with(&[("a", serde_json::json!(3))]),
            )
            .unwrap();

        let mut out = StateBundle::new();
        store.read(StageId::new(2), &["a"], &mut out).unwrap();
        assert_eq!(out.get::<u64>("a").unwrap(), 1);

        store.read(StageId::new(3), &["a"], &mut out).unwrap();
        assert_eq!(out.get::<u64>("a").unwrap(), 3);
    }

    #[test]
    fn missing_key_is_fatal() {
        let store = MemoryCheckpointStore::new();
        let mut out = StateBundle::new();
        let err = store
            .read(StageId::new(5), &["data_table"], &mut out)
            .unwrap_err();
        assert!(matches!(err, ReduceError::CheckpointMissing { key, .. } if key == "data_table"));
    }

    #[test]
    fn unrequested_keys_are_left_untouched() {
        let mut store = MemoryCheckpointStore::new();
        store
            .write(
                StageId::new(1),
                "Stage1",
                &["a", "b"],
                &bundle_with(&[("a", serde_json::json!(1)), ("b", serde_json::json!(2))]),
            )
            .unwrap();

        let mut out = bundle_with(&[("b", serde_json::json!(99))]);
        store.read(StageId::new(1), &["a"], &mut out).unwrap();
        assert_eq!(out.get::<u64>("a").unwrap(), 1);
        assert_eq!(out.get::<u64>("b").unwrap(), 99);
    }

    #[test]
    fn fs_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsCheckpointStore::open(dir.path()).unwrap();

        store
            .write(
                StageId::new(1),
                "PreGrouping",
                &["a"],
                &bundle_with(&[("a", serde_json::json!(7))]),
            )
            .unwrap();
        store
            .write(
                StageId::new(2),
                "Grouping:spw=0:pol=0",
                &["b"],
                &bundle_with(&[("b", serde_json::json!(8))]),
            )
            .unwrap();

        assert_eq!(store.last_stage_id().unwrap(), StageId::new(2));

        let mut out = StateBundle::new();
        store.read(StageId::new(2), &["a", "b"], &mut out).unwrap();
        assert_eq!(out.get::<u64>("a").unwrap(), 7);
        assert_eq!(out.get::<u64>("b").unwrap(), 8);

        store.clear().unwrap();
        assert_eq!(store.last_stage_id().unwrap(), StageId::ZERO);
        assert!(store.read(StageId::new(2), &["a"], &mut out).is_err());
    }

    #[test]
    fn fs_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FsCheckpointStore::open(dir.path()).unwrap();
            store
                .write(
                    StageId::new(3),
                    "LineDetection:spw=1:pol=0:iter=0",
                    &["lines"],
                    &bundle_with(&[("lines", serde_json::json!([[10, 20]]))]),
                )
                .unwrap();
        }

        let store = FsCheckpointStore::open(dir.path()).unwrap();
        assert_eq!(store.last_stage_id().unwrap(), StageId::new(3));
        let mut out = StateBundle::new();
        store.read(StageId::new(3), &["lines"], &mut out).unwrap();
        assert!(out.contains("lines"));
    }
}

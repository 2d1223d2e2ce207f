//! Durable restore progress.
//!
//! A checkpoint is rewritten in full after every committed batch through a
//! temp file and rename, so the file on disk is always one complete snapshot.
//! Applying the same delta twice leaves both the in-memory state and the file
//! untouched the second time.

use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A reference nulled during import, to be set once its target exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingPatch {
    pub object: String,
    /// Source id of the record to update
    pub source_id: String,
    pub field: String,
    /// Source id of the referenced record
    pub referenced_id: String,
}

/// What one committed batch adds to a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointDelta {
    /// Source id to target id for records created by the batch
    pub mappings: Vec<(String, String)>,
    pub patches: Vec<PendingPatch>,
}

impl CheckpointDelta {
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty() && self.patches.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub backup_id: String,
    pub completed: BTreeSet<String>,
    /// Data rows already submitted, per object
    pub offsets: BTreeMap<String, u64>,
    /// Source id to target id, per object
    pub id_map: BTreeMap<String, BTreeMap<String, String>>,
    pub pending_patches: BTreeSet<PendingPatch>,
    #[serde(default)]
    pub patches_applied: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            completed: BTreeSet::new(),
            offsets: BTreeMap::new(),
            id_map: BTreeMap::new(),
            pending_patches: BTreeSet::new(),
            patches_applied: false,
            updated_at: Utc::now(),
        }
    }

    pub fn is_completed(&self, object: &str) -> bool {
        self.completed.contains(object)
    }

    pub fn offset(&self, object: &str) -> u64 {
        self.offsets.get(object).copied().unwrap_or(0)
    }

    pub fn target_id(&self, object: &str, source_id: &str) -> Option<&str> {
        self.id_map
            .get(object)
            .and_then(|m| m.get(source_id))
            .map(String::as_str)
    }

    /// First mapping of `source_id` among `objects`.
    pub fn find_target_id<'a, I>(&self, objects: I, source_id: &str) -> Option<&str>
    where
        I: IntoIterator<Item = &'a String>,
    {
        objects
            .into_iter()
            .find_map(|object| self.target_id(object, source_id))
    }

    pub fn mapped_count(&self, object: &str) -> usize {
        self.id_map.get(object).map_or(0, BTreeMap::len)
    }

    /// Merge a batch into the checkpoint. Returns whether anything changed.
    pub fn apply(&mut self, object: &str, completed: bool, offset: u64, delta: &CheckpointDelta) -> bool {
        let mut changed = false;

        if !delta.mappings.is_empty() {
            let map = self.id_map.entry(object.to_string()).or_default();
            for (source, target) in &delta.mappings {
                let previous = map.insert(source.clone(), target.clone());
                changed |= previous.as_ref() != Some(target);
            }
        }
        for patch in &delta.patches {
            changed |= self.pending_patches.insert(patch.clone());
        }

        // Offsets are set, never added, so replays cannot push them forward.
        let previous = self.offsets.insert(object.to_string(), offset);
        changed |= previous != Some(offset);

        if completed {
            changed |= self.completed.insert(object.to_string());
        }
        changed
    }
}

/// Persists checkpoints as `<backup_id>.checkpoint.json` in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.checkpoint.json", backup_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load(&self, backup_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path(backup_id);
        let body = match std::fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&body)?;
        if checkpoint.backup_id != backup_id {
            return Err(EngineError::Config(format!(
                "checkpoint {} belongs to backup {}",
                path.display(),
                checkpoint.backup_id
            )));
        }
        debug!(
            backup_id,
            completed = checkpoint.completed.len(),
            pending_patches = checkpoint.pending_patches.len(),
            "Loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Merge a committed batch into `checkpoint` and persist it.
    ///
    /// A delta that changes nothing is not written again.
    pub fn record(
        &self,
        checkpoint: &mut Checkpoint,
        object: &str,
        completed: bool,
        offset: u64,
        delta: &CheckpointDelta,
    ) -> Result<()> {
        if !checkpoint.apply(object, completed, offset, delta) {
            return Ok(());
        }
        checkpoint.updated_at = Utc::now();
        self.save(checkpoint)
    }

    pub fn mark_patches_applied(&self, checkpoint: &mut Checkpoint) -> Result<()> {
        if checkpoint.patches_applied {
            return Ok(());
        }
        checkpoint.patches_applied = true;
        checkpoint.updated_at = Utc::now();
        self.save(checkpoint)
    }

    pub fn remove(&self, backup_id: &str) -> Result<()> {
        match std::fs::remove_file(self.path(backup_id)) {
            Ok(()) => {
                info!(backup_id, "Removed checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        atomic_write_json(&self.path(&checkpoint.backup_id), checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn delta(mappings: &[(&str, &str)], patches: Vec<PendingPatch>) -> CheckpointDelta {
        CheckpointDelta {
            mappings: mappings
                .iter()
                .map(|(s, t)| (s.to_string(), t.to_string()))
                .collect(),
            patches,
        }
    }

    fn patch(source_id: &str, referenced_id: &str) -> PendingPatch {
        PendingPatch {
            object: "Contact".into(),
            source_id: source_id.into(),
            field: "ReportsToId".into(),
            referenced_id: referenced_id.into(),
        }
    }

    #[test]
    fn test_missing_checkpoint_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("bk_001").unwrap().is_none());
        store.remove("bk_001").unwrap();
    }

    #[test]
    fn test_record_persists_every_batch() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut checkpoint = Checkpoint::new("bk_001");

        store
            .record(&mut checkpoint, "A", false, 200, &delta(&[("a1", "t1")], vec![]))
            .unwrap();
        store
            .record(&mut checkpoint, "A", true, 250, &delta(&[("a2", "t2")], vec![]))
            .unwrap();
        store
            .record(&mut checkpoint, "B", false, 200, &delta(&[], vec![patch("c2", "c1")]))
            .unwrap();

        let loaded = store.load("bk_001").unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(loaded.is_completed("A"));
        assert!(!loaded.is_completed("B"));
        assert_eq!(loaded.offset("A"), 250);
        assert_eq!(loaded.offset("B"), 200);
        assert_eq!(loaded.offset("C"), 0);
        assert_eq!(loaded.target_id("A", "a2"), Some("t2"));
        assert_eq!(loaded.mapped_count("A"), 2);
        assert_eq!(loaded.pending_patches.len(), 1);
    }

    #[test]
    fn test_replaying_a_delta_is_a_no_op() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut checkpoint = Checkpoint::new("bk_001");
        let d = delta(&[("b1", "t1"), ("b2", "t2")], vec![patch("b2", "b1")]);

        store.record(&mut checkpoint, "B", false, 2, &d).unwrap();
        let once = checkpoint.clone();
        let bytes_once = std::fs::read(store.path("bk_001")).unwrap();

        store.record(&mut checkpoint, "B", false, 2, &d).unwrap();
        assert_eq!(checkpoint, once);
        assert_eq!(std::fs::read(store.path("bk_001")).unwrap(), bytes_once);
        assert!(!checkpoint.apply("B", false, 2, &d));
    }

    #[test]
    fn test_patches_applied_flag_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut checkpoint = Checkpoint::new("bk_001");
        store.mark_patches_applied(&mut checkpoint).unwrap();

        assert!(store.load("bk_001").unwrap().unwrap().patches_applied);
        store.remove("bk_001").unwrap();
        assert!(!store.path("bk_001").exists());
    }

    #[test]
    fn test_find_target_id_searches_candidates_in_order() {
        let mut checkpoint = Checkpoint::new("bk");
        checkpoint.apply("User", true, 1, &delta(&[("005a", "005t")], vec![]));
        checkpoint.apply("Group", true, 1, &delta(&[("00Ga", "00Gt")], vec![]));
        let candidates = vec!["User".to_string(), "Group".to_string()];
        assert_eq!(checkpoint.find_target_id(&candidates, "00Ga"), Some("00Gt"));
        assert_eq!(checkpoint.find_target_id(&candidates, "001x"), None);
    }

    #[test]
    fn test_checkpoint_for_other_backup_is_refused() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let mut other = Checkpoint::new("bk_002");
        store.record(&mut other, "A", true, 1, &CheckpointDelta::default()).unwrap();
        std::fs::rename(store.path("bk_002"), store.path("bk_001")).unwrap();

        assert!(matches!(store.load("bk_001"), Err(EngineError::Config(_))));
    }
}

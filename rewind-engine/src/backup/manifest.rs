//! Backup manifest, serialized as `manifest.json` in the backup directory.
//!
//! The manifest is written when a backup starts and rewritten when it ends,
//! so a directory without a `complete` manifest is always recognisable as
//! an unfinished backup.

use crate::schema::ObjectDescribe;
use crate::utils::errors::{EngineError, Result};
use crate::utils::fs::atomic_write_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BackupStatus,
    pub objects: Vec<ManifestObject>,
    #[serde(default)]
    pub total_records: u64,
}

/// One exported object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestObject {
    pub name: String,
    /// Data file name, relative to the backup directory
    pub file: String,
    /// Column order of the data file
    pub fields: Vec<String>,
    pub record_count: u64,
    /// Relationships that point at other objects in the same backup
    #[serde(default)]
    pub relationships: Vec<ManifestRelationship>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRelationship {
    pub field: String,
    pub references: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship_name: Option<String>,
}

impl Manifest {
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            backup_id: backup_id.into(),
            created_at: Utc::now(),
            completed_at: None,
            status: BackupStatus::InProgress,
            objects: Vec::new(),
            total_records: 0,
        }
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let body = std::fs::read(&path).map_err(|e| {
            EngineError::IncompleteBackup(format!("cannot read {}: {}", path.display(), e))
        })?;
        let manifest: Manifest = serde_json::from_slice(&body)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(EngineError::IncompleteBackup(format!(
                "manifest version {} is newer than supported version {}",
                manifest.version, MANIFEST_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        atomic_write_json(&dir.join(MANIFEST_FILE), self)
    }

    /// Stamp the final status and totals.
    pub fn finalize(&mut self, status: BackupStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        self.total_records = self.objects.iter().map(|o| o.record_count).sum();
    }

    pub fn object(&self, name: &str) -> Option<&ManifestObject> {
        self.objects.iter().find(|o| o.name == name)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.name.clone()).collect()
    }

    /// Refuse anything but a finished backup.
    pub fn ensure_restorable(&self) -> Result<()> {
        if self.status != BackupStatus::Complete {
            return Err(EngineError::IncompleteBackup(format!(
                "backup {} has status {:?}",
                self.backup_id, self.status
            )));
        }
        Ok(())
    }

    /// Fill in in-set relationships from the describes of the exported objects.
    pub fn record_relationships<'a, I>(&mut self, describes: I)
    where
        I: IntoIterator<Item = &'a ObjectDescribe>,
    {
        let names = self.object_names();
        for describe in describes {
            let Some(entry) = self.objects.iter_mut().find(|o| o.name == describe.name) else {
                continue;
            };
            entry.relationships = describe
                .fields
                .iter()
                .filter(|f| entry.fields.contains(&f.name))
                .flat_map(|f| {
                    f.reference_to
                        .iter()
                        .filter(|t| names.contains(t))
                        .map(move |t| ManifestRelationship {
                            field: f.name.clone(),
                            references: t.clone(),
                            relationship_name: f.relationship_name.clone(),
                        })
                })
                .collect();
        }
    }
}

impl ManifestObject {
    pub fn new(name: &str, fields: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            file: data_file_name(name),
            fields,
            record_count: 0,
            relationships: Vec::new(),
        }
    }
}

pub fn data_file_name(object: &str) -> String {
    format!("{}.csv", object)
}

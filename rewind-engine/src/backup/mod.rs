//! Backup engine - streams object records from the source environment into
//! one CSV file per object plus a manifest.
//!
//! Records are written page by page as the query cursor yields them; at most
//! one page is held in memory regardless of how many rows an object has.

pub mod manifest;

use crate::audit::{AuditLog, BACKUP_LOG};
use crate::events::{EngineEvent, EventBus, Phase};
use crate::schema::{MetadataCache, ObjectDescribe};
use crate::session::SessionManager;
use crate::utils::errors::{Aborted, EngineError, Result};
use chrono::Utc;
use manifest::{BackupStatus, Manifest, ManifestObject, MANIFEST_FILE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Timestamp layout of generated backup ids
pub const BACKUP_ID_FORMAT: &str = "backup_%Y%m%d_%H%M%S";

/// What to export for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSelection {
    pub name: String,
    /// Explicit columns; every exportable field when `None`
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

impl ObjectSelection {
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: None,
        }
    }

    pub fn with_fields<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    /// Objects in export order
    pub objects: Vec<ObjectSelection>,
    /// Parent directory; the backup gets its own subdirectory
    pub destination: PathBuf,
    /// Backup id; generated from the current time when `None`
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectExport {
    pub name: String,
    pub records: u64,
}

/// Outcome of a backup, also carried by [`Aborted`] when it stops early.
#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub backup_id: String,
    pub directory: PathBuf,
    pub status: BackupStatus,
    pub objects: Vec<ObjectExport>,
    pub total_records: u64,
    pub duration_secs: u64,
}

impl BackupSummary {
    fn from_manifest(manifest: &Manifest, directory: &Path, started: Instant) -> Self {
        Self {
            backup_id: manifest.backup_id.clone(),
            directory: directory.to_path_buf(),
            status: manifest.status,
            objects: manifest
                .objects
                .iter()
                .map(|o| ObjectExport {
                    name: o.name.clone(),
                    records: o.record_count,
                })
                .collect(),
            total_records: manifest.total_records,
            duration_secs: started.elapsed().as_secs(),
        }
    }
}

pub fn generate_backup_id() -> String {
    Utc::now().format(BACKUP_ID_FORMAT).to_string()
}

pub struct BackupEngine {
    session: Arc<SessionManager>,
    cache: Arc<MetadataCache>,
    events: EventBus,
    batch_size: usize,
}

impl BackupEngine {
    pub fn new(
        session: Arc<SessionManager>,
        cache: Arc<MetadataCache>,
        events: EventBus,
        batch_size: usize,
    ) -> Self {
        Self {
            session,
            cache,
            events,
            batch_size,
        }
    }

    /// Execute a backup. Stops between pages once `cancel` fires.
    pub async fn run(
        &self,
        request: BackupRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<BackupSummary, Aborted<BackupSummary>> {
        let started = Instant::now();
        let backup_id = request.name.clone().unwrap_or_else(generate_backup_id);
        let dir = request.destination.join(&backup_id);
        let mut manifest = Manifest::new(&backup_id);

        if dir.join(MANIFEST_FILE).exists() {
            manifest.finalize(BackupStatus::Failed);
            let error = EngineError::Config(format!("backup {} already exists", dir.display()));
            return Err(Aborted::new(
                error,
                BackupSummary::from_manifest(&manifest, &dir, started),
            ));
        }

        info!(backup_id = %backup_id, objects = request.objects.len(), "Starting backup");
        let mut audit = AuditLog::new(&format!("Backup {}", backup_id));
        audit.entry("Destination", dir.display());

        let outcome = self
            .execute(&request, &dir, &mut manifest, &mut audit, &cancel)
            .await;

        let status = match &outcome {
            Ok(()) => BackupStatus::Complete,
            Err(e) if e.is_cancelled() => BackupStatus::Cancelled,
            Err(_) => BackupStatus::Failed,
        };
        manifest.finalize(status);

        audit.section("Backup Summary");
        audit.entry("Total Objects", manifest.objects.len());
        audit.entry("Total Records", manifest.total_records);
        audit.entry("Status", format!("{:?}", status));
        if let Err(e) = &outcome {
            audit.entry("Error", e);
        }

        let persisted = manifest
            .save(&dir)
            .and_then(|_| Ok(audit.write_to(&dir.join(BACKUP_LOG))?));
        let summary = BackupSummary::from_manifest(&manifest, &dir, started);

        let error = match (outcome, persisted) {
            (Ok(()), Ok(())) => {
                info!(
                    backup_id = %backup_id,
                    records = summary.total_records,
                    "Backup completed in {}s",
                    summary.duration_secs
                );
                self.events.broadcast(EngineEvent::BackupCompleted {
                    backup_id,
                    total_records: summary.total_records,
                    duration_secs: summary.duration_secs,
                });
                return Ok(summary);
            }
            (Ok(()), Err(e)) => e,
            (Err(e), persisted) => {
                if let Err(p) = persisted {
                    error!("Failed to finalize manifest for {}: {}", backup_id, p);
                }
                e
            }
        };

        if error.is_cancelled() {
            warn!(backup_id = %backup_id, "Backup cancelled");
        } else {
            error!(backup_id = %backup_id, "Backup failed: {}", error);
        }
        self.events.broadcast(EngineEvent::OperationFailed {
            phase: Phase::Backup,
            error: error.to_string(),
        });
        Err(Aborted::new(error, summary))
    }

    async fn execute(
        &self,
        request: &BackupRequest,
        dir: &Path,
        manifest: &mut Manifest,
        audit: &mut AuditLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        manifest.save(dir)?;
        self.events.broadcast(EngineEvent::BackupStarted {
            backup_id: manifest.backup_id.clone(),
            objects: request.objects.iter().map(|o| o.name.clone()).collect(),
        });

        // Resolve every column list before touching any data.
        let mut plan = Vec::with_capacity(request.objects.len());
        for selection in &request.objects {
            let describe = self.cache.describe(&selection.name).await?;
            let fields = select_fields(&describe, selection.fields.as_deref())?;
            plan.push((describe, fields));
        }

        audit.section("Export");
        for (describe, fields) in &plan {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let mut entry = ManifestObject::new(&describe.name, fields.clone());
            let exported = self.export_object(dir, &mut entry, cancel).await;
            match &exported {
                Ok(()) => {
                    audit.line(format!(
                        "  {}: {} records ({} fields)",
                        entry.name,
                        entry.record_count,
                        entry.fields.len()
                    ));
                    self.events.broadcast(EngineEvent::ObjectCompleted {
                        phase: Phase::Backup,
                        object_name: entry.name.clone(),
                        succeeded: entry.record_count,
                        failed: 0,
                    });
                }
                Err(e) => audit.line(format!(
                    "  {}: stopped after {} records: {}",
                    entry.name, entry.record_count, e
                )),
            }
            manifest.objects.push(entry);
            exported?;
            manifest.save(dir)?;
        }

        manifest.record_relationships(plan.iter().map(|(d, _)| &**d));
        let relationships: usize = manifest.objects.iter().map(|o| o.relationships.len()).sum();
        audit.entry("Relationships detected", relationships);
        Ok(())
    }

    /// Stream one object into its data file, counting rows into `entry`.
    async fn export_object(
        &self,
        dir: &Path,
        entry: &mut ManifestObject,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = dir.join(&entry.file);
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&entry.fields)?;
        writer.flush()?;

        let api = self.session.api();
        let object = entry.name.as_str();
        let fields = entry.fields.as_slice();
        let batch_size = self.batch_size;
        let mut locator: Option<String> = None;

        loop {
            let page = match locator.as_deref() {
                None => {
                    self.session
                        .with_session(|s| async move { api.query(&s, object, fields, batch_size).await })
                        .await?
                }
                Some(locator) => {
                    self.session
                        .with_session(|s| async move { api.query_more(&s, locator).await })
                        .await?
                }
            };

            for record in &page.records {
                writer.write_record(fields.iter().map(|f| cell(record.get(f))))?;
            }
            writer.flush()?;

            entry.record_count += page.records.len() as u64;
            debug!(
                object = %object,
                page = page.records.len(),
                done = entry.record_count,
                "Wrote page"
            );
            self.events
                .progress(Phase::Backup, object, entry.record_count, page.total_size);

            locator = page.next;
            if locator.is_none() {
                break;
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }

        info!(object = %object, records = entry.record_count, "Exported {}", path.display());
        Ok(())
    }
}

/// Column list for an object: `Id` first, then the selection (or every
/// exportable field) in order.
fn select_fields(describe: &ObjectDescribe, selected: Option<&[String]>) -> Result<Vec<String>> {
    let candidates = match selected {
        Some(list) => {
            for name in list {
                let field = describe.field(name).ok_or_else(|| {
                    EngineError::Schema(format!("{}.{} does not exist", describe.name, name))
                })?;
                if field.field_type.is_compound() {
                    return Err(EngineError::Schema(format!(
                        "{}.{} is a compound field and cannot be exported",
                        describe.name, name
                    )));
                }
            }
            list.to_vec()
        }
        None => describe.exportable_fields(),
    };

    let mut fields = vec!["Id".to_string()];
    for name in candidates {
        if !fields.contains(&name) {
            fields.push(name);
        }
    }
    Ok(fields)
}

/// Text form of a value in a data file; null is the empty cell.
fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

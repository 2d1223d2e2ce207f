//! Restore engine - replays a backup into the target environment in
//! dependency order.
//!
//! Objects are imported strictly one after another. After every committed
//! batch the new id mappings and any postponed references are persisted to
//! the [`CheckpointStore`] before the next batch is read, which is what makes
//! an interrupted restore resumable without duplicating completed work.
//! References that cannot be resolved at insert time (cycle edges,
//! self-references, targets imported later) are nulled and set by a second
//! update pass once every object has been imported.

pub mod checkpoint;

use crate::audit::{AuditLog, RESTORE_LOG};
use crate::backup::manifest::{Manifest, ManifestObject};
use crate::events::{EngineEvent, EventBus, Phase};
use crate::remote::rest::COLLECTION_LIMIT;
use crate::remote::{Record, WriteMode, WriteResult};
use crate::resolver::{self, Resolution};
use crate::schema::{FieldDescribe, FieldType, MetadataCache, ObjectDescribe};
use crate::session::SessionManager;
use crate::utils::errors::{Aborted, EngineError, Result};
use checkpoint::{Checkpoint, CheckpointDelta, CheckpointStore, PendingPatch};
use serde::Serialize;
use serde_json::{Number, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ID_FIELD: &str = "Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The target schema has no such field
    Absent,
    /// The field exists but cannot be set on insert
    NotCreateable,
}

/// A backup column that is not sent to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaDrop {
    pub object: String,
    pub field: String,
    pub reason: DropReason,
}

/// A record the target refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub object: String,
    pub source_id: String,
    /// Zero-based data row in the object's data file
    pub row: u64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObjectRestore {
    pub name: String,
    pub imported: u64,
    pub failed: u64,
    /// Already complete in the checkpoint this run resumed from
    pub skipped: bool,
}

/// Outcome of a restore, also carried by [`Aborted`] when it stops early.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreSummary {
    pub backup_id: String,
    pub order: Vec<String>,
    pub objects: Vec<ObjectRestore>,
    pub failures: Vec<RecordFailure>,
    pub dropped_fields: Vec<SchemaDrop>,
    pub patches_applied: u64,
    pub patches_failed: u64,
    /// References left empty because the referenced record never imported
    pub unresolved_references: u64,
    pub resumed: bool,
    pub duration_secs: u64,
}

impl RestoreSummary {
    pub fn imported(&self) -> u64 {
        self.objects.iter().map(|o| o.imported).sum()
    }

    pub fn failed(&self) -> u64 {
        self.objects.iter().map(|o| o.failed).sum()
    }

    fn object_mut(&mut self, name: &str) -> &mut ObjectRestore {
        if let Some(i) = self.objects.iter().position(|o| o.name == name) {
            return &mut self.objects[i];
        }
        self.objects.push(ObjectRestore {
            name: name.to_string(),
            ..ObjectRestore::default()
        });
        let last = self.objects.len() - 1;
        &mut self.objects[last]
    }
}

/// Dry-run view of a restore: processing order and schema drops.
#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub backup_id: String,
    pub order: Vec<String>,
    pub deferred: Vec<String>,
    pub dropped_fields: Vec<SchemaDrop>,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_dir: PathBuf,
    /// Continue from an existing checkpoint instead of starting over
    pub resume: bool,
}

/// How one backup column is sent to the target.
#[derive(Debug, Clone)]
struct Column {
    index: usize,
    field: FieldDescribe,
    /// Referenced objects that are part of this restore
    in_set: Vec<String>,
    /// Whether the field may also point at objects outside this restore
    references_outside: bool,
}

impl Column {
    fn is_reference(&self) -> bool {
        !self.in_set.is_empty()
    }
}

#[derive(Debug, Clone)]
struct ObjectPlan {
    name: String,
    file: String,
    header: Vec<String>,
    id_index: usize,
    record_count: u64,
    columns: Vec<Column>,
}

/// Everything derived from the manifest and the target schema before import.
struct Prepared {
    manifest: Manifest,
    plans: HashMap<String, ObjectPlan>,
    resolution: Resolution,
    dropped: Vec<SchemaDrop>,
}

pub struct RestoreEngine {
    session: Arc<SessionManager>,
    cache: Arc<MetadataCache>,
    events: EventBus,
    checkpoints: CheckpointStore,
    batch_size: usize,
}

impl RestoreEngine {
    pub fn new(
        session: Arc<SessionManager>,
        cache: Arc<MetadataCache>,
        events: EventBus,
        checkpoints: CheckpointStore,
        batch_size: usize,
    ) -> Self {
        Self {
            session,
            cache,
            events,
            checkpoints,
            batch_size,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Order and schema drops for a backup, without importing anything.
    pub async fn plan(&self, backup_dir: &Path) -> Result<RestorePlan> {
        let prepared = self.prepare(backup_dir).await?;
        Ok(RestorePlan {
            backup_id: prepared.manifest.backup_id,
            order: prepared.resolution.order,
            deferred: prepared
                .resolution
                .deferred
                .iter()
                .map(|e| e.to_string())
                .collect(),
            dropped_fields: prepared.dropped,
        })
    }

    /// Execute a restore. Stops between batches once `cancel` fires; the
    /// checkpoint is kept on every outcome but a finished run.
    pub async fn run(
        &self,
        request: RestoreRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<RestoreSummary, Aborted<RestoreSummary>> {
        let started = Instant::now();
        let mut summary = RestoreSummary {
            resumed: request.resume,
            ..RestoreSummary::default()
        };
        let mut audit = AuditLog::new(&format!("Restore from {}", request.backup_dir.display()));

        let outcome = self
            .execute(&request, &mut summary, &mut audit, &cancel)
            .await;
        summary.duration_secs = started.elapsed().as_secs();

        audit.section("Restore Summary");
        audit.entry("Total Objects Processed", summary.objects.len());
        audit.entry("Total Records Imported", summary.imported());
        audit.entry("Total Records Failed", summary.failed());
        audit.entry("Patches Applied", summary.patches_applied);
        audit.entry("Unresolved References", summary.unresolved_references);
        let status = match &outcome {
            Ok(()) if summary.failed() == 0 => "SUCCESS".to_string(),
            Ok(()) => "COMPLETED WITH ERRORS".to_string(),
            Err(e) => format!("ABORTED ({})", e),
        };
        audit.entry("Status", &status);
        if request.backup_dir.is_dir() {
            if let Err(e) = audit.write_to(&request.backup_dir.join(RESTORE_LOG)) {
                warn!("Failed to write restore log: {}", e);
            }
        }

        match outcome {
            Ok(()) => {
                info!(
                    backup_id = %summary.backup_id,
                    imported = summary.imported(),
                    failed = summary.failed(),
                    "Restore completed in {}s",
                    summary.duration_secs
                );
                self.events.broadcast(EngineEvent::RestoreCompleted {
                    backup_id: summary.backup_id.clone(),
                    imported: summary.imported(),
                    failed: summary.failed(),
                    duration_secs: summary.duration_secs,
                });
                Ok(summary)
            }
            Err(error) => {
                if error.is_cancelled() {
                    warn!(backup_id = %summary.backup_id, "Restore cancelled, checkpoint kept");
                } else {
                    error!(backup_id = %summary.backup_id, "Restore failed: {}", error);
                }
                self.events.broadcast(EngineEvent::OperationFailed {
                    phase: Phase::Restore,
                    error: error.to_string(),
                });
                Err(Aborted::new(error, summary))
            }
        }
    }

    async fn execute(
        &self,
        request: &RestoreRequest,
        summary: &mut RestoreSummary,
        audit: &mut AuditLog,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let prepared = self.prepare(&request.backup_dir).await?;
        let backup_id = prepared.manifest.backup_id.clone();
        summary.backup_id = backup_id.clone();
        summary.order = prepared.resolution.order.clone();
        summary.dropped_fields = prepared.dropped.clone();

        let existing = if request.resume {
            self.checkpoints.load(&backup_id)?
        } else {
            self.checkpoints.remove(&backup_id)?;
            None
        };
        summary.resumed = existing.is_some();
        let mut checkpoint = existing.unwrap_or_else(|| Checkpoint::new(&backup_id));

        info!(
            backup_id = %backup_id,
            order = ?prepared.resolution.order,
            resumed = summary.resumed,
            "Starting restore"
        );
        audit.entry("Backup", &backup_id);
        audit.entry("Order", prepared.resolution.order.join(" -> "));
        for edge in &prepared.resolution.deferred {
            audit.entry("Deferred", edge);
        }
        for drop in &prepared.dropped {
            audit.line(format!("Dropped {}.{} ({:?})", drop.object, drop.field, drop.reason));
        }
        self.events.broadcast(EngineEvent::RestoreStarted {
            backup_id: backup_id.clone(),
            order: prepared.resolution.order.clone(),
            resumed: summary.resumed,
        });

        audit.section("Import");
        for object in &prepared.resolution.order {
            let plan = prepared
                .plans
                .get(object)
                .ok_or_else(|| EngineError::Describe(object.clone()))?;

            if checkpoint.is_completed(object) {
                info!(object = %object, "Already restored, skipping");
                summary.object_mut(object).skipped = true;
                audit.line(format!("  {}: skipped (completed earlier)", object));
                continue;
            }

            let imported = self
                .import_object(&request.backup_dir, plan, &prepared.resolution, &mut checkpoint, summary, cancel)
                .await;
            let stats = summary.object_mut(object).clone();
            audit.line(format!(
                "  {}: {} imported, {} failed",
                object, stats.imported, stats.failed
            ));
            imported?;

            self.events.broadcast(EngineEvent::ObjectCompleted {
                phase: Phase::Restore,
                object_name: object.clone(),
                succeeded: stats.imported,
                failed: stats.failed,
            });
        }

        if !checkpoint.patches_applied {
            self.apply_patches(&prepared, &mut checkpoint, summary, cancel).await?;
            self.checkpoints.mark_patches_applied(&mut checkpoint)?;
        }
        audit.entry("Patches applied", summary.patches_applied);

        self.checkpoints.remove(&backup_id)?;
        Ok(())
    }

    /// Load the manifest, validate it against the target schema and resolve
    /// the processing order.
    async fn prepare(&self, backup_dir: &Path) -> Result<Prepared> {
        let manifest = Manifest::load(backup_dir)?;
        manifest.ensure_restorable()?;

        let names = manifest.object_names();
        let mut describes = HashMap::with_capacity(names.len());
        for name in &names {
            describes.insert(name.clone(), self.cache.describe(name).await?);
        }

        let mut plans = HashMap::with_capacity(names.len());
        let mut dropped = Vec::new();
        for object in &manifest.objects {
            let describe = &describes[&object.name];
            let (plan, drops) = plan_object(object, describe, &names)?;
            for drop in &drops {
                warn!(
                    object = %drop.object,
                    field = %drop.field,
                    reason = ?drop.reason,
                    "Field not restorable in target, dropping it from every record"
                );
                self.events.broadcast(EngineEvent::FieldDropped {
                    object_name: drop.object.clone(),
                    field: drop.field.clone(),
                    reason: match drop.reason {
                        DropReason::Absent => "absent".into(),
                        DropReason::NotCreateable => "not_createable".into(),
                    },
                });
            }
            dropped.extend(drops);
            plans.insert(object.name.clone(), plan);
        }

        let resolution = resolver::resolve(&names, &describes)?;
        Ok(Prepared {
            manifest,
            plans,
            resolution,
            dropped,
        })
    }

    async fn import_object(
        &self,
        backup_dir: &Path,
        plan: &ObjectPlan,
        resolution: &Resolution,
        checkpoint: &mut Checkpoint,
        summary: &mut RestoreSummary,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let path = backup_dir.join(&plan.file);
        let mut reader = csv::Reader::from_path(&path)?;
        let header: Vec<&str> = reader.headers()?.iter().collect();
        if header != plan.header {
            return Err(EngineError::IncompleteBackup(format!(
                "{} columns {:?} do not match the manifest {:?}",
                path.display(),
                header,
                plan.header
            )));
        }

        let mut offset = checkpoint.offset(&plan.name);
        if offset > 0 {
            info!(object = %plan.name, offset, "Resuming from checkpoint offset");
        }
        let mut rows = reader.into_records();
        for row in rows.by_ref().take(offset as usize) {
            row?;
        }

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut batch = Vec::with_capacity(self.batch_size);
            for row in rows.by_ref().take(self.batch_size) {
                batch.push(row?);
            }
            if batch.is_empty() {
                break;
            }

            let mut delta = CheckpointDelta::default();
            let mut source_ids = Vec::with_capacity(batch.len());
            let mut records = Vec::with_capacity(batch.len());
            for row in &batch {
                let source_id = row.get(plan.id_index).unwrap_or_default().to_string();
                let (record, unresolved) =
                    build_record(plan, row, &source_id, resolution, checkpoint, &mut delta.patches);
                summary.unresolved_references += unresolved;
                source_ids.push(source_id);
                records.push(record);
            }

            let results = self.write(&plan.name, WriteMode::Create, &records).await?;
            let stats = summary.object_mut(&plan.name);
            let mut failures = Vec::new();
            for (i, (source_id, result)) in source_ids.into_iter().zip(results).enumerate() {
                match result {
                    WriteResult { success: true, id: Some(target), .. } => {
                        stats.imported += 1;
                        delta.mappings.push((source_id, target));
                    }
                    WriteResult { error, .. } => {
                        stats.failed += 1;
                        failures.push(RecordFailure {
                            object: plan.name.clone(),
                            source_id,
                            row: offset + i as u64,
                            error: error.unwrap_or_else(|| "no id returned".into()),
                        });
                    }
                }
            }
            for failure in &failures {
                warn!(
                    object = %failure.object,
                    source_id = %failure.source_id,
                    "Record rejected: {}",
                    failure.error
                );
            }
            summary.failures.extend(failures);

            offset += batch.len() as u64;
            self.checkpoints
                .record(checkpoint, &plan.name, false, offset, &delta)?;
            debug!(object = %plan.name, offset, "Committed batch");
            self.events
                .progress(Phase::Restore, &plan.name, offset, Some(plan.record_count));
        }

        self.checkpoints
            .record(checkpoint, &plan.name, true, offset, &CheckpointDelta::default())?;
        info!(
            object = %plan.name,
            mapped = checkpoint.mapped_count(&plan.name),
            "Imported {}",
            plan.name
        );
        Ok(())
    }

    /// Set every postponed reference now that all objects are imported.
    async fn apply_patches(
        &self,
        prepared: &Prepared,
        checkpoint: &mut Checkpoint,
        summary: &mut RestoreSummary,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if checkpoint.pending_patches.is_empty() {
            return Ok(());
        }
        info!(patches = checkpoint.pending_patches.len(), "Applying postponed references");

        // object -> target record id -> fields to set
        let mut updates: BTreeMap<&str, BTreeMap<String, Record>> = BTreeMap::new();
        let mut unresolved = 0u64;
        for patch in &checkpoint.pending_patches {
            let Some(plan) = prepared.plans.get(&patch.object) else {
                continue;
            };
            // The record itself never imported; its failure is already reported.
            let Some(record_id) = checkpoint.target_id(&patch.object, &patch.source_id) else {
                continue;
            };
            let Some(column) = plan.columns.iter().find(|c| c.field.name == patch.field) else {
                continue;
            };

            let value = match checkpoint.find_target_id(&column.in_set, &patch.referenced_id) {
                Some(target) => target.to_string(),
                None if column.references_outside => patch.referenced_id.clone(),
                None => {
                    unresolved += 1;
                    continue;
                }
            };
            updates
                .entry(plan.name.as_str())
                .or_default()
                .entry(record_id.to_string())
                .or_insert_with(|| {
                    let mut record = Record::new();
                    record.insert(ID_FIELD.into(), Value::String(record_id.to_string()));
                    record
                })
                .insert(patch.field.clone(), Value::String(value));
        }
        summary.unresolved_references += unresolved;

        for object in &prepared.resolution.order {
            let Some(records) = updates.remove(object.as_str()) else {
                continue;
            };
            let records: Vec<Record> = records.into_values().collect();
            for chunk in records.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let results = self.write(object, WriteMode::Update, chunk).await?;
                for (record, result) in chunk.iter().zip(results) {
                    if result.success {
                        summary.patches_applied += (record.len() - 1) as u64;
                    } else {
                        summary.patches_failed += (record.len() - 1) as u64;
                        let target_id = record
                            .get(ID_FIELD)
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        warn!(object = %object, target_id, "Reference update rejected: {:?}", result.error);
                        summary.failures.push(RecordFailure {
                            object: object.clone(),
                            source_id: source_id_of(checkpoint, object, target_id),
                            row: 0,
                            error: result.error.unwrap_or_else(|| "update failed".into()),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Sends `records` one collection at a time. Each collection is its own
    /// retry unit, so reconnecting after a failed request never resends
    /// collections the platform already accepted.
    async fn write(&self, object: &str, mode: WriteMode, records: &[Record]) -> Result<Vec<WriteResult>> {
        let api = self.session.api();
        let mut results = Vec::with_capacity(records.len());
        for chunk in records.chunks(COLLECTION_LIMIT) {
            let written = self
                .session
                .with_session(|s| async move { api.bulk_write(&s, object, mode, chunk).await })
                .await?;
            if written.len() != chunk.len() {
                return Err(EngineError::Remote(format!(
                    "bulk {:?} on {} returned {} results for {} records",
                    mode,
                    object,
                    written.len(),
                    chunk.len()
                )));
            }
            results.extend(written);
        }
        Ok(results)
    }
}

/// Reverse lookup for reporting; only used on failures.
fn source_id_of(checkpoint: &Checkpoint, object: &str, target_id: &str) -> String {
    checkpoint
        .id_map
        .get(object)
        .and_then(|m| m.iter().find(|(_, t)| t.as_str() == target_id))
        .map(|(s, _)| s.clone())
        .unwrap_or_default()
}

/// Match a manifest entry against the target describe.
fn plan_object(
    object: &ManifestObject,
    describe: &ObjectDescribe,
    in_set: &[String],
) -> Result<(ObjectPlan, Vec<SchemaDrop>)> {
    let id_index = object
        .fields
        .iter()
        .position(|f| f == ID_FIELD)
        .ok_or_else(|| {
            EngineError::IncompleteBackup(format!("{} was exported without an Id column", object.name))
        })?;

    let mut columns = Vec::new();
    let mut drops = Vec::new();
    let mut seen = HashSet::new();
    for (index, name) in object.fields.iter().enumerate() {
        if name == ID_FIELD || !seen.insert(name.as_str()) {
            continue;
        }
        let field = match describe.field(name) {
            Some(f) if f.createable => f,
            found => {
                drops.push(SchemaDrop {
                    object: object.name.clone(),
                    field: name.clone(),
                    reason: match found {
                        Some(_) => DropReason::NotCreateable,
                        None => DropReason::Absent,
                    },
                });
                continue;
            }
        };
        let (in_set_targets, outside): (Vec<String>, Vec<String>) = field
            .reference_to
            .iter()
            .cloned()
            .partition(|t| in_set.contains(t));
        columns.push(Column {
            index,
            field: field.clone(),
            in_set: in_set_targets,
            references_outside: !outside.is_empty(),
        });
    }

    let plan = ObjectPlan {
        name: object.name.clone(),
        file: object.file.clone(),
        header: object.fields.clone(),
        id_index,
        record_count: object.record_count,
        columns,
    };
    Ok((plan, drops))
}

/// Target record for one data row. Returns the record and the number of
/// references omitted because their record never imported.
fn build_record(
    plan: &ObjectPlan,
    row: &csv::StringRecord,
    source_id: &str,
    resolution: &Resolution,
    checkpoint: &Checkpoint,
    patches: &mut Vec<PendingPatch>,
) -> (Record, u64) {
    let mut record = Record::new();
    let mut unresolved = 0;

    for column in &plan.columns {
        let text = row.get(column.index).unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        if !column.is_reference() {
            record.insert(column.field.name.clone(), coerce(text, column.field.field_type));
            continue;
        }

        // A value already created in the target is written directly, whichever
        // of a polymorphic field's targets it belongs to.
        if let Some(target) = checkpoint.find_target_id(&column.in_set, text) {
            record.insert(column.field.name.clone(), Value::String(target.to_string()));
            continue;
        }

        let pending = column.in_set.iter().any(|target| {
            resolution.is_deferred(&plan.name, target) || !checkpoint.is_completed(target)
        });
        if pending {
            record.insert(column.field.name.clone(), Value::Null);
            patches.push(PendingPatch {
                object: plan.name.clone(),
                source_id: source_id.to_string(),
                field: column.field.name.clone(),
                referenced_id: text.to_string(),
            });
        } else if column.references_outside {
            record.insert(column.field.name.clone(), Value::String(text.to_string()));
        } else {
            unresolved += 1;
        }
    }
    (record, unresolved)
}

/// Typed JSON value for a data file cell; anything unparsable stays text.
fn coerce(text: &str, field_type: FieldType) -> Value {
    match field_type {
        FieldType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        FieldType::Int => match text.parse::<i64>() {
            Ok(n) => Value::from(n),
            Err(_) => float(text),
        },
        t if t.is_numeric() => float(text),
        _ => Value::String(text.to_string()),
    }
}

fn float(text: &str) -> Value {
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(text.to_string()))
}

//! Operation orchestration.
//!
//! [`MigrationEngine`] owns one session and one describe cache per
//! environment and runs backups against the source and restores against the
//! target as background tasks. Only one operation runs at a time.

use crate::backup::{BackupEngine, BackupRequest, BackupSummary};
use crate::config::Config;
use crate::events::{EngineEvent, EventBus};
use crate::remote::{RemoteApi, RestApi};
use crate::restore::checkpoint::CheckpointStore;
use crate::restore::{RestoreEngine, RestorePlan, RestoreRequest, RestoreSummary};
use crate::schema::{CacheStats, MetadataCache};
use crate::session::{CredentialSource, EnvCredentials, SessionManager};
use crate::utils::errors::{Aborted, EngineError, Result};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a finished operation: the summary, or the summary of what
/// completed before it stopped.
pub type Outcome<S> = std::result::Result<S, Aborted<S>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Restore,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup => write!(f, "backup"),
            JobKind::Restore => write!(f, "restore"),
        }
    }
}

/// Describes the operation holding the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub kind: JobKind,
    pub label: String,
}

/// Single-slot tracker for the running operation.
#[derive(Clone, Default)]
pub struct JobTracker {
    active: Arc<Mutex<Option<ActiveJob>>>,
}

/// Holds the tracker slot; dropping it frees the slot, including when the
/// owning task panics or is aborted.
pub struct JobSlot {
    tracker: JobTracker,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or fail with `Busy` naming the running operation.
    pub fn acquire(&self, kind: JobKind, label: impl Into<String>) -> Result<JobSlot> {
        let mut active = self.lock();
        if let Some(job) = active.as_ref() {
            return Err(EngineError::Busy(format!("{} {}", job.kind, job.label)));
        }
        *active = Some(ActiveJob {
            kind,
            label: label.into(),
        });
        Ok(JobSlot {
            tracker: self.clone(),
        })
    }

    pub fn active(&self) -> Option<ActiveJob> {
        self.lock().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.tracker.lock().take();
    }
}

/// A running operation.
pub struct JobHandle<S> {
    cancel: CancellationToken,
    join: JoinHandle<Outcome<S>>,
}

impl<S> JobHandle<S> {
    /// Ask the operation to stop at its next batch boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the task immediately, without waiting for a batch boundary.
    pub fn abort(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the operation. Fails only if the task itself did not finish.
    pub async fn join(self) -> Result<Outcome<S>> {
        self.join.await.map_err(|e| EngineError::Task(e.to_string()))
    }
}

/// One platform environment: the remote API behind a session and a cache.
pub struct Connection {
    pub api: Arc<dyn RemoteApi>,
    pub credentials: Arc<dyn CredentialSource>,
}

struct Environment {
    session: Arc<SessionManager>,
    cache: Arc<MetadataCache>,
}

impl Environment {
    fn new(connection: Connection, config: &Config) -> Self {
        let session = Arc::new(SessionManager::new(
            connection.api,
            connection.credentials,
            config.session.clone(),
        ));
        let cache = Arc::new(MetadataCache::new(Arc::clone(&session), config.cache.ttl()));
        Self { session, cache }
    }
}

pub struct MigrationEngine {
    config: Config,
    source: Environment,
    target: Environment,
    events: EventBus,
    jobs: JobTracker,
}

impl MigrationEngine {
    pub fn new(config: Config, source: Connection, target: Connection) -> Self {
        Self {
            source: Environment::new(source, &config),
            target: Environment::new(target, &config),
            config,
            events: EventBus::new(),
            jobs: JobTracker::new(),
        }
    }

    /// Engine talking to live instances, with credentials from
    /// `REWIND_SOURCE_*` and `REWIND_TARGET_*`.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let source = Connection {
            api: Arc::new(RestApi::new(&config.source)?),
            credentials: Arc::new(EnvCredentials::new("source")),
        };
        let target = Connection {
            api: Arc::new(RestApi::new(&config.target)?),
            credentials: Arc::new(EnvCredentials::new("target")),
        };
        Ok(Self::new(config, source, target))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub fn source_cache_stats(&self) -> CacheStats {
        self.source.cache.stats()
    }

    pub fn target_cache_stats(&self) -> CacheStats {
        self.target.cache.stats()
    }

    /// Start exporting from the source environment.
    pub fn start_backup(&self, request: BackupRequest) -> Result<JobHandle<BackupSummary>> {
        let label = request
            .name
            .clone()
            .unwrap_or_else(|| format!("into {}", request.destination.display()));
        let slot = self.jobs.acquire(JobKind::Backup, label)?;
        let engine = BackupEngine::new(
            Arc::clone(&self.source.session),
            Arc::clone(&self.source.cache),
            self.events.clone(),
            self.config.engine.batch_size,
        );
        info!(objects = request.objects.len(), "Backup job accepted");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let _slot = slot;
            engine.run(request, token).await
        });
        Ok(JobHandle { cancel, join })
    }

    /// Start replaying a backup into the target environment.
    pub fn start_restore(&self, request: RestoreRequest) -> Result<JobHandle<RestoreSummary>> {
        let label = request.backup_dir.display().to_string();
        let slot = self.jobs.acquire(JobKind::Restore, label)?;
        let engine = self.restore_engine();
        info!(backup_dir = %request.backup_dir.display(), resume = request.resume, "Restore job accepted");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            let _slot = slot;
            engine.run(request, token).await
        });
        Ok(JobHandle { cancel, join })
    }

    /// Processing order and schema drops a restore of `backup_dir` would use.
    pub async fn plan_restore(&self, backup_dir: &Path) -> Result<RestorePlan> {
        let plan = self.restore_engine().plan(backup_dir).await?;
        if !plan.deferred.is_empty() {
            warn!(deferred = ?plan.deferred, "Restore needs a second pass for cyclic references");
        }
        Ok(plan)
    }

    fn restore_engine(&self) -> RestoreEngine {
        RestoreEngine::new(
            Arc::clone(&self.target.session),
            Arc::clone(&self.target.cache),
            self.events.clone(),
            CheckpointStore::new(self.config.storage.checkpoint_dir()),
            self.config.engine.batch_size,
        )
    }
}

//! Progress and lifecycle events.
//!
//! The engine only ever sends; whoever renders progress (the CLI, a UI, a
//! test) subscribes to the bus. Events are serde-tagged so they can be
//! forwarded as JSON unchanged.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Backup,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "backup:started")]
    BackupStarted { backup_id: String, objects: Vec<String> },

    #[serde(rename = "restore:started")]
    RestoreStarted {
        backup_id: String,
        order: Vec<String>,
        resumed: bool,
    },

    /// Emitted once per page (backup) or batch (restore)
    #[serde(rename = "progress")]
    Progress(ProgressPayload),

    #[serde(rename = "object:completed")]
    ObjectCompleted {
        phase: Phase,
        object_name: String,
        succeeded: u64,
        failed: u64,
    },

    #[serde(rename = "schema:field_dropped")]
    FieldDropped {
        object_name: String,
        field: String,
        reason: String,
    },

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        backup_id: String,
        total_records: u64,
        duration_secs: u64,
    },

    #[serde(rename = "restore:completed")]
    RestoreCompleted {
        backup_id: String,
        imported: u64,
        failed: u64,
        duration_secs: u64,
    },

    #[serde(rename = "operation:failed")]
    OperationFailed { phase: Phase, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub phase: Phase,
    pub object_name: String,
    pub records_done: u64,
    /// `None` when the platform did not report a total
    pub records_total: Option<u64>,
}

/// Fan-out channel for [`EngineEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Send to every subscriber. Having none is not an error.
    pub fn broadcast(&self, event: EngineEvent) {
        match self.tx.send(event) {
            Ok(count) => trace!("Event delivered to {} subscriber(s)", count),
            Err(broadcast::error::SendError(event)) => {
                trace!("No subscribers for event: {:?}", event)
            }
        }
    }

    pub fn progress(&self, phase: Phase, object_name: &str, records_done: u64, records_total: Option<u64>) {
        self.broadcast(EngineEvent::Progress(ProgressPayload {
            phase,
            object_name: object_name.to_string(),
            records_done,
            records_total,
        }));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain everything currently queued on `rx`.
#[cfg(test)]
pub(crate) fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

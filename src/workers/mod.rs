//! The three sync workers (Polling, Negentropy, Upload) and the shared
//! collaborators they're all written against.

pub mod negentropy_worker;
pub mod polling;
pub mod upload;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::event::{EventStore, EventValidator};
use crate::relay::Manager;
use crate::sync_state::SyncStateStore;

/// Collaborators every worker needs. Cloning is cheap (everything inside is
/// already behind an `Arc`).
///
/// `sync_permits`/`upload_permits`/`event_permits` bound how many jobs each
/// queue runs at once — the orchestrator acquires one before spawning a job
/// onto that queue and the permit is dropped when the spawned task ends, so
/// a queue never runs more than `max_concurrent_connections` jobs
/// concurrently regardless of how many relays are configured.
#[derive(Clone)]
pub struct WorkerContext {
    pub event_store: Arc<dyn EventStore>,
    pub validator: Arc<dyn EventValidator>,
    pub sync_states: Arc<dyn SyncStateStore>,
    pub manager: Arc<Manager>,
    pub config: Arc<Config>,
    pub sync_permits: Arc<Semaphore>,
    pub upload_permits: Arc<Semaphore>,
    pub event_permits: Arc<Semaphore>,
}

impl WorkerContext {
    pub fn new(
        event_store: Arc<dyn EventStore>,
        validator: Arc<dyn EventValidator>,
        sync_states: Arc<dyn SyncStateStore>,
        manager: Arc<Manager>,
        config: Arc<Config>,
    ) -> Self {
        let permits = config.max_concurrent_connections.max(1);
        WorkerContext {
            event_store,
            validator,
            sync_states,
            manager,
            sync_permits: Arc::new(Semaphore::new(permits)),
            upload_permits: Arc::new(Semaphore::new(permits)),
            event_permits: Arc::new(Semaphore::new(permits)),
            config,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("connection error: {0}")]
    Connection(#[from] crate::relay::ConnectionError),
    #[error("event store error: {0}")]
    Storage(#[from] crate::event::StorageError),
    #[error("sync state error: {0}")]
    SyncState(#[from] crate::sync_state::SyncStateError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("negentropy failure: {0}")]
    Negentropy(#[from] crate::negentropy::NegentropyError),
    #[error("upload failed: {0}")]
    Upload(String),
}

fn random_sub_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

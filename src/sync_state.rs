//! Durable per-relay sync cursor, backfill window, and status FSM. One row
//! per `(relay_url, filter_hash)`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event::Filter;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after 1970")
        .as_secs() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Syncing,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Down,
    Up,
    Both,
}

impl From<crate::config::Direction> for Direction {
    fn from(direction: crate::config::Direction) -> Self {
        match direction {
            crate::config::Direction::Down => Direction::Down,
            crate::config::Direction::Up => Direction::Up,
            crate::config::Direction::Both => Direction::Both,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncState {
    pub relay_url: String,
    pub filter_hash: String,
    pub direction: Direction,
    pub status: Status,
    pub last_download_event_id: Option<String>,
    pub last_download_timestamp: Option<i64>,
    pub last_upload_event_id: Option<String>,
    pub last_upload_timestamp: Option<i64>,
    pub events_downloaded: u64,
    pub events_uploaded: u64,
    pub backfill_target: Option<i64>,
    pub backfill_until: Option<i64>,
    initial_backfill_until: Option<i64>,
    pub error_message: Option<String>,
    pub last_synced_at: Option<i64>,
    pub updated_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("cannot {action} while status is {status:?}")]
    InvalidState { action: &'static str, status: Status },
}

impl SyncState {
    pub fn new(relay_url: String, direction: Direction, filter_hash: String) -> Self {
        let now = now_unix();
        SyncState {
            relay_url,
            filter_hash,
            direction,
            status: Status::Idle,
            last_download_event_id: None,
            last_download_timestamp: None,
            last_upload_event_id: None,
            last_upload_timestamp: None,
            events_downloaded: 0,
            events_uploaded: 0,
            backfill_target: None,
            backfill_until: None,
            initial_backfill_until: None,
            error_message: None,
            last_synced_at: None,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_unix();
    }

    /// `base` with `since` set from the resume cursor, falling back to
    /// `fallback_since` when there's no prior progress. `overlap_seconds`
    /// absorbs events that arrived at the peer between the last checkpoint
    /// and when we actually stopped polling.
    pub fn resume_filter(&self, base: Filter, fallback_since: i64, overlap_seconds: i64) -> Filter {
        let since = match self.last_download_timestamp {
            Some(ts) => ts - overlap_seconds,
            None => fallback_since,
        };
        Filter {
            since: Some(since),
            ..base
        }
    }

    pub fn initialize_backfill(&mut self, target: i64) {
        if self.backfill_target.is_none() {
            let now = now_unix();
            self.backfill_target = Some(target);
            self.backfill_until = Some(now);
            self.initial_backfill_until = Some(now);
            self.touch();
        }
    }

    /// `(since, until)` for the next chunk, or `None` once
    /// `backfill_until <= backfill_target`.
    pub fn next_backfill_chunk(&self, chunk_hours: i64) -> Option<(i64, i64)> {
        let until = self.backfill_until?;
        let target = self.backfill_target?;
        if until <= target {
            return None;
        }
        let since = (until - chunk_hours * 3600).max(target);
        Some((since, until))
    }

    pub fn mark_backfill_chunk_completed(&mut self, chunk_start: i64) {
        self.backfill_until = Some(chunk_start);
        self.touch();
    }

    pub fn backfill_complete(&self) -> bool {
        match (self.backfill_until, self.backfill_target) {
            (Some(until), Some(target)) => until <= target,
            _ => false,
        }
    }

    pub fn backfill_progress_percent(&self) -> f64 {
        match (self.backfill_target, self.initial_backfill_until, self.backfill_until) {
            (Some(target), Some(initial), Some(current)) if initial > target => {
                let total = (initial - target) as f64;
                let done = (initial - current) as f64;
                (done / total * 100.0).clamp(0.0, 100.0)
            }
            (Some(_), Some(_), Some(_)) => 100.0,
            _ => 0.0,
        }
    }

    pub fn mark_download_progress(&mut self, event_id: String, timestamp: i64, count: u64) {
        self.last_download_event_id = Some(event_id);
        self.last_download_timestamp = Some(timestamp);
        self.events_downloaded += count;
        self.touch();
    }

    pub fn mark_upload_progress(&mut self, event_id: String, timestamp: i64, count: u64) {
        self.last_upload_event_id = Some(event_id);
        self.last_upload_timestamp = Some(timestamp);
        self.events_uploaded += count;
        self.touch();
    }

    pub fn stale(&self, threshold_seconds: i64) -> bool {
        self.status == Status::Syncing && self.updated_at + threshold_seconds < now_unix()
    }

    pub fn mark_syncing(&mut self) -> Result<(), TransitionError> {
        match self.status {
            Status::Idle | Status::Error => {
                self.status = Status::Syncing;
                self.error_message = None;
                self.touch();
                Ok(())
            }
            status => Err(TransitionError::InvalidState {
                action: "mark_syncing",
                status,
            }),
        }
    }

    pub fn mark_completed(&mut self) -> Result<(), TransitionError> {
        match self.status {
            Status::Syncing => {
                self.status = Status::Completed;
                self.last_synced_at = Some(now_unix());
                self.touch();
                Ok(())
            }
            status => Err(TransitionError::InvalidState {
                action: "mark_completed",
                status,
            }),
        }
    }

    pub fn reset_to_idle(&mut self) -> Result<(), TransitionError> {
        match self.status {
            Status::Syncing | Status::Error | Status::Completed => {
                self.status = Status::Idle;
                self.touch();
                Ok(())
            }
            status => Err(TransitionError::InvalidState {
                action: "reset_to_idle",
                status,
            }),
        }
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = Status::Error;
        self.error_message = Some(message.into());
        self.touch();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncStateError {
    #[error("sync state store io error: {0}")]
    Io(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Durable collaborator this crate is written against. `for_sync` must
/// survive a lost create-race by retrying a read on unique-constraint
/// violation — the in-memory reference implementation sidesteps the race
/// entirely by holding a single write lock across find-or-create.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn for_sync(
        &self,
        relay_url: &str,
        direction: Direction,
        filter_hash: &str,
    ) -> Result<SyncState, SyncStateError>;

    async fn save(&self, state: &SyncState) -> Result<(), SyncStateError>;

    async fn all(&self) -> Result<Vec<SyncState>, SyncStateError>;
}

/// Reference `SyncStateStore` used in tests and as the default for
/// single-process deployments.
#[derive(Default)]
pub struct InMemorySyncStateStore {
    rows: RwLock<HashMap<(String, String), SyncState>>,
}

impl InMemorySyncStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn for_sync(
        &self,
        relay_url: &str,
        direction: Direction,
        filter_hash: &str,
    ) -> Result<SyncState, SyncStateError> {
        let mut rows = self.rows.write().await;
        let key = (relay_url.to_string(), filter_hash.to_string());
        let state = rows.entry(key).or_insert_with(|| {
            SyncState::new(relay_url.to_string(), direction, filter_hash.to_string())
        });
        Ok(state.clone())
    }

    async fn save(&self, state: &SyncState) -> Result<(), SyncStateError> {
        let mut rows = self.rows.write().await;
        rows.insert(
            (state.relay_url.clone(), state.filter_hash.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn all(&self) -> Result<Vec<SyncState>, SyncStateError> {
        let rows = self.rows.read().await;
        Ok(rows.values().cloned().collect())
    }
}

/// Ensures a state's status never gets stuck at `syncing` if a worker
/// returns early via `?` or panics mid-body. Holds the only `&mut
/// SyncState` for its lifetime — every mutation a worker makes while a sync
/// is in flight goes through [`SyncingGuard::state_mut`] rather than a
/// separately threaded `&mut SyncState`, so there's never a second path
/// that could leave the guard unaware of a change.
///
/// Callers call [`SyncingGuard::disarm`] once they've performed a terminal
/// transition (`mark_completed`/`mark_error`/`reset_to_idle`) themselves;
/// an undisarmed guard resets to `idle` on drop.
pub struct SyncingGuard<'a> {
    state: &'a mut SyncState,
    disarmed: bool,
}

impl<'a> SyncingGuard<'a> {
    pub fn new(state: &'a mut SyncState) -> Self {
        SyncingGuard {
            state,
            disarmed: false,
        }
    }

    pub fn state(&self) -> &SyncState {
        self.state
    }

    pub fn state_mut(&mut self) -> &mut SyncState {
        self.state
    }

    pub fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl<'a> Drop for SyncingGuard<'a> {
    fn drop(&mut self) {
        if !self.disarmed && self.state.status == Status::Syncing {
            self.state.status = Status::Idle;
            self.state.touch();
        }
    }
}

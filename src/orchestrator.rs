//! Fans a tick (cron, manual trigger, or relay-specific nudge) out into
//! worker dispatches, and recovers sync rows a crashed or hung worker left
//! stuck mid-flight.

use crate::sync_state::{now_unix, Status};
use crate::workers::negentropy_worker::{self, NegentropyJob};
use crate::workers::polling::{self, PollingJob, PollingMode};
use crate::workers::upload::{self, UploadJob};
use crate::workers::{WorkerContext, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Realtime,
    Backfill,
    Upload,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub dispatched: usize,
    pub mode: SyncMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub recovered_stale: usize,
    pub retried_errors: usize,
}

/// Runs every eligible relay for `mode` (or, if `relay_url` is given, just
/// that one) through the matching worker(s), fanned out across the
/// `sync`/`uploads` queues' bounded worker pools. Individual worker failures
/// are logged and don't abort the sweep — the next tick retries.
///
/// Jobs are spawned as soon as a queue permit is free, so up to
/// `max_concurrent_connections` relays sync in parallel per queue; this
/// call itself returns only once every spawned job has finished, so callers
/// (e.g. a fixed-tick driver) see one dispatch sweep as a unit of work.
pub async fn dispatch_sync_jobs(
    ctx: &WorkerContext,
    mode: SyncMode,
    relay_url: Option<&str>,
) -> DispatchOutcome {
    let mut dispatched = 0;
    let mut handles = Vec::new();

    if matches!(mode, SyncMode::Realtime | SyncMode::Full) {
        for relay in ctx.config.download_capable() {
            if relay_matches(relay_url, &relay.url) && !relay.negentropy {
                dispatched += 1;
                let permit = ctx
                    .sync_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("sync queue semaphore is never closed");
                let job = PollingJob {
                    relay_url: relay.url.clone(),
                    filter: base_filter(ctx),
                    direction: relay.direction.into(),
                    mode: PollingMode::Realtime,
                    backfill_target: None,
                    chunk_hours: None,
                    continuation: false,
                };
                let ctx = ctx.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let relay_url = job.relay_url.clone();
                    run_and_log(&relay_url, polling::run(&ctx, job).await);
                }));
            }
        }
    }

    if matches!(mode, SyncMode::Backfill | SyncMode::Full) {
        let target = now_unix() - ctx.config.backfill_since_hours * 3600;
        for relay in ctx.config.backfill_capable() {
            if !relay_matches(relay_url, &relay.url) {
                continue;
            }
            dispatched += 1;
            let permit = ctx
                .sync_permits
                .clone()
                .acquire_owned()
                .await
                .expect("sync queue semaphore is never closed");
            let ctx = ctx.clone();
            if relay.negentropy {
                let job = NegentropyJob {
                    relay_url: relay.url.clone(),
                    filter: base_filter(&ctx),
                    direction: relay.direction.into(),
                    backfill_target: Some(target),
                    chunk_hours: None,
                    continuation: false,
                };
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let relay_url = job.relay_url.clone();
                    run_and_log(&relay_url, negentropy_worker::run(&ctx, job).await);
                }));
            } else {
                let job = PollingJob {
                    relay_url: relay.url.clone(),
                    filter: base_filter(&ctx),
                    direction: relay.direction.into(),
                    mode: PollingMode::Backfill,
                    backfill_target: Some(target),
                    chunk_hours: None,
                    continuation: false,
                };
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    let relay_url = job.relay_url.clone();
                    run_and_log(&relay_url, polling::run(&ctx, job).await);
                }));
            }
        }
    }

    if matches!(mode, SyncMode::Upload | SyncMode::Full) {
        for relay in ctx.config.upload_capable() {
            if !relay_matches(relay_url, &relay.url) {
                continue;
            }
            dispatched += 1;
            let permit = ctx
                .upload_permits
                .clone()
                .acquire_owned()
                .await
                .expect("uploads queue semaphore is never closed");
            let job = UploadJob {
                relay_url: relay.url.clone(),
                filter: base_filter(ctx),
            };
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let relay_url = job.relay_url.clone();
                run_and_log(&relay_url, upload::run(&ctx, job).await);
            }));
        }
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::warn!(error = %err, "sync worker task panicked");
        }
    }

    DispatchOutcome { dispatched, mode }
}

/// Resets sync rows stuck `syncing` past the staleness threshold and
/// `error` rows whose retry cooldown has elapsed, back to `idle` so the
/// next dispatch sweep picks them up again.
pub async fn recover_stale(ctx: &WorkerContext) -> Result<RecoveryOutcome, WorkerError> {
    let mut recovered_stale = 0;
    let mut retried_errors = 0;
    let now = now_unix();
    let stale_seconds = ctx.config.stale_threshold_minutes * 60;
    let retry_seconds = ctx.config.error_retry_after_minutes * 60;

    for mut state in ctx.sync_states.all().await? {
        match state.status {
            Status::Syncing if state.stale(stale_seconds) => {
                state.reset_to_idle()?;
                ctx.sync_states.save(&state).await?;
                recovered_stale += 1;
            }
            Status::Error if state.updated_at + retry_seconds < now => {
                state.reset_to_idle()?;
                ctx.sync_states.save(&state).await?;
                retried_errors += 1;
            }
            _ => {}
        }
    }

    Ok(RecoveryOutcome {
        recovered_stale,
        retried_errors,
    })
}

fn relay_matches(wanted: Option<&str>, candidate: &str) -> bool {
    match wanted {
        Some(url) => url == candidate,
        None => true,
    }
}

fn run_and_log(relay_url: &str, result: Result<(), WorkerError>) {
    if let Err(err) = result {
        tracing::warn!(relay = %relay_url, error = %err, "sync worker failed");
    }
}

fn base_filter(ctx: &WorkerContext) -> crate::event::Filter {
    crate::event::Filter {
        kinds: if ctx.config.event_kinds.is_empty() {
            None
        } else {
            Some(ctx.config.event_kinds.clone())
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_matches_is_permissive_when_unscoped() {
        assert!(relay_matches(None, "wss://relay.example.com"));
        assert!(relay_matches(Some("wss://relay.example.com"), "wss://relay.example.com"));
        assert!(!relay_matches(Some("wss://other.example.com"), "wss://relay.example.com"));
    }
}

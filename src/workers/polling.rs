//! REQ/EOSE-driven catch-up: realtime incremental polling, and chunked
//! historical backfill over the same subscription mechanics.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::{random_sub_id, WorkerContext, WorkerError};
use crate::event::Filter;
use crate::relay::ClientMessage;
use crate::sync_state::{Direction, SyncingGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    Realtime,
    Backfill,
}

pub struct PollingJob {
    pub relay_url: String,
    pub filter: Filter,
    pub direction: Direction,
    pub mode: PollingMode,
    pub backfill_target: Option<i64>,
    pub chunk_hours: Option<i64>,
    pub continuation: bool,
}

pub async fn run(ctx: &WorkerContext, job: PollingJob) -> Result<(), WorkerError> {
    let filter_hash = job.filter.hash("download");
    let mut state = ctx
        .sync_states
        .for_sync(&job.relay_url, job.direction.clone(), &filter_hash)
        .await?;

    if state.stale(ctx.config.stale_threshold_minutes * 60) {
        state.reset_to_idle()?;
        ctx.sync_states.save(&state).await?;
    }

    if state.status == crate::sync_state::Status::Syncing && !job.continuation {
        return Ok(());
    }

    match job.mode {
        PollingMode::Realtime => run_realtime(ctx, &mut state, job.filter).await,
        PollingMode::Backfill => {
            run_backfill(ctx, &mut state, job).await
        }
    }
}

async fn run_realtime(
    ctx: &WorkerContext,
    state: &mut crate::sync_state::SyncState,
    base_filter: Filter,
) -> Result<(), WorkerError> {
    state.mark_syncing()?;
    ctx.sync_states.save(state).await?;
    let mut guard = SyncingGuard::new(state);

    let filter = guard.state_mut().resume_filter(
        base_filter,
        crate::sync_state::now_unix() - ctx.config.polling_window_minutes * 60,
        ctx.config.resume_overlap_seconds,
    );
    let relay_url = guard.state().relay_url.clone();

    let result = drive_subscription(ctx, &relay_url, filter, &mut guard).await;

    match result {
        Ok(()) => guard.state_mut().reset_to_idle()?,
        Err(err) => guard.state_mut().mark_error(err.to_string()),
    }
    guard.disarm();
    ctx.sync_states.save(guard.state()).await?;
    Ok(())
}

async fn run_backfill(
    ctx: &WorkerContext,
    state: &mut crate::sync_state::SyncState,
    job: PollingJob,
) -> Result<(), WorkerError> {
    let target = job.backfill_target.unwrap_or(0);
    state.initialize_backfill(target);
    if state.backfill_complete() {
        state.mark_syncing().ok();
        state.mark_completed()?;
        ctx.sync_states.save(state).await?;
        return Ok(());
    }
    state.mark_syncing()?;
    ctx.sync_states.save(state).await?;
    let mut guard = SyncingGuard::new(state);

    let chunk_hours = job.chunk_hours.unwrap_or(ctx.config.polling_chunk_hours);
    let outcome = async {
        while let Some((since, until)) = guard.state_mut().next_backfill_chunk(chunk_hours) {
            let chunk_filter = Filter {
                since: Some(since),
                until: Some(until),
                ..job.filter.clone()
            };
            drive_subscription(ctx, &job.relay_url, chunk_filter, &mut guard).await?;
            guard.state_mut().mark_backfill_chunk_completed(since);
            ctx.sync_states.save(guard.state()).await?;
        }
        Ok::<(), WorkerError>(())
    }
    .await;

    match outcome {
        Ok(()) => guard.state_mut().mark_completed()?,
        Err(err) => guard.state_mut().mark_error(err.to_string()),
    }
    guard.disarm();
    ctx.sync_states.save(guard.state()).await?;
    Ok(())
}

/// Opens one `REQ`, streams `EVENT`s into the store until `EOSE` or
/// timeout, then tears the subscription down. Shared by both the realtime
/// and per-chunk backfill paths.
async fn drive_subscription(
    ctx: &WorkerContext,
    relay_url: &str,
    filter: Filter,
    guard: &mut SyncingGuard<'_>,
) -> Result<(), WorkerError> {
    let sub_id = random_sub_id("poll");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (eose_tx, mut eose_rx) = oneshot::channel();

    let handlers = ctx.manager.handlers().clone();
    handlers.register_event(sub_id.clone(), event_tx).await;
    handlers.register_eose(sub_id.clone(), eose_tx).await;

    ctx.manager
        .send_to(
            relay_url,
            &ClientMessage::Req {
                sub_id: sub_id.clone(),
                filters: vec![filter],
            },
        )
        .await?;

    let mut since_checkpoint = 0u64;
    let wait = timeout(
        Duration::from_secs(ctx.config.polling_timeout_seconds),
        async {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut eose_rx => break,
                    maybe_event = event_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                if let Err(err) = ctx.validator.validate(&event, crate::sync_state::now_unix()) {
                                    tracing::debug!(error = %err, "dropping invalid event");
                                    continue;
                                }
                                let event_id = event.event_id.clone();
                                let created_at = event.created_at;
                                match ctx.event_store.upsert(&event).await {
                                    Ok(_) => {}
                                    Err(crate::event::StorageError::Duplicate) => {}
                                    Err(other) => return Err(WorkerError::Storage(other)),
                                }
                                guard.state_mut().mark_download_progress(event_id, created_at, 1);
                                since_checkpoint += 1;
                                if since_checkpoint >= ctx.config.checkpoint_interval {
                                    ctx.sync_states.save(guard.state()).await?;
                                    since_checkpoint = 0;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok(())
        },
    )
    .await;

    ctx.manager
        .send_to(relay_url, &ClientMessage::Close { sub_id: sub_id.clone() })
        .await
        .ok();
    handlers.unregister_event(&sub_id).await;
    handlers.unregister_eose(&sub_id).await;

    match wait {
        Ok(inner) => inner,
        Err(_) => Err(WorkerError::Timeout("EOSE")),
    }
}

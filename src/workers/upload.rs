//! Publishes local events a relay is missing. Driven either by a cursor
//! scan over a configured upload-direction relay ([`run`]) or directly with
//! a concrete id set, e.g. the `have_ids` a negentropy round surfaced
//! ([`publish_ids`]).

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

use super::{random_sub_id, WorkerContext, WorkerError};
use crate::event::{Event, Filter};
use crate::relay::{ClientMessage, RelayMessage};
use crate::sync_state::{Direction, SyncingGuard};

pub struct UploadJob {
    pub relay_url: String,
    pub filter: Filter,
}

pub async fn run(ctx: &WorkerContext, job: UploadJob) -> Result<(), WorkerError> {
    let filter_hash = Filter::UPLOAD_SENTINEL.to_string() + &job.filter.hash("upload");
    let mut state = ctx
        .sync_states
        .for_sync(&job.relay_url, Direction::Up, &filter_hash)
        .await?;

    if state.stale(ctx.config.stale_threshold_minutes * 60) {
        state.reset_to_idle()?;
        ctx.sync_states.save(&state).await?;
    }
    if state.status == crate::sync_state::Status::Syncing {
        return Ok(());
    }
    state.mark_syncing()?;
    ctx.sync_states.save(&state).await?;
    let mut guard = SyncingGuard::new(&mut state);

    let cursor_filter = Filter {
        since: guard.state().last_upload_timestamp.map(|ts| ts + 1),
        ..job.filter.clone()
    };
    let rows = ctx.event_store.scan(&cursor_filter).await?;
    let batch: Vec<_> = rows
        .into_iter()
        .take(ctx.config.upload_batch_size)
        .collect();

    let outcome = publish_batch(ctx, &job.relay_url, &batch, &mut guard).await;

    match outcome {
        Ok(()) => guard.state_mut().mark_completed()?,
        Err(err) => guard.state_mut().mark_error(err.to_string()),
    }
    guard.disarm();
    ctx.sync_states.save(guard.state()).await?;
    Ok(())
}

/// Publishes a known set of ids (e.g. from a negentropy reconciliation's
/// `have_ids`) without touching any upload cursor.
pub async fn publish_ids(
    ctx: &WorkerContext,
    relay_url: &str,
    ids: &[[u8; 32]],
) -> Result<(), WorkerError> {
    for id in ids {
        let event_id = hex::encode(id);
        if let Some(event) = ctx.event_store.load(&event_id).await? {
            publish_one(ctx, relay_url, &event).await?;
            tokio::time::sleep(Duration::from_millis(ctx.config.upload_delay_ms)).await;
        }
    }
    Ok(())
}

async fn publish_batch(
    ctx: &WorkerContext,
    relay_url: &str,
    rows: &[(i64, [u8; 32])],
    guard: &mut SyncingGuard<'_>,
) -> Result<(), WorkerError> {
    let mut failures = Vec::new();
    for (created_at, id) in rows {
        let event_id = hex::encode(id);
        let Some(event) = ctx.event_store.load(&event_id).await? else {
            continue;
        };
        match publish_one(ctx, relay_url, &event).await {
            Ok(()) => {
                guard.state_mut().mark_upload_progress(event_id, *created_at, 1);
            }
            Err(err) => {
                failures.push(format!("{event_id}: {err}"));
            }
        }
        tokio::time::sleep(Duration::from_millis(ctx.config.upload_delay_ms)).await;
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::Upload(failures.join("; ")))
    }
}

/// Publishes one event and waits for its `OK`, retrying once (after 5x the
/// configured delay) on a `rate-limited:` response.
async fn publish_one(ctx: &WorkerContext, relay_url: &str, event: &Event) -> Result<(), WorkerError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let (ok_tx, ok_rx) = oneshot::channel();
        let handlers = ctx.manager.handlers().clone();
        handlers.register_ok(event.event_id.clone(), ok_tx).await;

        ctx.manager
            .send_to(relay_url, &ClientMessage::Event(event.clone()))
            .await?;

        let result = timeout(Duration::from_secs(ctx.config.polling_timeout_seconds), ok_rx).await;
        let (success, message) = match result {
            Ok(Ok(pair)) => pair,
            _ => {
                handlers.unregister_ok(&event.event_id).await;
                return Err(WorkerError::Timeout("OK"));
            }
        };

        if success {
            return Ok(());
        }

        let reason = RelayMessage::ok_reason(&message);
        if reason == "rate_limited" && attempts == 1 {
            tokio::time::sleep(Duration::from_millis(ctx.config.upload_delay_ms * 5)).await;
            continue;
        }
        if reason == "duplicate" {
            return Ok(());
        }
        return Err(WorkerError::Upload(format!("relay rejected event: {message}")));
    }
}

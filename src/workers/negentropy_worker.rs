//! NIP-77 chunked set reconciliation. Reuses the same backfill-chunk
//! tracking as [`super::polling`] so a relay can be swapped between the two
//! download strategies without touching `SyncState`'s on-disk shape.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::polling::{PollingJob, PollingMode};
use super::{polling, random_sub_id, WorkerContext, WorkerError};
use crate::event::Filter;
use crate::negentropy::{ClientReconciler, Item, Message, NegentropyError, Storage};
use crate::relay::{ClientMessage, NegInbound};
use crate::sync_state::{Direction, SyncingGuard};

pub struct NegentropyJob {
    pub relay_url: String,
    pub filter: Filter,
    pub direction: Direction,
    pub backfill_target: Option<i64>,
    pub chunk_hours: Option<i64>,
    pub continuation: bool,
}

pub async fn run(ctx: &WorkerContext, job: NegentropyJob) -> Result<(), WorkerError> {
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

    let target = job.backfill_target.unwrap_or(0);
    state.initialize_backfill(target);
    if state.backfill_complete() {
        state.mark_syncing().ok();
        state.mark_completed()?;
        ctx.sync_states.save(&state).await?;
        return Ok(());
    }
    state.mark_syncing()?;
    ctx.sync_states.save(&state).await?;
    let mut guard = SyncingGuard::new(&mut state);

    let chunk_hours = job.chunk_hours.unwrap_or(ctx.config.negentropy_chunk_hours);
    let Some((since, until)) = guard.state_mut().next_backfill_chunk(chunk_hours) else {
        guard.state_mut().mark_completed()?;
        guard.disarm();
        ctx.sync_states.save(guard.state()).await?;
        return Ok(());
    };
    let chunk_filter = Filter {
        since: Some(since),
        until: Some(until),
        ..job.filter.clone()
    };

    let outcome = reconcile_chunk(ctx, &job.relay_url, &chunk_filter, &job.direction).await;

    match outcome {
        Ok(()) => {
            guard.state_mut().mark_backfill_chunk_completed(since);
            if guard.state().backfill_complete() {
                guard.state_mut().mark_completed()?;
            } else {
                guard.state_mut().reset_to_idle()?;
            }
            guard.disarm();
            ctx.sync_states.save(guard.state()).await?;
            Ok(())
        }
        Err(WorkerError::Negentropy(err)) => {
            tracing::warn!(
                relay = %job.relay_url,
                error = %err,
                "negentropy reconciliation failed, falling back to polling backfill for this chunk"
            );
            guard.state_mut().reset_to_idle()?;
            guard.disarm();
            ctx.sync_states.save(guard.state()).await?;
            polling::run(
                ctx,
                PollingJob {
                    relay_url: job.relay_url,
                    filter: job.filter,
                    direction: job.direction,
                    mode: PollingMode::Backfill,
                    backfill_target: Some(target),
                    chunk_hours: Some(chunk_hours),
                    continuation: true,
                },
            )
            .await
        }
        Err(other) => {
            guard.state_mut().mark_error(other.to_string());
            guard.disarm();
            ctx.sync_states.save(guard.state()).await?;
            Err(other)
        }
    }
}

async fn reconcile_chunk(
    ctx: &WorkerContext,
    relay_url: &str,
    chunk_filter: &Filter,
    direction: &Direction,
) -> Result<(), WorkerError> {
    let rows = ctx.event_store.scan(chunk_filter).await?;
    let storage = Storage::from_items(rows.into_iter().map(|(ts, id)| Item::new(ts as u32, id)));
    let mut reconciler = ClientReconciler::new(&storage, ctx.config.negentropy_frame_size);

    let sub_id = random_sub_id("neg");
    let (neg_tx, mut neg_rx) = mpsc::unbounded_channel();
    let handlers = ctx.manager.handlers().clone();
    handlers.register_neg(sub_id.clone(), neg_tx).await;

    let opening = reconciler.initiate()?;
    let mut have_ids = Vec::new();
    let mut need_ids = Vec::new();

    let result = async {
        ctx.manager
            .send_to(
                relay_url,
                &ClientMessage::NegOpen {
                    sub_id: sub_id.clone(),
                    filter: chunk_filter.clone(),
                    initial_msg_hex: hex::encode(opening.encode()),
                },
            )
            .await?;

        loop {
            let inbound = timeout(
                Duration::from_secs(ctx.config.polling_timeout_seconds),
                neg_rx.recv(),
            )
            .await
            .map_err(|_| WorkerError::Timeout("NEG-MSG"))?
            .ok_or(WorkerError::Timeout("NEG-MSG"))?;

            let incoming = match inbound {
                NegInbound::Msg(bytes) => Message::decode(&bytes)?,
                NegInbound::Err(message) => {
                    return Err(WorkerError::Negentropy(NegentropyError::PeerError(message)));
                }
            };

            let step = reconciler.reconcile(&incoming)?;
            have_ids.extend(step.have_ids);
            need_ids.extend(step.need_ids);

            match step.response {
                Some(next) => {
                    ctx.manager
                        .send_to(
                            relay_url,
                            &ClientMessage::NegMsg {
                                sub_id: sub_id.clone(),
                                msg_hex: hex::encode(next.encode()),
                            },
                        )
                        .await?;
                }
                None => break,
            }
        }
        Ok(())
    }
    .await;

    ctx.manager
        .send_to(relay_url, &ClientMessage::NegClose { sub_id: sub_id.clone() })
        .await
        .ok();
    handlers.unregister_neg(&sub_id).await;
    result?;

    if direction.allows_download() && !need_ids.is_empty() {
        fetch_by_ids(ctx, relay_url, &need_ids).await?;
    }
    if direction.allows_upload() && !have_ids.is_empty() {
        super::upload::publish_ids(ctx, relay_url, &have_ids).await?;
    }
    Ok(())
}

/// One-shot `REQ {"ids": [...]}` / wait-for-EOSE fetch for ids the peer
/// reported we're missing, paged at `config.batch_size`. Doesn't touch
/// `SyncState` — this is bookkept entirely by the chunk that called it.
async fn fetch_by_ids(
    ctx: &WorkerContext,
    relay_url: &str,
    ids: &[[u8; 32]],
) -> Result<(), WorkerError> {
    for batch in ids.chunks(ctx.config.batch_size.max(1)) {
        let sub_id = random_sub_id("negfetch");
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
                    filters: vec![Filter {
                        ids: Some(batch.iter().map(hex::encode).collect()),
                        ..Default::default()
                    }],
                },
            )
            .await?;

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
                                    if ctx.validator.validate(&event, crate::sync_state::now_unix()).is_ok() {
                                        match ctx.event_store.upsert(&event).await {
                                            Ok(_) | Err(crate::event::StorageError::Duplicate) => {}
                                            Err(other) => return Err(WorkerError::Storage(other)),
                                        }
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
            Ok(inner) => inner?,
            Err(_) => return Err(WorkerError::Timeout("EOSE for id fetch")),
        }
    }
    Ok(())
}

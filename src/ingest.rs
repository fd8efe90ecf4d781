//! Single entry point for handing a raw event payload to the store: parse,
//! validate, upsert, and (optionally) re-broadcast to the other configured
//! relays. Subscription-driven workers ([`crate::workers::polling`],
//! [`crate::workers::negentropy_worker`]) inline their own
//! validate-then-upsert step for events already decoded off a `REQ`
//! subscription; this module is the path for events arriving any other
//! way, and the one place broadcast fan-out is decided.

use crate::event::{Event, StorageError, UpsertOutcome, ValidationError};
use crate::relay::ClientMessage;
use crate::workers::WorkerContext;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("malformed event payload: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Skipped { reason: &'static str },
}

/// `event_data` is the raw JSON body of an `EVENT` (or an externally
/// submitted event). `broadcast` should be `false` while backfilling (no
/// point echoing history back out) and `true` for realtime-sourced events
/// the other upload-direction relays haven't seen yet.
pub async fn process_event(
    ctx: &WorkerContext,
    event_data: &str,
    source_relay: Option<&str>,
    broadcast: bool,
) -> Result<IngestOutcome, IngestError> {
    let event: Event = serde_json::from_str(event_data)?;

    let now = crate::sync_state::now_unix();
    ctx.validator.validate(&event, now)?;

    match ctx.event_store.upsert(&event).await {
        Ok(UpsertOutcome::Inserted) => {
            if broadcast {
                broadcast_to_peers(ctx, &event, source_relay).await;
            }
            Ok(IngestOutcome::Stored)
        }
        Ok(UpsertOutcome::Skipped) => Ok(IngestOutcome::Skipped { reason: "skipped" }),
        Err(StorageError::Duplicate) => Ok(IngestOutcome::Skipped { reason: "duplicate" }),
        Err(other) => Err(other.into()),
    }
}

/// Fans the event out to every other upload-direction relay concurrently,
/// bounded by the `events` queue's worker pool so a burst of incoming
/// events can't open unbounded outbound sends at once.
async fn broadcast_to_peers(ctx: &WorkerContext, event: &Event, source_relay: Option<&str>) {
    let mut handles = Vec::new();
    for relay in ctx.config.upload_capable() {
        if Some(relay.url.as_str()) == source_relay {
            continue;
        }
        let permit = ctx
            .event_permits
            .clone()
            .acquire_owned()
            .await
            .expect("events queue semaphore is never closed");
        let manager = ctx.manager.clone();
        let relay_url = relay.url.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = manager
                .send_to(&relay_url, &ClientMessage::Event(event))
                .await
            {
                tracing::debug!(relay = %relay_url, error = %err, "broadcast publish failed");
            }
        }));
    }
    for handle in handles {
        handle.await.ok();
    }
}

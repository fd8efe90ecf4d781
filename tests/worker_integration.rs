//! Drives the polling worker against a scripted in-process relay (no real
//! socket), the same way `relay::manager`'s own tests substitute a
//! `NullTransport` — except this transport replies to whatever `REQ` it is
//! sent with a canned batch of events followed by `EOSE`, so the full
//! send/route/validate/upsert/checkpoint path gets exercised end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use nostr_sync::config::Config;
use nostr_sync::event::{Event, EventStore, ExpirationOnlyValidator, Filter, InMemoryEventStore};
use nostr_sync::relay::{
    HandlerRegistry, Manager, RelaySink, RelayStream, RelayTransport, TransportError,
};
use nostr_sync::sync_state::{Direction, InMemorySyncStateStore, SyncStateStore};
use nostr_sync::workers::polling::{self, PollingJob, PollingMode};
use nostr_sync::workers::WorkerContext;

fn sample_event(id_byte: u8, created_at: i64) -> Event {
    Event {
        event_id: hex::encode([id_byte; 32]),
        pubkey: "b".repeat(64),
        created_at,
        kind: 1,
        tags: vec![],
        content: "hello".into(),
        sig: "c".repeat(128),
        first_seen_at: None,
    }
}

/// Shared mailbox the sink writes into and the stream reads back out of, so
/// a `REQ` answered by the sink shows up on the matching `recv_text` call.
struct Inbox {
    frames: Mutex<VecDeque<String>>,
}

struct ScriptedSink {
    events: Vec<Event>,
    inbox: Arc<Inbox>,
}

#[async_trait]
impl RelaySink for ScriptedSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let arr = value.as_array().unwrap();
        if arr[0] == json!("REQ") {
            let sub_id = arr[1].as_str().unwrap().to_string();
            let mut frames = self.inbox.frames.lock().await;
            for event in &self.events {
                frames.push_back(
                    json!(["EVENT", sub_id, event]).to_string(),
                );
            }
            frames.push_back(json!(["EOSE", sub_id]).to_string());
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

struct ScriptedStream {
    inbox: Arc<Inbox>,
}

#[async_trait]
impl RelayStream for ScriptedStream {
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(frame) = self.inbox.frames.lock().await.pop_front() {
                return Some(Ok(frame));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct ScriptedTransport {
    events: Vec<Event>,
    connects: AtomicUsize,
}

#[async_trait]
impl RelayTransport for ScriptedTransport {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn RelaySink>, Box<dyn RelayStream>), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inbox = Arc::new(Inbox {
            frames: Mutex::new(VecDeque::new()),
        });
        Ok((
            Box::new(ScriptedSink {
                events: self.events.clone(),
                inbox: inbox.clone(),
            }),
            Box::new(ScriptedStream { inbox }),
        ))
    }
}

fn test_context(events: Vec<Event>) -> WorkerContext {
    let handlers = Arc::new(HandlerRegistry::new());
    let manager = Arc::new(Manager::new(
        Arc::new(ScriptedTransport {
            events,
            connects: AtomicUsize::new(0),
        }),
        handlers,
        Duration::from_millis(1),
        5,
    ));
    WorkerContext::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(ExpirationOnlyValidator),
        Arc::new(InMemorySyncStateStore::new()),
        manager,
        Arc::new(Config::default()),
    )
}

#[tokio::test]
async fn realtime_poll_ingests_every_scripted_event_and_returns_to_idle() {
    let events = vec![sample_event(1, 1_000), sample_event(2, 1_001), sample_event(3, 1_002)];
    let ctx = test_context(events.clone());

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        polling::run(
            &ctx,
            PollingJob {
                relay_url: "wss://relay.example.com".into(),
                filter: Filter::default(),
                direction: Direction::Down,
                mode: PollingMode::Realtime,
                backfill_target: None,
                chunk_hours: None,
                continuation: false,
            },
        ),
    )
    .await
    .expect("worker finished before the test timeout");
    outcome.unwrap();

    for event in &events {
        assert!(ctx.event_store.exists(&event.event_id).await.unwrap());
    }

    let states = ctx.sync_states.all().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, nostr_sync::sync_state::Status::Idle);
    assert_eq!(states[0].events_downloaded, 3);
}

#[tokio::test]
async fn realtime_poll_skips_a_relay_still_marked_syncing() {
    let ctx = test_context(vec![]);
    let filter_hash = Filter::default().hash("download");
    let mut state = ctx
        .sync_states
        .for_sync("wss://relay.example.com", Direction::Down, &filter_hash)
        .await
        .unwrap();
    state.mark_syncing().unwrap();
    ctx.sync_states.save(&state).await.unwrap();

    polling::run(
        &ctx,
        PollingJob {
            relay_url: "wss://relay.example.com".into(),
            filter: Filter::default(),
            direction: Direction::Down,
            mode: PollingMode::Realtime,
            backfill_target: None,
            chunk_hours: None,
            continuation: false,
        },
    )
    .await
    .unwrap();

    let states = ctx.sync_states.all().await.unwrap();
    assert_eq!(states[0].status, nostr_sync::sync_state::Status::Syncing);
    assert_eq!(states[0].events_downloaded, 0, "second run should have been skipped, not re-ingested");
}

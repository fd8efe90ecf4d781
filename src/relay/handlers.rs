//! Subscription-id-keyed callback tables. Grounded in
//! `enostr::relay::subscription::OutboxSubscriptions`'s map-of-subscriptions
//! shape, generalized to four tables and expressed over channels rather than
//! closures so a handler can be awaited from across a `tokio::spawn`
//! boundary.
//!
//! `event` and `neg` are persistent (a worker drives many frames through
//! them, and explicitly unregisters when done); `eose` and `ok` are
//! consume-on-fire, matching NIP-01's "exactly one EOSE/OK per
//! subscription/event" semantics.

use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::event::Event;

/// A decoded incoming negentropy frame, forwarded to whichever worker owns
/// the reconciler for this subscription.
#[derive(Debug)]
pub enum NegInbound {
    Msg(Vec<u8>),
    Err(String),
}

#[derive(Default)]
struct Inner {
    event: HashMap<String, mpsc::UnboundedSender<Event>>,
    eose: HashMap<String, oneshot::Sender<()>>,
    ok: HashMap<String, oneshot::Sender<(bool, String)>>,
    neg: HashMap<String, mpsc::UnboundedSender<NegInbound>>,
}

/// All operations take the single internal lock only for the duration of
/// the map access; callers never hold it while invoking a handler.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: Mutex<Inner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_event(&self, sub_id: String, sender: mpsc::UnboundedSender<Event>) {
        self.inner.lock().await.event.insert(sub_id, sender);
    }

    pub async fn unregister_event(&self, sub_id: &str) {
        self.inner.lock().await.event.remove(sub_id);
    }

    pub async fn register_eose(&self, sub_id: String, sender: oneshot::Sender<()>) {
        self.inner.lock().await.eose.insert(sub_id, sender);
    }

    pub async fn unregister_eose(&self, sub_id: &str) {
        self.inner.lock().await.eose.remove(sub_id);
    }

    pub async fn register_ok(&self, event_id: String, sender: oneshot::Sender<(bool, String)>) {
        self.inner.lock().await.ok.insert(event_id, sender);
    }

    pub async fn unregister_ok(&self, event_id: &str) {
        self.inner.lock().await.ok.remove(event_id);
    }

    pub async fn register_neg(&self, sub_id: String, sender: mpsc::UnboundedSender<NegInbound>) {
        self.inner.lock().await.neg.insert(sub_id, sender);
    }

    pub async fn unregister_neg(&self, sub_id: &str) {
        self.inner.lock().await.neg.remove(sub_id);
    }

    /// Delivers an `EVENT`. Returns `false` if nothing was registered for
    /// `sub_id` (e.g. after the subscription already closed).
    pub async fn fire_event(&self, sub_id: &str, event: Event) -> bool {
        let sender = self.inner.lock().await.event.get(sub_id).cloned();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn fire_eose(&self, sub_id: &str) -> bool {
        let sender = self.inner.lock().await.eose.remove(sub_id);
        match sender {
            Some(sender) => sender.send(()).is_ok(),
            None => false,
        }
    }

    pub async fn fire_ok(&self, event_id: &str, success: bool, message: String) -> bool {
        let sender = self.inner.lock().await.ok.remove(event_id);
        match sender {
            Some(sender) => sender.send((success, message)).is_ok(),
            None => false,
        }
    }

    pub async fn fire_neg(&self, sub_id: &str, inbound: NegInbound) -> bool {
        let sender = self.inner.lock().await.neg.get(sub_id).cloned();
        match sender {
            Some(sender) => sender.send(inbound).is_ok(),
            None => false,
        }
    }
}

//! Event and Filter DTOs, and the storage/validation traits the rest of the
//! crate is written against. These are first-party shapes, not a re-export
//! of an embedded database's native types — the sync engine treats the
//! event store as an external collaborator it only needs to `upsert`,
//! `exists`, `scan`, and count against.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A signed, immutable Nostr event. Deduplication key is `event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
    /// When this crate first observed the event, regardless of
    /// `created_at`. Defaults to ingestion time when absent upstream.
    #[serde(default)]
    pub first_seen_at: Option<i64>,
}

impl Event {
    /// The NIP-40 `["expiration", "<unix seconds>"]` tag, if present and
    /// well-formed.
    pub fn expiration(&self) -> Option<i64> {
        self.tags.iter().find_map(|tag| {
            if tag.first().map(String::as_str) == Some("expiration") {
                tag.get(1)?.parse::<i64>().ok()
            } else {
                None
            }
        })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration().is_some_and(|exp| exp <= now)
    }
}

/// A REQ filter. `since`/`until` are excluded from [`Filter::hash`] so a
/// negentropy session's identity survives the rolling time window a
/// chunked sync advances it through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    /// `#e`, `#p`, etc. Keyed by the bare letter (no leading `#`).
    #[serde(flatten, with = "tag_filters")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    /// `hex(sha256("<direction>:" + canonical_json(sorted filter without
    /// since/until)))[0..16]`. `direction` is `"download"`, `"upload"`, or
    /// the literal `"upload"` sentinel for upload-only rows that carry no
    /// real filter at all.
    pub fn hash(&self, direction: &str) -> String {
        let mut stable = self.clone();
        stable.since = None;
        stable.until = None;
        // BTreeMap and Vec<u8> serialization are already key-sorted/stable;
        // serde_json preserves struct field declaration order, which is
        // fixed here, so this is a canonical encoding for our own type.
        let body = serde_json::to_string(&stable).expect("Filter serializes");
        let mut hasher = Sha256::new();
        hasher.update(direction.as_bytes());
        hasher.update(b":");
        hasher.update(body.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    pub const UPLOAD_SENTINEL: &'static str = "upload";
}

mod tag_filters {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<String, Vec<String>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (letter, values) in map {
            out.serialize_entry(&format!("#{letter}"), values)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<String>>, D::Error> {
        let raw: BTreeMap<String, Vec<String>> = BTreeMap::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix('#').map(|letter| (letter.to_string(), v)))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Skipped,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("event store io error: {0}")]
    Io(String),
    #[error("duplicate event")]
    Duplicate,
}

/// The event-store collaborator this crate is written against. Implemented
/// elsewhere (an embedded database, a remote service); this crate only
/// needs these four operations.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert(&self, event: &Event) -> Result<UpsertOutcome, StorageError>;
    async fn exists(&self, event_id: &str) -> Result<bool, StorageError>;
    /// Streams ids and timestamps matching `filter`, oldest first, for
    /// building a negentropy [`crate::negentropy::Storage`] view and for
    /// scanning the upload cursor.
    async fn scan(&self, filter: &Filter) -> Result<Vec<(i64, [u8; 32])>, StorageError>;
    async fn id_count_in_range(&self, lower: i64, upper: i64) -> Result<usize, StorageError>;
    /// Loads a full event by id, e.g. to publish one a peer reported
    /// missing. `None` if this store doesn't have it.
    async fn load(&self, event_id: &str) -> Result<Option<Event>, StorageError>;
}

/// Signature/schema/expiration checks performed before an event is trusted.
/// Synchronous: validation never needs to await anything.
pub trait EventValidator: Send + Sync {
    fn validate(&self, event: &Event, now: i64) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid signature")]
    BadSignature,
    #[error("malformed event")]
    Malformed,
    #[error("event expired per NIP-40")]
    Expired,
}

/// Reference `EventStore` used in tests and as the default for
/// single-process deployments. Keeps one copy of each event plus an
/// insertion-ordered index for `scan`.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: tokio::sync::RwLock<std::collections::BTreeMap<i64, Vec<Event>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn upsert(&self, event: &Event) -> Result<UpsertOutcome, StorageError> {
        let mut events = self.events.write().await;
        let bucket = events.entry(event.created_at).or_default();
        if bucket.iter().any(|e| e.event_id == event.event_id) {
            return Ok(UpsertOutcome::Skipped);
        }
        bucket.push(event.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn exists(&self, event_id: &str) -> Result<bool, StorageError> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .any(|bucket| bucket.iter().any(|e| e.event_id == event_id)))
    }

    async fn scan(&self, filter: &Filter) -> Result<Vec<(i64, [u8; 32])>, StorageError> {
        let events = self.events.read().await;
        let mut out = Vec::new();
        for (created_at, bucket) in events.iter() {
            if filter.since.is_some_and(|since| *created_at < since) {
                continue;
            }
            if filter.until.is_some_and(|until| *created_at > until) {
                continue;
            }
            for event in bucket {
                if let Some(kinds) = &filter.kinds {
                    if !kinds.contains(&event.kind) {
                        continue;
                    }
                }
                out.push((*created_at, event_id_bytes(&event.event_id)));
            }
        }
        Ok(out)
    }

    async fn id_count_in_range(&self, lower: i64, upper: i64) -> Result<usize, StorageError> {
        let events = self.events.read().await;
        Ok(events
            .range(lower..=upper)
            .map(|(_, bucket)| bucket.len())
            .sum())
    }

    async fn load(&self, event_id: &str) -> Result<Option<Event>, StorageError> {
        let events = self.events.read().await;
        Ok(events
            .values()
            .flatten()
            .find(|e| e.event_id == event_id)
            .cloned())
    }
}

/// Parses a hex event id into the fixed-width form negentropy items need.
/// Malformed ids (shouldn't happen once [`EventValidator`] has run) sort to
/// the zero id rather than panicking a scan.
fn event_id_bytes(event_id: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    if let Ok(bytes) = hex::decode(event_id) {
        let len = bytes.len().min(32);
        out[..len].copy_from_slice(&bytes[..len]);
    }
    out
}

/// Checks only what this crate is responsible for: the NIP-40 expiration
/// tag and the presence of the fields a real signature check would need.
/// Actual cryptographic verification is an external collaborator's job.
pub struct ExpirationOnlyValidator;

impl EventValidator for ExpirationOnlyValidator {
    fn validate(&self, event: &Event, now: i64) -> Result<(), ValidationError> {
        if event.event_id.is_empty() || event.pubkey.is_empty() || event.sig.is_empty() {
            return Err(ValidationError::Malformed);
        }
        if event.is_expired(now) {
            return Err(ValidationError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            event_id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 1_000,
            kind: 1,
            tags: vec![vec!["expiration".into(), "1500".into()]],
            content: "hi".into(),
            sig: "c".repeat(128),
            first_seen_at: None,
        }
    }

    #[test]
    fn expiration_reads_nip40_tag() {
        assert_eq!(sample().expiration(), Some(1_500));
    }

    #[test]
    fn is_expired_compares_against_now() {
        let event = sample();
        assert!(!event.is_expired(1_000));
        assert!(event.is_expired(1_500));
        assert!(event.is_expired(2_000));
    }

    #[test]
    fn missing_expiration_tag_never_expires() {
        let mut event = sample();
        event.tags.clear();
        assert!(!event.is_expired(i64::MAX));
    }

    #[test]
    fn filter_hash_ignores_since_and_until() {
        let mut a = Filter {
            kinds: Some(vec![1]),
            since: Some(1),
            ..Default::default()
        };
        let b = Filter {
            kinds: Some(vec![1]),
            since: Some(999),
            until: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(a.hash("download"), b.hash("download"));
        a.kinds = Some(vec![2]);
        assert_ne!(a.hash("download"), b.hash("download"));
    }

    #[test]
    fn filter_hash_is_direction_sensitive() {
        let filter = Filter {
            kinds: Some(vec![1]),
            ..Default::default()
        };
        assert_ne!(filter.hash("download"), filter.hash("upload"));
    }

    #[test]
    fn tag_filter_roundtrips_through_json() {
        let mut filter = Filter::default();
        filter.tags.insert("e".into(), vec!["deadbeef".into()]);
        let json = serde_json::to_string(&filter).unwrap();
        assert!(json.contains("\"#e\""));
        let back: Filter = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tags.get("e"), Some(&vec!["deadbeef".to_string()]));
    }

    #[tokio::test]
    async fn in_memory_store_upsert_is_idempotent() {
        let store = InMemoryEventStore::new();
        let event = sample();
        assert_eq!(store.upsert(&event).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&event).await.unwrap(), UpsertOutcome::Skipped);
        assert!(store.exists(&event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn in_memory_store_load_roundtrips() {
        let store = InMemoryEventStore::new();
        let event = sample();
        store.upsert(&event).await.unwrap();
        let loaded = store.load(&event.event_id).await.unwrap();
        assert_eq!(loaded, Some(event));
        assert_eq!(store.load("missing").await.unwrap(), None);
    }

    #[test]
    fn expiration_only_validator_rejects_expired_and_malformed() {
        let validator = ExpirationOnlyValidator;
        let mut event = sample();
        assert!(validator.validate(&event, 1_000).is_ok());
        assert_eq!(
            validator.validate(&event, 1_500),
            Err(ValidationError::Expired)
        );
        event.event_id.clear();
        assert_eq!(
            validator.validate(&event, 1_000),
            Err(ValidationError::Malformed)
        );
    }
}

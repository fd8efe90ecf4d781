//! Crate-wide error aggregation: one enum variant per concern, `#[from]`
//! where the conversion is unambiguous. Reconciler/codec errors stay local
//! to [`crate::negentropy::NegentropyError`] rather than folding in here —
//! workers need to match on that type specifically to implement the
//! NIP-77 fallback-to-polling behavior.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(#[from] crate::relay::ConnectionError),
    #[error("protocol error: {0}")]
    Protocol(#[from] crate::relay::ProtocolError),
    #[error("negentropy error: {0}")]
    Negentropy(#[from] crate::negentropy::NegentropyError),
    #[error("event store error: {0}")]
    Storage(#[from] crate::event::StorageError),
    #[error("validation error: {0}")]
    Validation(#[from] crate::event::ValidationError),
    #[error("sync state error: {0}")]
    SyncState(#[from] crate::sync_state::SyncStateError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("worker error: {0}")]
    Worker(#[from] crate::workers::WorkerError),
    #[error("ingest error: {0}")]
    Ingest(#[from] crate::ingest::IngestError),
}

use thiserror::Error;

/// Errors raised by the Negentropy codec, storage view, and reconciler.
///
/// These stay local to the `negentropy` module rather than folding into the
/// crate-wide [`crate::Error`] because callers (the worker) need to match on
/// `NegentropyError` specifically to implement the NIP-77 fallback-to-polling
/// behavior.
#[derive(Debug, Error)]
pub enum NegentropyError {
    #[error("negentropy message used unsupported protocol byte")]
    UnsupportedProtocol,
    #[error("malformed negentropy message: {0}")]
    BadMessage(&'static str),
    #[error("operation attempted on a storage view that has not been sealed")]
    StorageNotSealed,
    #[error("operation attempted on a sealed storage view")]
    StorageSealed,
    #[error("reconciler response exceeded the frame budget: {0} bytes")]
    FrameOverflow(usize),
    #[error("peer reported a negentropy error: {0}")]
    PeerError(String),
}

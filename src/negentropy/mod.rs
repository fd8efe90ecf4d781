//! First-party implementation of the Negentropy set-reconciliation protocol
//! (NIP-77): varints, range bounds, order-independent fingerprints, sealed
//! storage, the wire message codec, and the client/server reconciler step.
//!
//! Implemented directly rather than wrapping an external crate, since the
//! protocol mechanics are the part of this codebase most worth owning.

mod bound;
mod error;
mod fingerprint;
mod message;
mod reconciler;
mod storage;
mod varint;

pub use bound::{Bound, Item, Timestamp, ID_SIZE};
pub use error::NegentropyError;
pub use fingerprint::{fingerprints_match, Accumulator, FINGERPRINT_SIZE};
pub use message::{Message, Mode, ID_LIST_THRESHOLD, PROTOCOL_VERSION};
pub use reconciler::{ClientReconciler, ServerReconciler, StepOutcome, DEFAULT_FRAME_SIZE};
pub use storage::Storage;

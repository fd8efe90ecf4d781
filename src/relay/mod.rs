//! Relay-facing plumbing: the wire codec, the WebSocket connection
//! lifecycle, the subscription handler tables, and the manager that ties
//! one of each per configured relay.

pub mod connection;
pub mod handlers;
pub mod manager;
pub mod message;
pub mod transport;

pub use connection::{ConnState, Connection, ConnectionError};
pub use handlers::{HandlerRegistry, NegInbound};
pub use manager::Manager;
pub use message::{ClientMessage, ProtocolError, RelayMessage};
pub use transport::{RelaySink, RelayStream, RelayTransport, TransportError, TungsteniteTransport};

//! Owns the `relay_url -> Connection` map. Grounded in
//! `enostr::relay::pool::RelayPool` (`relays: Vec<PoolRelay>`,
//! `add_url`/`send_to`), generalized to key by URL directly (this crate has
//! no wasm target needing index-stable storage) and to delegate inbound
//! NEG-MSG/NEG-ERR routing to whatever worker registered a handler for
//! that subscription in the [`HandlerRegistry`] shared by every
//! connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::connection::{Connection, ConnectionError};
use super::handlers::HandlerRegistry;
use super::message::ClientMessage;
use super::transport::RelayTransport;

pub struct Manager {
    transport: Arc<dyn RelayTransport>,
    handlers: Arc<HandlerRegistry>,
    connections: Mutex<hashbrown::HashMap<String, Arc<Connection>>>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
}

impl Manager {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        handlers: Arc<HandlerRegistry>,
        reconnect_delay: Duration,
        max_reconnect_attempts: u32,
    ) -> Self {
        Manager {
            transport,
            handlers,
            connections: Mutex::new(hashbrown::HashMap::new()),
            reconnect_delay,
            max_reconnect_attempts,
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Returns the existing connection for `url`, creating (but not
    /// necessarily dialing) one if this is the first time it's referenced.
    pub async fn connection_for(&self, url: &str) -> Arc<Connection> {
        let mut connections = self.connections.lock().await;
        connections
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(Connection::new(
                    url.to_string(),
                    self.transport.clone(),
                    self.handlers.clone(),
                    self.reconnect_delay,
                    self.max_reconnect_attempts,
                ))
            })
            .clone()
    }

    /// Dials (if necessary) and returns the connection for `url`.
    pub async fn add_connection(&self, url: &str) -> Result<Arc<Connection>, ConnectionError> {
        let connection = self.connection_for(url).await;
        connection.ensure_connected().await?;
        Ok(connection)
    }

    pub async fn send_to(
        &self,
        url: &str,
        message: &ClientMessage,
    ) -> Result<(), ConnectionError> {
        let connection = self.add_connection(url).await?;
        connection.send(message).await
    }

    pub async fn urls(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::transport::{RelaySink, RelayStream, TransportError};
    use async_trait::async_trait;

    struct NullSink;
    #[async_trait]
    impl RelaySink for NullSink {
        async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&mut self) {}
    }

    struct NullStream;
    #[async_trait]
    impl RelayStream for NullStream {
        async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
            None
        }
    }

    struct NullTransport;
    #[async_trait]
    impl RelayTransport for NullTransport {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn RelaySink>, Box<dyn RelayStream>), TransportError> {
            Ok((Box::new(NullSink), Box::new(NullStream)))
        }
    }

    #[tokio::test]
    async fn connection_for_is_idempotent_per_url() {
        let manager = Manager::new(
            Arc::new(NullTransport),
            Arc::new(HandlerRegistry::new()),
            Duration::from_millis(1),
            5,
        );
        let a = manager.connection_for("wss://relay.example.com").await;
        let b = manager.connection_for("wss://relay.example.com").await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn add_connection_dials_and_tracks_url() {
        let manager = Manager::new(
            Arc::new(NullTransport),
            Arc::new(HandlerRegistry::new()),
            Duration::from_millis(1),
            5,
        );
        manager.add_connection("wss://relay.example.com").await.unwrap();
        assert_eq!(manager.urls().await, vec!["wss://relay.example.com".to_string()]);
    }
}

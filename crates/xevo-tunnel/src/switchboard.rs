//! Loopback switchboard
//!
//! In-process rendezvous by name: a stub registers as the listener for a
//! loop name, a skeleton dials the name, and the two halves are wired
//! through an in-memory duplex pipe without leaving the process. At most one
//! listener may hold a name; dials to an unregistered name fail; connected
//! pairs outlive deregistration.

use crate::error::{Result, TunnelError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

/// In-memory pipe capacity per direction
const LOOP_BUFFER: usize = 64 * 1024;
/// Dials that may queue before a slow listener pushes back
const DIAL_BACKLOG: usize = 16;

/// Process-wide loop name registry
#[derive(Default, Debug)]
pub struct Switchboard {
    listeners: DashMap<String, mpsc::Sender<DuplexStream>>,
}

impl Switchboard {
    /// Create an empty switchboard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the listener for a loop name.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the name already has a listener.
    pub fn register(self: &Arc<Self>, name: &str) -> Result<LoopListener> {
        let (tx, rx) = mpsc::channel(DIAL_BACKLOG);
        match self.listeners.entry(name.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::connection_msg(format!(
                "loop name '{name}' already has a listener"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                tracing::debug!(name = %name, "loop listener registered");
                Ok(LoopListener {
                    name: name.to_string(),
                    rx,
                    board: Arc::clone(self),
                })
            }
        }
    }

    /// Dial a loop name, delivering the peer half to its listener.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no listener holds the name, including the race
    /// where the listener deregisters while the dial is in flight.
    pub async fn dial(&self, name: &str) -> Result<DuplexStream> {
        let tx = self
            .listeners
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TunnelError::NotFound {
                name: name.to_string(),
            })?;
        let (near, far) = tokio::io::duplex(LOOP_BUFFER);
        tx.send(far).await.map_err(|_| TunnelError::NotFound {
            name: name.to_string(),
        })?;
        Ok(near)
    }

    fn deregister(&self, name: &str) {
        self.listeners.remove(name);
        tracing::debug!(name = %name, "loop listener deregistered");
    }
}

/// Listener half of a loop name; deregisters on drop
#[derive(Debug)]
pub struct LoopListener {
    name: String,
    rx: mpsc::Receiver<DuplexStream>,
    board: Arc<Switchboard>,
}

impl LoopListener {
    /// Wait for the next dialed-in connection; `None` after deregistration
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }

    /// The loop name this listener holds
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LoopListener {
    fn drop(&mut self) {
        self.board.deregister(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_reaches_listener() {
        let board = Arc::new(Switchboard::new());
        let mut listener = board.register("db").unwrap();

        let mut dialer = board.dial("db").await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        dialer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // And the reverse direction.
        accepted.write_all(b"world").await.unwrap();
        dialer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_single_listener_per_name() {
        let board = Arc::new(Switchboard::new());
        let _listener = board.register("db").unwrap();
        assert!(board.register("db").is_err());
        // A different name is fine.
        assert!(board.register("cache").is_ok());
    }

    #[tokio::test]
    async fn test_dial_unregistered_name() {
        let board = Arc::new(Switchboard::new());
        let err = board.dial("missing").await.unwrap_err();
        assert!(matches!(err, TunnelError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_deregistration_fails_new_dials() {
        let board = Arc::new(Switchboard::new());
        let listener = board.register("db").unwrap();
        drop(listener);
        assert!(board.dial("db").await.is_err());
        // The name can be reused.
        assert!(board.register("db").is_ok());
    }

    #[tokio::test]
    async fn test_connected_pair_outlives_deregistration() {
        let board = Arc::new(Switchboard::new());
        let mut listener = board.register("db").unwrap();

        let mut dialer = board.dial("db").await.unwrap();
        let mut accepted = listener.accept().await.unwrap();
        drop(listener);

        dialer.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }
}

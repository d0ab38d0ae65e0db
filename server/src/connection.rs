//! Per-connection relay loop
//!
//! After the handshake every connection is driven by two tasks:
//! - The handler, which reads from the socket, frames and parses messages,
//!   records player updates and fans them out to the other players
//! - The writer, which drains the player's outbound queue into the socket
//!
//! The handler owns the connection's registry entry for its whole lifetime:
//! it is the only code that updates the entry's player state, and it removes
//! the entry (closing the writer) when the read side ends.

use crate::client_manager::{Outbound, SharedRegistry, OUTBOUND_QUEUE};
use log::{debug, info, warn};
use shared::{parse_frame, Framer, Framing, PlayerNotice, PlayerUpdate, MSG_SIZE};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Lifecycle of one connection, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Identifier sent, waiting for the username
    Handshaking,
    /// Registered and relaying messages
    Active,
    /// Read side ended; departure being announced
    Closing,
    /// Entry removed and connection released
    Closed,
}

/// Spawns the task that writes queued payloads to `writer`.
///
/// The queue holds at most `OUTBOUND_QUEUE` payloads. The task ends when every send handle is dropped or a write fails, and
/// shuts the write side down on the way out.
pub fn spawn_writer<W>(mut writer: W, id: String) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);

    let handle = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let written = async {
                writer.write_all(&payload).await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                debug!("Write to player {} failed: {}", id, e);
                break;
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of player {} connection failed: {}", id, e);
        }
    });

    (tx, handle)
}

/// Drives one registered player's connection until it closes.
pub struct ConnectionHandler<R> {
    id: String,
    reader: R,
    registry: SharedRegistry,
    framer: Framer,
    idle_timeout: Option<Duration>,
    state: ConnectionState,
}

impl<R> ConnectionHandler<R>
where
    R: AsyncRead + Unpin,
{
    /// Wraps the read half of a connection whose player `id` is registered.
    ///
    /// `idle_timeout` closes the connection after that long without data.
    pub fn new(
        id: String,
        reader: R,
        registry: SharedRegistry,
        framing: Framing,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            reader,
            registry,
            framer: Framer::new(framing),
            idle_timeout,
            state: ConnectionState::Handshaking,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Player {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Runs the relay loop, then the departure sequence.
    pub async fn run(mut self) -> ConnectionState {
        self.transition(ConnectionState::Active);

        let mut buffer = [0u8; MSG_SIZE];
        while let Some(len) = self.read_chunk(&mut buffer).await {
            for frame in self.framer.push(&buffer[..len]) {
                self.handle_frame(frame).await;
            }
        }

        self.transition(ConnectionState::Closing);
        self.close().await;
        self.transition(ConnectionState::Closed);
        self.state
    }

    /// Returns `None` on end of stream, read error or idle timeout.
    async fn read_chunk(&mut self, buffer: &mut [u8]) -> Option<usize> {
        let idle_timeout = self.idle_timeout;
        let read = self.reader.read(buffer);

        let result = match idle_timeout {
            Some(limit) => match timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    info!("Player {} idle for {:?}, closing", self.id, limit);
                    return None;
                }
            },
            None => read.await,
        };

        match result {
            Ok(0) => None,
            Ok(len) => Some(len),
            Err(e) => {
                debug!("Read from player {} failed: {}", self.id, e);
                None
            }
        }
    }

    async fn handle_frame(&mut self, frame: Vec<u8>) {
        let message = match parse_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping frame from player {}: {}", self.id, e);
                return;
            }
        };

        let payload = self.framer.mode().seal(frame);
        let mut registry = self.registry.write().await;

        if let Some(update) = PlayerUpdate::from_message(&message) {
            registry.apply_update(&self.id, update);
        }

        let report = registry.broadcast(&self.id, &payload);
        debug!(
            "Relayed update from player {} to {} peers ({} failed)",
            self.id, report.delivered, report.failed
        );
    }

    /// Removes the registry entry and tells the remaining players.
    async fn close(&mut self) {
        let notice = match PlayerNotice::departure(&self.id).encode() {
            Ok(bytes) => Some(self.framer.mode().seal(bytes)),
            Err(e) => {
                warn!("Failed to encode departure of player {}: {}", self.id, e);
                None
            }
        };

        let removed = {
            let mut registry = self.registry.write().await;
            let removed = registry.remove(&self.id);
            if let Some(notice) = notice {
                let report = registry.broadcast(&self.id, &notice);
                debug!(
                    "Departure of player {} sent to {} peers ({} failed)",
                    self.id, report.delivered, report.failed
                );
            }
            removed
        };

        match removed {
            Some(record) => info!(
                "Player {} (ID {}) disconnected",
                record.username, record.id
            ),
            None => warn!("Player {} was not registered at disconnect", self.id),
        }
    }
}

//! # Relay Server Library
//!
//! This library implements a real-time state relay for a multiplayer game.
//! Clients connect over TCP, receive a session identifier, and exchange
//! player updates (position, rotation, health) that the server forwards to
//! every other connected client. The server does not simulate anything: the
//! player fields are opaque JSON that it stores and echoes back.
//!
//! ## Connection Lifecycle
//!
//! ### Handshake
//! 1. The server reserves a free identifier in `1..=max_players` and sends it
//!    as bare ASCII digits. A full server closes the connection instead.
//! 2. The client answers with its username in a single write.
//! 3. The player is registered with spawn defaults, every other player gets
//!    an arrival notice, and the new player receives one roster entry per
//!    player already connected.
//!
//! ### Relay
//! Each read is framed, parsed as a JSON object, and relayed byte-for-byte to
//! every other registered player. Messages with `"object": "player"` also
//! update the sender's record. Malformed input is dropped without closing
//! the connection.
//!
//! ### Departure
//! When the read side ends, the player is removed from the registry and the
//! remaining players receive a departure notice. Its identifier becomes
//! available again immediately.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! The session registry, player records and the identifier allocator. The
//! registry is the only state shared between connections and sits behind a
//! single `RwLock`.
//!
//! ### Connection Module (`connection`)
//! The per-connection relay loop and the writer task that owns the socket's
//! write half.
//!
//! ### Network Module (`network`)
//! Listener setup, the accept loop, the handshake and the optional HTTP
//! health-probe filter.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".to_string(),
//!         port: 8000,
//!         ..ServerConfig::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Failure Isolation
//!
//! Transport errors, framing errors and failed sends to a single peer are
//! contained in the connection they belong to. Only failing to bind the
//! listener is fatal.

pub mod client_manager;
pub mod connection;
pub mod error;
pub mod network;

pub use client_manager::{PlayerRecord, SessionRegistry, SharedRegistry};
pub use error::RelayError;
pub use network::{Server, ServerConfig};

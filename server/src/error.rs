use thiserror::Error;

/// Errors raised by the relay server.
///
/// Everything except `Bind` is scoped to a single connection and ends only
/// that connection.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every identifier in `1..=max_players` is taken.
    #[error("server full: all {max_players} player slots are in use")]
    ServerFull { max_players: usize },

    #[error("connection closed during handshake")]
    HandshakeClosed,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode notice: {0}")]
    Encode(#[from] serde_json::Error),
}

//! Server network layer: listener, handshake and connection spawning

use crate::client_manager::{PlayerRecord, SessionRegistry, SharedRegistry};
use crate::connection::{spawn_writer, ConnectionHandler};
use crate::error::RelayError;
use log::{debug, error, info, warn};
use shared::{
    Framing, DEFAULT_ADDR, DEFAULT_PORT, HANDSHAKE_TIMEOUT, MAX_PLAYERS, MSG_SIZE, ROSTER_PACING,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Delay between bind attempts while the port is in use.
pub const BIND_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Bytes inspected when looking for an HTTP health probe.
const PROBE_PEEK_SIZE: usize = 64;

/// Request prefixes of plain HTTP health checks.
const PROBE_PREFIXES: [&str; 2] = ["GET /", "HEAD /"];

/// Runtime settings for the relay server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of the identifier pool and the listen backlog
    pub max_players: usize,
    /// Delay between roster messages sent to a joining player
    pub roster_pacing: Duration,
    /// Time a new connection gets to send its username before its
    /// identifier is released
    pub handshake_timeout: Duration,
    /// Closes registered players that stay silent this long; unbounded when `None`
    pub idle_timeout: Option<Duration>,
    /// Enables the HTTP probe filter, waiting this long for the first bytes
    pub probe_timeout: Option<Duration>,
    /// How message boundaries are found on player connections
    pub framing: Framing,
    /// Extra bind attempts when the address is already in use
    pub bind_retries: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ADDR.to_string(),
            port: DEFAULT_PORT,
            max_players: MAX_PLAYERS,
            roster_pacing: ROSTER_PACING,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            idle_timeout: None,
            probe_timeout: None,
            framing: Framing::Brace,
            bind_retries: 0,
        }
    }
}

impl ServerConfig {
    /// `host:port` string the listener binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Accepts players and hands each connection to its own task.
pub struct Server {
    listener: TcpListener,
    registry: SharedRegistry,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Binds the listening socket, retrying while the port is in use.
    pub async fn bind(config: ServerConfig) -> Result<Self, RelayError> {
        let address = config.address();
        let mut attempts_left = config.bind_retries;

        let listener = loop {
            match Self::listen(&address, config.max_players).await {
                Ok(listener) => break listener,
                Err(e) if e.kind() == ErrorKind::AddrInUse && attempts_left > 0 => {
                    attempts_left -= 1;
                    warn!(
                        "Port {} already in use, retrying in {:?}",
                        config.port, BIND_RETRY_DELAY
                    );
                    sleep(BIND_RETRY_DELAY).await;
                }
                Err(source) => {
                    return Err(RelayError::Bind {
                        addr: address,
                        source,
                    })
                }
            }
        };

        info!("Server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            registry: SessionRegistry::shared(config.max_players),
            config: Arc::new(config),
        })
    }

    async fn listen(address: &str, backlog: usize) -> std::io::Result<TcpListener> {
        let addr = tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
            std::io::Error::new(ErrorKind::InvalidInput, "address resolved to nothing")
        })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog.clamp(1, u32::MAX as usize) as u32)
    }

    /// Address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the registry shared with every connection.
    pub fn registry(&self) -> SharedRegistry {
        Arc::clone(&self.registry)
    }

    /// Settings the server was bound with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts connections forever. Accept errors are logged and retried.
    pub async fn run(self) -> Result<(), RelayError> {
        info!(
            "Server started, waiting for players (max {}, {} framing)",
            self.config.max_players, self.config.framing
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = Arc::clone(&self.registry);
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        serve_connection(stream, addr, registry, config).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> JoinHandle<Result<(), RelayError>> {
        tokio::spawn(self.run())
    }
}

/// Handshake followed by the relay loop for one accepted connection.
async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: SharedRegistry,
    config: Arc<ServerConfig>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", addr, e);
    }

    if let Some(wait) = config.probe_timeout {
        if is_health_probe(&stream, wait).await {
            info!("Ignored health probe from {}", addr);
            return;
        }
    }

    let (reader, writer) = stream.into_split();
    match admit(reader, writer, addr, &registry, &config).await {
        Ok((id, reader)) => {
            ConnectionHandler::new(id, reader, registry, config.framing, config.idle_timeout)
                .run()
                .await;
        }
        Err(RelayError::ServerFull { max_players }) => {
            warn!(
                "Rejected connection from {}: all {} slots taken",
                addr, max_players
            );
        }
        Err(e) => warn!("Handshake with {} failed: {}", addr, e),
    }
}

/// Peeks at the first bytes without consuming them and reports whether they
/// look like a plain HTTP request.
async fn is_health_probe(stream: &TcpStream, wait: Duration) -> bool {
    let mut buffer = [0u8; PROBE_PEEK_SIZE];
    match timeout(wait, stream.peek(&mut buffer)).await {
        Ok(Ok(len)) => looks_like_http(&buffer[..len]),
        _ => false,
    }
}

fn looks_like_http(data: &[u8]) -> bool {
    let text = String::from_utf8_lossy(data);
    PROBE_PREFIXES.iter().any(|prefix| text.starts_with(prefix))
}

/// Sends the assigned identifier and reads back the username.
///
/// The identifier goes out as bare ASCII digits. The username is whatever a
/// single read of at most `MSG_SIZE` bytes returns.
pub async fn exchange_identity<R, W>(
    reader: &mut R,
    writer: &mut W,
    id: &str,
) -> Result<String, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(id.as_bytes()).await?;
    writer.flush().await?;

    let mut buffer = [0u8; MSG_SIZE];
    let len = reader.read(&mut buffer).await?;
    if len == 0 {
        return Err(RelayError::HandshakeClosed);
    }

    Ok(String::from_utf8_lossy(&buffer[..len]).into_owned())
}

/// Runs the handshake and registers the player.
///
/// On success the player is in the registry, every other player has been
/// told about it, and it has received the roster. Any failure before
/// registration releases the reserved identifier and leaves no state behind,
/// including a client that does not send its username within
/// `config.handshake_timeout`.
pub async fn admit<R, W>(
    mut reader: R,
    mut writer: W,
    addr: SocketAddr,
    registry: &SharedRegistry,
    config: &ServerConfig,
) -> Result<(String, R), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = registry.write().await.allocate_id()?;
    debug!("Reserved ID {} for {}", id, addr);

    let exchange = timeout(
        config.handshake_timeout,
        exchange_identity(&mut reader, &mut writer, &id),
    );
    let username = match exchange.await.unwrap_or(Err(RelayError::HandshakeTimeout)) {
        Ok(username) => username,
        Err(e) => {
            registry.write().await.release_reservation(&id);
            return Err(e);
        }
    };

    let (outbound, _writer_task) = spawn_writer(writer, id.clone());
    let record = PlayerRecord::new(id.clone(), addr, username, outbound.clone());
    let arrival = match record.arrival_notice().encode() {
        Ok(bytes) => config.framing.seal(bytes),
        Err(e) => {
            registry.write().await.release_reservation(&id);
            return Err(e.into());
        }
    };

    let roster = {
        let mut registry = registry.write().await;
        registry.register(record);
        let report = registry.broadcast(&id, &arrival);
        debug!(
            "Arrival of player {} sent to {} peers ({} failed)",
            id, report.delivered, report.failed
        );
        registry.roster_for(&id)
    };

    // Clients frame by scanning for braces within a single read, so roster
    // entries must not arrive back to back.
    for (index, notice) in roster.iter().enumerate() {
        if index > 0 {
            sleep(config.roster_pacing).await;
        }
        match notice.encode() {
            Ok(bytes) => match outbound.try_send(config.framing.seal(bytes)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Dropped roster entry {} for player {}: queue full", notice.id, id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Player {} left during roster sync", id);
                    break;
                }
            },
            Err(e) => warn!("Failed to encode roster entry {}: {}", notice.id, e),
        }
    }

    Ok((id, reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:8000");
        assert_eq!(config.max_players, 20);
        assert_eq!(config.roster_pacing, Duration::from_millis(100));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.probe_timeout, None);
        assert_eq!(config.framing, Framing::Brace);
    }

    #[test]
    fn test_http_probe_detection() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(looks_like_http(b"HEAD /health HTTP/1.1\r\n"));
        assert!(!looks_like_http(b"alice"));
        assert!(!looks_like_http(b"GET"));
        assert!(!looks_like_http(b""));
    }

    #[tokio::test]
    async fn test_exchange_identity() {
        let mock = Builder::new().write(b"7").read(b"alice").build();
        let (mut reader, mut writer) = tokio::io::split(mock);

        let username = exchange_identity(&mut reader, &mut writer, "7").await.unwrap();
        assert_eq!(username, "alice");
    }

    #[tokio::test]
    async fn test_exchange_identity_closed_before_username() {
        let mock = Builder::new().write(b"3").build();
        let (mut reader, mut writer) = tokio::io::split(mock);

        let result = exchange_identity(&mut reader, &mut writer, "3").await;
        assert!(matches!(result, Err(RelayError::HandshakeClosed)));
    }

    #[tokio::test]
    async fn test_exchange_identity_read_error() {
        let mock = Builder::new()
            .write(b"12")
            .read_error(std::io::Error::new(ErrorKind::ConnectionReset, "reset"))
            .build();
        let (mut reader, mut writer) = tokio::io::split(mock);

        let result = exchange_identity(&mut reader, &mut writer, "12").await;
        assert!(matches!(result, Err(RelayError::Io(_))));
    }

    #[tokio::test]
    async fn test_failed_handshake_releases_identifier() {
        let registry = SessionRegistry::shared(1);
        let config = ServerConfig {
            max_players: 1,
            ..ServerConfig::default()
        };
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let (client, server_side) = tokio::io::duplex(MSG_SIZE);
        let (reader, writer) = tokio::io::split(server_side);
        drop(client);

        let result = admit(reader, writer, addr, &registry, &config).await;
        assert!(result.is_err());

        let mut registry = registry.write().await;
        assert!(registry.is_empty());
        assert_eq!(registry.reserved_count(), 0);
        assert_eq!(registry.allocate_id().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_silent_client_releases_identifier() {
        let registry = SessionRegistry::shared(1);
        let config = ServerConfig {
            max_players: 1,
            handshake_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        // The client stays connected but never sends a username.
        let (mut client, server_side) = tokio::io::duplex(MSG_SIZE);
        let (reader, writer) = tokio::io::split(server_side);

        let result = admit(reader, writer, addr, &registry, &config).await;
        assert!(matches!(result, Err(RelayError::HandshakeTimeout)));

        let mut id = [0u8; 8];
        let len = client.read(&mut id).await.unwrap();
        assert_eq!(&id[..len], b"1");

        let mut registry = registry.write().await;
        assert!(registry.is_empty());
        assert_eq!(registry.reserved_count(), 0);
        assert_eq!(registry.allocate_id().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_admit_registers_and_syncs_roster() {
        let registry = SessionRegistry::shared(4);
        let config = ServerConfig {
            roster_pacing: Duration::from_millis(1),
            ..ServerConfig::default()
        };
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let (existing_tx, mut existing_rx) =
            tokio::sync::mpsc::channel(crate::client_manager::OUTBOUND_QUEUE);
        {
            let mut registry = registry.write().await;
            let id = registry.allocate_id().unwrap();
            registry.register(PlayerRecord::new(id, addr, "old".to_string(), existing_tx));
        }

        let (mut client, server_side) = tokio::io::duplex(MSG_SIZE);
        let (reader, writer) = tokio::io::split(server_side);

        let handshake = tokio::spawn({
            let registry = registry.clone();
            async move {
                admit(reader, writer, addr, &registry, &config)
                    .await
                    .map(|(id, _reader)| id)
            }
        });

        let mut id = [0u8; 8];
        let len = client.read(&mut id).await.unwrap();
        let id = String::from_utf8(id[..len].to_vec()).unwrap();
        client.write_all(b"newcomer").await.unwrap();

        assert_eq!(handshake.await.unwrap().unwrap(), id);
        assert_eq!(
            registry.read().await.get(&id).unwrap().username,
            "newcomer"
        );

        let arrival: shared::PlayerNotice =
            serde_json::from_slice(&existing_rx.recv().await.unwrap()).unwrap();
        assert_eq!(arrival.id, id);
        assert_eq!(arrival.username.as_deref(), Some("newcomer"));
        assert!(arrival.joined);

        let mut roster = [0u8; MSG_SIZE];
        let len = client.read(&mut roster).await.unwrap();
        let entry: shared::PlayerNotice = serde_json::from_slice(&roster[..len]).unwrap();
        assert_eq!(entry.username.as_deref(), Some("old"));
        assert_eq!(entry.position, Some(serde_json::json!([0, 1, 0])));
        assert_eq!(entry.health, Some(serde_json::json!(100)));
    }
}

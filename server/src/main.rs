use clap::Parser;
use log::{error, info};
use server::network::{Server, ServerConfig};
use shared::{Framing, DEFAULT_ADDR, DEFAULT_PORT, MAX_PLAYERS};
use std::time::Duration;

/// Parses command-line arguments and runs the relay until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = DEFAULT_ADDR)]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Maximum number of concurrently connected players
        #[clap(short, long, default_value_t = MAX_PLAYERS)]
        max_players: usize,
        /// Delay between roster messages sent to a joining player
        #[clap(long, default_value = "100")]
        roster_pacing_ms: u64,
        /// Seconds a new connection gets to send its username
        #[clap(long, default_value = "5")]
        handshake_timeout_secs: u64,
        /// Disconnect players that send nothing for this long
        #[clap(long)]
        idle_timeout_secs: Option<u64>,
        /// Drop plain HTTP health probes, waiting this long for their request
        #[clap(long)]
        probe_timeout_ms: Option<u64>,
        /// Message framing: "brace" (legacy) or "newline"
        #[clap(long, default_value = "brace")]
        framing: Framing,
        /// Extra bind attempts while the port is in use
        #[clap(long, default_value = "0")]
        bind_retries: u32,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        max_players: args.max_players,
        roster_pacing: Duration::from_millis(args.roster_pacing_ms),
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
        idle_timeout: args.idle_timeout_secs.map(Duration::from_secs),
        probe_timeout: args.probe_timeout_ms.map(Duration::from_millis),
        framing: args.framing,
        bind_retries: args.bind_retries,
    };

    info!("Launching relay server on {}", config.address());
    let server = Server::bind(config).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}

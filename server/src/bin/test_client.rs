use clap::Parser;
use log::{info, warn};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Scripted client for poking at a running relay server")]
struct Args {
    /// Server address to connect to
    #[clap(short = 's', long, default_value = "127.0.0.1:8000")]
    server: String,

    /// Username sent during the handshake
    #[clap(short = 'u', long, default_value = "tester")]
    username: String,

    /// Number of position updates to send
    #[clap(short = 'n', long, default_value = "10")]
    updates: u32,

    /// Delay between updates in milliseconds
    #[clap(short = 'i', long, default_value = "500")]
    interval_ms: u64,

    /// Terminate updates with a newline, for servers run with `--framing newline`
    #[clap(long)]
    newline: bool,
}

/// Splits whatever JSON objects are complete in `buffer`, leaving the rest.
fn drain_messages(buffer: &mut Vec<u8>) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut consumed = 0;

    let mut stream = serde_json::Deserializer::from_slice(&buffer[..]).into_iter::<Value>();
    loop {
        match stream.next() {
            Some(Ok(value)) => {
                consumed = stream.byte_offset();
                messages.push(value);
            }
            Some(Err(e)) if e.is_eof() => break,
            Some(Err(e)) => {
                warn!("Discarding unreadable data: {}", e);
                consumed = buffer.len();
                break;
            }
            None => break,
        }
    }

    buffer.drain(..consumed);
    messages
}

/// Joins the relay, logs what other players do and sends a short scripted
/// walk of position updates.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let stream = TcpStream::connect(&args.server).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    info!("Connected to {}", args.server);

    let mut buf = [0u8; 2048];
    let len = reader.read(&mut buf).await?;
    if len == 0 {
        warn!("Server closed the connection (full?)");
        return Ok(());
    }
    let id = String::from_utf8_lossy(&buf[..len]).into_owned();
    info!("Assigned ID {}", id);

    writer.write_all(args.username.as_bytes()).await?;

    let listener = tokio::spawn(async move {
        let mut pending = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    info!("Server closed the connection");
                    break;
                }
                Ok(len) => {
                    pending.extend_from_slice(&buf[..len]);
                    for message in drain_messages(&mut pending) {
                        match (message.get("joined"), message.get("left")) {
                            (Some(Value::Bool(true)), _) => info!(
                                "Player {} ({}) joined",
                                message["id"], message["username"]
                            ),
                            (_, Some(Value::Bool(true))) => {
                                info!("Player {} left", message["id"])
                            }
                            _ => info!("Update: {}", message),
                        }
                    }
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    break;
                }
            }
        }
    });

    // Let the roster arrive before the first update
    sleep(Duration::from_millis(args.interval_ms)).await;

    for step in 0..args.updates {
        let angle = step as f64 / 5.0;
        let update = json!({
            "object": "player",
            "position": [angle.sin() * 10.0, 1.0, angle.cos() * 10.0],
            "rotation": angle,
            "health": 100
        });

        let mut payload = update.to_string().into_bytes();
        if args.newline {
            payload.push(b'\n');
        }
        writer.write_all(&payload).await?;
        info!("Sent update {}", step + 1);
        sleep(Duration::from_millis(args.interval_ms)).await;
    }

    writer.shutdown().await?;
    listener.await?;
    info!("Test client finished");

    Ok(())
}

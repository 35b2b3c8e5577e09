use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use fleet_gateway::config::load_config;
use fleet_gateway::net::listener::{find_available_port, is_port_in_use};
use fleet_gateway::protocol::{command, BinaryCodec, Codec, FrameReader, Payload, ReadEvent};

#[derive(Parser)]
#[command(name = "fleet-cli")]
#[command(about = "Operator CLI for the fleet gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the first free port in the inclusive range --start..=--max
    FindPort {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value_t = 8001)]
        start: u16,
        #[arg(long, default_value_t = 8100)]
        max: u16,
    },
    /// Check whether a port is already bound
    PortInUse {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long)]
        port: u16,
    },
    /// Load and validate a config file
    CheckConfig { path: PathBuf },
    /// Connect as a device, send HELLO and wait for the acknowledgement
    Hello {
        #[arg(long, default_value = "127.0.0.1:8001")]
        addr: String,
        #[arg(long, default_value = "TRUCK_1")]
        device: String,
        #[arg(long, default_value = "SERVER")]
        server_id: String,
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::FindPort { host, start, max } => match find_available_port(&host, start, max) {
            Some(port) => println!("{}", port),
            None => {
                eprintln!("No free port in {}..={}", start, max);
                std::process::exit(1);
            }
        },
        Commands::PortInUse { host, port } => {
            let in_use = is_port_in_use(&host, port);
            println!("{}", serde_json::json!({ "host": host, "port": port, "in_use": in_use }));
            if in_use {
                std::process::exit(1);
            }
        }
        Commands::CheckConfig { path } => match load_config(&path) {
            Ok(config) => println!("{}", serde_json::to_string_pretty(&config)?),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Hello {
            addr,
            device,
            server_id,
            timeout_secs,
        } => say_hello(&addr, &device, &server_id, Duration::from_secs(timeout_secs)).await?,
    }

    Ok(())
}

async fn say_hello(
    addr: &str,
    device: &str,
    server_id: &str,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let codec = BinaryCodec::new(server_id);
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(reader, wait);

    let hello = codec.encode(device, server_id, command::HELLO, &Payload::new())?;
    let started = Instant::now();
    writer.write_all(&hello).await?;

    match frames.next_event().await? {
        ReadEvent::Frame(frame) => {
            let message = codec.decode(&frame.to_bytes())?;
            let rtt_ms = started.elapsed().as_secs_f64() * 1000.0;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "addr": addr,
                    "device": device,
                    "reply": message,
                    "rtt_ms": rtt_ms,
                }))?
            );
            if message.command != command::HEARTBEAT_ACK {
                eprintln!("Unexpected reply: {}", message.command);
                std::process::exit(1);
            }
        }
        ReadEvent::Idle => {
            eprintln!("No reply within {:?}", wait);
            std::process::exit(1);
        }
        ReadEvent::Closed => {
            eprintln!("Gateway closed the connection");
            std::process::exit(1);
        }
    }

    Ok(())
}

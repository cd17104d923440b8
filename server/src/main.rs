use std::time::Duration;

use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Newline-framed TCP relay port
    #[clap(short, long, default_value = "9121")]
    port: u16,

    /// WebSocket relay port
    #[clap(short = 'w', long, default_value = "9122")]
    ws_port: u16,

    /// Auxiliary echo port
    #[clap(short = 'e', long, default_value = "9120")]
    echo_port: u16,

    /// Milliseconds of silence before a client is dropped
    #[clap(long, default_value = "30000")]
    idle_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        tcp_port: args.port,
        ws_port: args.ws_port,
        echo_port: args.echo_port,
        idle_timeout: Duration::from_millis(args.idle_timeout_ms),
    };

    let relay = Server::bind(&config).await?;
    info!(
        "relay listening on TCP {}, WebSocket {}, echo {}",
        relay.tcp_addr(),
        relay.ws_addr(),
        relay.echo_addr()
    );
    relay.run().await;

    Ok(())
}

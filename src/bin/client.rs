//! ready-echo test client: connect, send one message, then idle.

use clap::Parser;
use ready_echo::client::Client;
use ready_echo::config::ClientArgs;
use std::io::BufRead;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let addr = args.addr()?;
    let mut client = Client::connect(addr, CONNECT_TIMEOUT)?;
    client.send(args.message.as_bytes())?;
    info!(
        server = %client.peer_addr(),
        bytes = args.message.len(),
        "Message sent; press Enter or close stdin to exit"
    );

    // Keep the connection open until the operator is done
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

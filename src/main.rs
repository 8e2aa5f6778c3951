//! ready-echo server binary.

use ready_echo::config::Config;
use ready_echo::handler::ConsoleHandler;
use ready_echo::runtime::Dispatcher;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        buffer_size = config.buffer_size,
        poll_timeout = ?config.poll_timeout,
        "Starting ready-echo server"
    );

    let dispatcher = match Dispatcher::bind(&config, ConsoleHandler::default()) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return Err(e.into());
        }
    };

    // Signals only set the flag; the loop notices it after the current wait
    let shutdown = dispatcher.shutdown_handle();
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, shutdown.flag())?;
    }

    match dispatcher.run() {
        Ok(handler) => {
            info!(messages = handler.messages(), "Server stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            Err(e.into())
        }
    }
}

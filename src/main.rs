use heartbeat_relay::{Config, Server};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config)?;

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        framing = ?config.framing,
        read_queue = config.read_queue_size,
        write_queue = config.write_queue_size,
        default_heartbeat_interval = ?config.default_heartbeat_interval,
        heartbeat_multiplier = config.heartbeat_multiplier,
        "Starting heartbeat-relay server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async move {
        let server = Server::new(config, info_span!("server"));

        let shutdown = server.shutdown_token();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
            }
        });

        server.run().await
    });

    if let Err(e) = &result {
        error!(error = %e, "Server failed");
    }
    info!("Server shut down");

    result?;
    Ok(())
}

fn init_logging(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
    }

    Ok(())
}

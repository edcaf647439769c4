use clap::Parser;
use harbor::{
    config::{Command, Role},
    network, Args, Daemon, DhcpEngine, DhcpRelay, DhcpServer, HarborError, RelayConfig,
    ServerConfig,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), HarborError> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Server { config } => {
            let config = ServerConfig::load(&config)?;
            let interfaces = network::local_interfaces()?;
            serve(DhcpServer::new(&config, &interfaces)?, &interfaces).await
        }
        Command::Relay { config } => {
            let config = RelayConfig::load(&config)?;
            let interfaces = network::local_interfaces()?;
            let relay = DhcpRelay::from_config(&config, &interfaces)?;
            tracing::info!("Forwarding client traffic to {}", relay.server());
            serve(relay, &interfaces).await
        }
        Command::ShowConfig { role, config } => {
            let rendered = match role {
                Role::Server => serde_json::to_string_pretty(&ServerConfig::load(&config)?)?,
                Role::Relay => serde_json::to_string_pretty(&RelayConfig::load(&config)?)?,
            };
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn serve<E: DhcpEngine>(
    engine: E,
    interfaces: &[network::LocalInterface],
) -> Result<(), HarborError> {
    let role = engine.role();
    let mut daemon = Daemon::new(engine, interfaces)?;

    tokio::select! {
        result = daemon.run() => {
            if let Err(e) = &result {
                tracing::error!("{role} stopped: {e}");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down {role}");
        }
    }

    daemon.stop();
    Ok(())
}

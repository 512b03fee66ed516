use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use replica_coordinator::{
    cli::{Cli, Command},
    client,
    coordinator::Coordinator,
    frontend, replica_server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(args) => {
            let config = args.into_config()?;
            let coordinator = Coordinator::bind(config).await?;
            let addr = coordinator.local_addr()?;
            info!("coordinator listening on {}", addr);
            if let Err(err) = coordinator.run_until_ctrl_c().await {
                warn!("coordinator exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Replica(args) => replica_server::run(args).await?,
        Command::Send(args) => client::run(args).await?,
        Command::Frontend(args) => frontend::run(args).await?,
    }

    Ok(())
}

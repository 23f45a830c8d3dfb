mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check => commands::check::run().await,
        Commands::Agent(args) => commands::agent::run(args).await,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate(),
            CrdAction::Install => commands::crd::install().await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        if e.downcast_ref::<commands::agent::InvalidConfig>().is_some() {
            std::process::exit(255);
        }
        std::process::exit(1);
    }
}

mod cli;
mod client;

use clap::Parser;
use cli::{Cli, Command};
use resource_policy::config::ManagerConfig;
use resource_policy::manager;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Manager { deny } => {
            if let Err(e) = manager::run(ManagerConfig::with_deny(deny)).await {
                tracing::error!(error = %e, "manager failed");
                eprintln!("respolicyd manager: {e}");
                std::process::exit(1);
            }
        }
        Command::Acquire(args) => {
            if let Err(e) = client::run(args).await {
                tracing::error!(error = %e, "acquire failed");
                eprintln!("respolicyd acquire: {e}");
                std::process::exit(1);
            }
        }
    }
}

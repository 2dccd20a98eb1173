use clap::Parser;
use tracing_subscriber::EnvFilter;

use mcpvm::backend;
use mcpvm::cli::{Cli, Command};
use mcpvm::orchestrator::{self, SetupRequest};

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcpvm=info")),
        )
        .init();

    let cli = Cli::parse();
    let backend = backend::create_backend()?;

    match cli.command {
        Command::Setup {
            version,
            playbook,
            name,
        } => {
            orchestrator::setup(
                &backend,
                SetupRequest {
                    version,
                    name,
                    playbook,
                },
            )
            .await?
        }
        Command::List { name_only } => orchestrator::list(&backend, name_only).await?,
        Command::Start { name } => orchestrator::start(&backend, &name).await?,
        Command::Stop { name } => orchestrator::stop(&backend, &name).await?,
        Command::Delete { name } => orchestrator::delete(&backend, &name).await?,
    }

    Ok(())
}

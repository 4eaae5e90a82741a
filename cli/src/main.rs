use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Commands};
use modelgate_core::config::{read_config, resolve_config_path};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&configured_level(&cli))?;

    match cli.command {
        Commands::Start { port } => {
            cli::commands::start::run(cli.config, port).await?;
        }
        Commands::Status => {
            cli::commands::status::run(cli.config).await?;
        }
        Commands::GenerateKey => {
            cli::commands::generate_key::run(cli.config).await?;
        }
        Commands::Models { protocol } => {
            cli::commands::models::run(protocol)?;
        }
        Commands::Resolve { protocol, model } => {
            cli::commands::mapping::resolve(cli.config, &protocol, &model).await?;
        }
        Commands::Mapping { command } => {
            cli::commands::mapping::run(cli.config, command).await?;
        }
    }

    Ok(())
}

/// `[logging] level` from the config file, if there is one yet.
fn configured_level(cli: &Cli) -> String {
    let path = resolve_config_path(cli.config.clone());
    read_config(&path)
        .map(|config| config.logging.level)
        .unwrap_or_else(|_| "info".to_string())
}

/// RUST_LOG wins; otherwise our crates log at `level`.
fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("modelgate={}", level).parse()?)
            .add_directive(format!("modelgate_core={}", level).parse()?)
            .add_directive("tower_http=debug".parse()?),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

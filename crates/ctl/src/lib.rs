pub mod args;
pub mod artifact;
pub mod bus;
pub mod commands;
pub mod executor;
pub mod plan;
pub mod view;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub use args::{Cli, Commands, GlobalArgs};

pub async fn run() -> anyhow::Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    run_parsed(cli).await
}

pub async fn run_parsed(cli: Cli) -> anyhow::Result<ExitCode> {
    let globals = cli.globals;

    match cli.command {
        Commands::Ping { agent_id } => commands::ping::handle(&globals, &agent_id).await,
        Commands::Discover { agent_id } => commands::discover::handle(&globals, &agent_id).await,
        Commands::Update {
            agent_id,
            binary_url,
        } => commands::update::handle(&globals, &agent_id, &binary_url).await,
        Commands::Status { config } => commands::status::handle(&config),
        Commands::Run { config, env } => commands::run::handle(&globals, &config, &env).await,
        Commands::Preflight { config, env } => {
            commands::preflight::handle(&globals, &config, &env).await
        }
        Commands::Adhoc {
            config,
            target,
            action,
            args,
        } => commands::adhoc::handle(&globals, config.as_deref(), &target, &action, &args).await,
    }
}

mod args;
mod commands;
mod utils;

use clap::Parser;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    utils::tracing::init_tracing()?;

    let config = bosun_core::config::load_config()?;

    match cli.command {
        Commands::Serve => commands::serve::run(config).await,
        Commands::Eval {
            experiment,
            session_cookie,
        } => commands::eval::run(config, experiment, session_cookie).await,
        Commands::Version => {
            println!("bosun {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

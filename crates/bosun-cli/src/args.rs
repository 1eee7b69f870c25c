use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Backend for the interactive cloud-assistant notebook UI.
#[derive(Parser)]
#[command(name = "bosun", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the websocket multiplexer and the Generate gRPC server
    Serve,

    /// Replay an experiment against a serving endpoint and write a
    /// markdown report
    Eval {
        /// Path to the experiment YAML
        experiment: PathBuf,

        /// Session cookie attached verbatim to every inference call
        #[arg(long)]
        session_cookie: Option<String>,
    },

    /// Print version information
    Version,
}

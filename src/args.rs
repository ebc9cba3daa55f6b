use clap::{Parser, Subcommand};
use launcher::completions::CompletionShell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "launcher")]
#[command(version)]
#[command(about = "Start, stop and inspect local services", long_about = None)]
pub(crate) struct Cli {
    /// Daemon socket path. Can also be set via LAUNCHER_SOCKET env var.
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Config file path. Can also be set via LAUNCHER_CONFIG env var.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the supervisor daemon in the foreground
    Daemon,

    /// List discovered services
    #[command(name = "listservices", visible_alias = "ls")]
    ListServices {
        /// Only show running services
        #[arg(long)]
        running: bool,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a service, or "all"
    #[command(name = "startservice")]
    StartService {
        /// Service name or "all"
        name: String,
    },

    /// Stop a service, or "all"
    #[command(name = "stopservice")]
    StopService {
        /// Service name or "all"
        name: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

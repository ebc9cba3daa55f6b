mod args;
mod cmd_completions;
mod cmd_daemon;
mod cmd_services;
mod init;

use args::{Cli, Commands};
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init::initialize_tracing();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon => cmd_daemon::cmd_daemon(cli.socket, cli.config).await,
        Commands::ListServices { running, json } => {
            cmd_services::cmd_list_services(cli.socket, running, json).await
        }
        Commands::StartService { name } => cmd_services::cmd_start_service(cli.socket, &name).await,
        Commands::StopService { name } => cmd_services::cmd_stop_service(cli.socket, &name).await,
        Commands::Completions { shell } => {
            cmd_completions::cmd_completions(shell);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

use clap::{Parser, Subcommand};
use conveyor::config::resolve_config_path;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Pulls security events from vendor APIs and forwards them to an intake", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a starter config
    Init {
        #[arg(long)]
        stdout: bool,
    },
    /// Load and validate the config without starting anything
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    conveyor::telemetry::init_logging();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => match conveyor::cli::run::run(config_path).await {
            Ok(exit) => ExitCode::from(exit.exit_code() as u8),
            Err(e) => {
                error!(error = %e, "Conveyor failed to start");
                ExitCode::FAILURE
            }
        },
        Some(Commands::Config { action }) => {
            let result = match action {
                ConfigAction::Init { stdout } => conveyor::cli::config::init(stdout),
                ConfigAction::Check => conveyor::cli::config::check(config_path),
            };
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

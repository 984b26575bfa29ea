mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tidemark_core::{init_logging, LogFormat, LoggingConfig, TOOL_NAME, VERSION};
use tidemark_migrate::CancellationToken;
use tracing::{error, warn};

use commands::migrate;

#[derive(Parser, Debug)]
#[command(name = TOOL_NAME)]
#[command(version = VERSION)]
#[command(about = "Apply, roll back and inspect file-defined SQL migrations")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "TIDEMARK_CONFIG", default_value = "./config/config.toml")]
    config_path: PathBuf,

    /// Log output format, overriding the config file
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Apply all pending migrations (default)
    Migrate,

    /// Revert the most recently applied migration
    Rollback,

    /// List applied, pending and orphaned migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{:#}", err), "{} failed", TOOL_NAME);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = migrate::load_config(&cli.config_path)?;

    let mut logging = LoggingConfig::from_section(&config.logging);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    init_logging(logging).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            trigger.cancel();
        }
    });

    match cli.command.unwrap_or(Commands::Migrate) {
        Commands::Migrate => migrate::run(&config, &cancel).await,
        Commands::Rollback => migrate::rollback(&config, &cancel).await,
        Commands::Status { json } => migrate::status(&config, json, &cancel).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_command_defaults_to_migrate() {
        let cli = Cli::try_parse_from(["tidemark", "--config-path", "/etc/tidemark.toml"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.config_path, PathBuf::from("/etc/tidemark.toml"));
        assert_eq!(cli.command.unwrap_or(Commands::Migrate), Commands::Migrate);
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["tidemark", "rollback"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Rollback));

        let cli = Cli::try_parse_from(["tidemark", "status", "--json"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Status { json: true }));
    }

    #[test]
    fn test_log_format_flag() {
        let cli = Cli::try_parse_from(["tidemark", "--log-format", "text", "migrate"]).unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Text));

        assert!(Cli::try_parse_from(["tidemark", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["tidemark", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(VERSION));
        assert_eq!(Cli::command().get_name(), TOOL_NAME);
    }

    #[test]
    fn test_rollback_takes_no_step_count() {
        assert!(Cli::try_parse_from(["tidemark", "rollback", "3"]).is_err());
    }
}

mod commands;

use std::net::IpAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI Types
// ============================================================================

/// Switchboard - a multi-transport chat-to-agent gateway
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway daemon
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "switchboard.yaml")]
        config: String,

        /// Bind host (overrides config file)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Bind port (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Validate the configuration and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(short, long, default_value = "switchboard.yaml")]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => {
            match commands::serve::run(&config, host, port).await {
                Ok(code) => ExitCode::from(code as u8),
                Err(e) => {
                    error!(error = %e, "Startup failed");
                    ExitCode::from(1)
                }
            }
        }
        Commands::CheckConfig { config } => {
            match switchboard::config::Config::load(&config).await {
                Ok(cfg) => {
                    cfg.log_warnings();
                    println!("{config}: ok");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Config invalid");
                    ExitCode::from(1)
                }
            }
        }
    }
}

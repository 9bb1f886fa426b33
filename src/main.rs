use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logship")]
#[command(about = "Ship log files and streams to a message broker", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail configured files (and a watched directory) into the broker
    Ship,
    /// Ingest UDP datagrams and TCP streams into the broker
    Stream,
    /// Re-deliver broker messages to downstream TCP consumers
    Forward,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logship=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let Some(config_path) = resolve_config_path(cli.config) else {
        eprintln!("Error: config not found");
        eprintln!("Searched locations:");
        eprintln!("  ~/.config/logship/config.yml");
        eprintln!("  /etc/logship/config.yml");
        eprintln!("\nUse --config <path> to specify a config file.");
        std::process::exit(1);
    };

    match cli.command {
        Commands::Ship => logship::cli::run::ship(&config_path).await?,
        Commands::Stream => logship::cli::run::stream(&config_path).await?,
        Commands::Forward => logship::cli::run::forward(&config_path).await?,
    }

    Ok(())
}

fn resolve_config_path(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/logship/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/logship/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use plugin_settings::config::Config;
use plugin_settings::settings::Level;

mod cli;

#[derive(Parser)]
#[command(name = "plugin-settings")]
#[command(about = "Inspect and edit per-plugin settings", long_about = None)]
struct Cli {
    /// Path to config.json (defaults to ~/.plugin-settings/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a setting value (null when unset)
    Get {
        plugin: String,
        key: String,
        #[arg(short, long, default_value = "user")]
        level: Level,
    },
    /// Write a setting value (parsed as JSON, else stored as a string)
    Set {
        plugin: String,
        key: String,
        value: String,
        #[arg(short, long, default_value = "user")]
        level: Level,
    },
    /// Remove a setting value
    Remove {
        plugin: String,
        key: String,
        #[arg(short, long, default_value = "user")]
        level: Level,
    },
    /// Print all stored settings for a plugin
    Show { plugin: String },
    /// List plugins with stored settings
    List,
    /// Replace a plugin's settings from a JSON record file
    Upload { file: PathBuf },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let command = match cli.command {
        Some(Commands::Version) | None => {
            println!("plugin-settings {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(command) => command,
    };

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .with_context(|| "Failed to load configuration")?;
    let open = cli::open_registry(&config)?;

    match command {
        Commands::Get { plugin, key, level } => cli::cmd_get(&open, &plugin, &key, level).await,
        Commands::Set {
            plugin,
            key,
            value,
            level,
        } => cli::cmd_set(&open, &plugin, &key, &value, level).await,
        Commands::Remove { plugin, key, level } => {
            cli::cmd_remove(&open, &plugin, &key, level).await
        }
        Commands::Show { plugin } => cli::cmd_show(&open, &plugin).await,
        Commands::List => cli::cmd_list(&open).await,
        Commands::Upload { file } => cli::cmd_upload(&open, &file).await,
        Commands::Version => Ok(()),
    }
}

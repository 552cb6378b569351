mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "seed-alchemy")]
#[command(author, version, about = "Run Stable Diffusion locally", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/seed-alchemy/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon server
    Serve {
        /// Address to bind (default: daemon.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default: daemon.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate images in-process and print the saved paths
    Generate(commands::generate::GenerateArgs),

    /// List registered models
    #[command(alias = "ls")]
    Models,

    /// List scheduler ids
    Schedulers,

    /// View or set configuration
    Config {
        /// Config key (e.g., "daemon.port", "storage.users")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Must be set before any model code reads them
    std::env::set_var("HF_HUB_DISABLE_TELEMETRY", "1");
    std::env::set_var("PYTORCH_ENABLE_MPS_FALLBACK", "1");

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("SEED_ALCHEMY_CONFIG", path);
    }

    match cli.command {
        Commands::Serve { host, port } => {
            commands::serve::execute(host.as_deref(), port).await?;
        }
        Commands::Generate(args) => {
            commands::generate::execute(args).await?;
        }
        Commands::Models => {
            commands::models::execute().await?;
        }
        Commands::Schedulers => {
            commands::models::schedulers().await?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref()).await?;
        }
    }

    Ok(())
}

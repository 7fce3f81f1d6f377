use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mari::cli;
use mari::config::Config;

#[derive(Parser)]
#[command(name = "mari")]
#[command(about = "Persona chat companion that writes letters overnight")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the batch scheduler until Ctrl-C
    Run,
    /// Generate every letter that is due right now
    Batch,
    /// Request a letter for a user
    Request {
        #[arg(long)]
        user: String,
        #[arg(long)]
        theme: String,
        /// Hour of night to write it, one of BATCH_SCHEDULE_HOURS
        #[arg(long)]
        hour: u32,
        /// Defaults to LETTER_MIN_AFFINITY
        #[arg(long)]
        affinity: Option<u8>,
    },
    /// List a user's letters, newest first
    Letters {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print a letter, marking it delivered
    Read { id: String },
    /// Talk with Mari in the terminal
    Chat {
        #[arg(long)]
        user: Option<String>,
    },
    /// Show the effective configuration
    Config,
}

fn log_filter(config: &Config) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match config.log_level.as_deref().map(str::to_uppercase).as_deref() {
        Some("DEBUG") => "debug",
        Some("INFO") => "info",
        Some("WARNING") | Some("WARN") => "warn",
        Some("ERROR") | Some("CRITICAL") => "error",
        _ if config.debug_mode => "debug",
        _ => "info",
    };
    EnvFilter::new(level)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&config))
        .with_writer(std::io::stderr)
        .init();

    if !matches!(args.command, Commands::Config) {
        config.validate().context("Invalid configuration, see `mari config`")?;
    }

    match args.command {
        Commands::Run => cli::handle_run(&config).await,
        Commands::Batch => cli::handle_batch(&config).await,
        Commands::Request { user, theme, hour, affinity } => cli::handle_request(&config, &user, &theme, hour, affinity),
        Commands::Letters { user, limit } => cli::handle_letters(&config, &user, limit),
        Commands::Read { id } => cli::handle_read(&config, &id),
        Commands::Chat { user } => cli::handle_chat(&config, user).await,
        Commands::Config => cli::handle_config(&config),
    }
}

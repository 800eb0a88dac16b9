use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod core;
mod cost;
mod daemon;
mod sources;

use crate::core::settings::Settings;

#[derive(Parser)]
#[command(name = "cost-meter")]
#[command(author, version, about = "Exports cloud billing data as Prometheus metrics")]
struct Cli {
    /// Path to the config file
    #[arg(long, short, global = true, env = "COST_METER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the exporter
    Serve,

    /// Validate the config and print the resolved schedule
    Check {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Poll every query once and print the metrics
    Query,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so `query` and `check` output stays pipeable.
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Serve => {
            init_logging(cli.log_format);
            let settings = Settings::load(config)?;
            daemon::run(settings).await
        }
        Commands::Check { json } => {
            init_logging(cli.log_format);
            cli::check::run(config, json)
        }
        Commands::Query => {
            init_logging(cli.log_format);
            cli::query::run(config).await
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}

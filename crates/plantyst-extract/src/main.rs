//! Plantyst extractor: entry point.

use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use plantyst_extract::{resolve_data_dir, Extractor, ExtractorConfig};

#[derive(Parser)]
#[command(
    name = "plantyst-extract",
    about = "Pull Plantyst measurement series into CSV tables",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the configured window and write CSV tables (default).
    Run {
        /// Data directory holding config.json.
        /// Also reads from PLANTYST_DATA_DIR env var.
        data_dir: Option<PathBuf>,
    },

    /// Parse config.json and print the resolved parameters.
    Validate {
        /// Data directory holding config.json.
        data_dir: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   plantyst-extract completions bash > ~/.local/share/bash-completion/completions/plantyst-extract
    ///   plantyst-extract completions zsh > ~/.zfunc/_plantyst-extract
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

async fn run(data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let config = ExtractorConfig::load(data_dir)?;
    let summary = Extractor::new(config).run(data_dir).await?;

    match &summary.table {
        Some(table) => println!("Wrote {} rows to {}", summary.rows, table.display()),
        None => println!("No data in {}", summary.window),
    }
    println!("Data has been read successfully!");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run { data_dir: None }) {
        Commands::Run { data_dir } => {
            let data_dir = resolve_data_dir(data_dir.as_deref());
            if let Err(e) = run(&data_dir).await {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }

        Commands::Validate { data_dir } => {
            let data_dir = resolve_data_dir(data_dir.as_deref());
            match ExtractorConfig::load(&data_dir) {
                Ok(config) => {
                    println!("Valid configuration in {}", data_dir.display());
                    println!("{}", serde_json::to_string_pretty(&config.redacted())?);
                }
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "plantyst-extract", &mut std::io::stdout());
        }
    }

    Ok(())
}

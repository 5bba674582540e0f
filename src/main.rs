//! # Entropy Search backend (`entropy_search_backend`)
//!
//! Serves the search UI over HTTP and runs searches from the terminal.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `serve` | Start the HTTP backend |
//! | `search` | Run one search and print the hits |
//! | `pack <in> <out.esi>` | Convert a spectral file into the binary library format |
//! | `info <file>` | Print spectrum and charge-partition counts for a file |
//!
//! ## Examples
//!
//! ```bash
//! entropy_search_backend serve --bind 127.0.0.1:8711
//! entropy_search_backend search --query query.mgf --library massbank.msp --cores 4
//! entropy_search_backend --config ./entropy.toml search --query q.mzML --library lib.esi --format json
//! entropy_search_backend pack massbank.msp massbank.esi
//! ```
//!
//! Logs go to stderr; `RUST_LOG` overrides `[logging] level`.

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};
use entropy_search::config::{self, Config};
use entropy_search::progress::ProgressMode;
use entropy_search::search::SearchArgs;
use entropy_search::{info, search, server};
use entropy_search_core::models::parse_charge;
use tracing_subscriber::EnvFilter;

/// Entropy Search: spectral library search for tandem mass spectra.
#[derive(Parser)]
#[command(
    name = "entropy_search_backend",
    about = "Entropy-based spectral library search with a job-polling HTTP backend",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP backend.
    Serve {
        /// Address to bind, overriding `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// Search a query file against a library and print the ranked hits.
    Search {
        /// Query spectra (.msp, .mgf, .mzML, .esi, optionally .gz or .zip).
        #[arg(long)]
        query: PathBuf,

        /// Library spectra.
        #[arg(long)]
        library: PathBuf,

        /// Charge for every query, e.g. `1`, `2+`, `1-`. 0 uses each spectrum's own.
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        charge: String,

        /// Precursor tolerance in Da.
        #[arg(long)]
        ms1: Option<f64>,

        /// Fragment tolerance in Da.
        #[arg(long)]
        ms2: Option<f64>,

        /// Hits kept per query and mode.
        #[arg(long)]
        top_n: Option<usize>,

        /// Minimum score for a hit to be reported.
        #[arg(long)]
        score_min: Option<f64>,

        /// Worker threads.
        #[arg(long)]
        cores: Option<usize>,

        /// Output format: `text` or `json`.
        #[arg(long, default_value = "text")]
        format: String,

        /// Progress on stderr: `off`, `human` or `json`. Defaults to `human` on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Convert a spectral file into the `.esi` binary library format.
    Pack {
        input: PathBuf,
        output: PathBuf,
    },

    /// Load a spectral file and print spectrum and charge counts.
    Info { file: PathBuf },
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_progress(value: Option<&str>) -> anyhow::Result<ProgressMode> {
    match value {
        None => Ok(ProgressMode::default_for_tty()),
        Some("off") => Ok(ProgressMode::Off),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some(other) => bail!("Unknown progress mode: {}. Use off, human, or json.", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    init_logging(&cfg);

    match cli.command {
        Commands::Serve { bind } => {
            let mut cfg = cfg;
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            server::run_server(&cfg).await?;
        }
        Commands::Search {
            query,
            library,
            charge,
            ms1,
            ms2,
            top_n,
            score_min,
            cores,
            format,
            progress,
        } => {
            let json = match format.as_str() {
                "text" => false,
                "json" => true,
                other => bail!("Unknown format: {}. Use text or json.", other),
            };
            let charge = match charge.trim() {
                "" | "0" => 0,
                text => match parse_charge(text) {
                    Some(c) => c,
                    None => bail!("Invalid charge: {}", text),
                },
            };
            let reporter = parse_progress(progress.as_deref())?.reporter();
            let args = SearchArgs {
                query,
                library,
                charge,
                ms1_tolerance: ms1,
                ms2_tolerance: ms2,
                top_n,
                score_min,
                cores,
            };
            // Scoring is CPU-bound and runs on its own rayon pool.
            tokio::task::spawn_blocking(move || {
                search::run_search(&cfg, &args, json, reporter.as_ref())
            })
            .await??;
        }
        Commands::Pack { input, output } => {
            info::run_pack(&cfg, &input, &output)?;
        }
        Commands::Info { file } => {
            info::run_info(&cfg, &file)?;
        }
    }

    Ok(())
}

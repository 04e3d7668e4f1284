//! # ATT&CK Ingest CLI (`attck`)
//!
//! The `attck` binary drives the manifest ingestion pipeline: database
//! initialization, directory and file-list imports, single-manifest
//! checks, ATT&CK reference-table loading, and database statistics.
//!
//! ## Usage
//!
//! ```bash
//! attck --config ./config/attck.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `attck init` | Create the SQLite database and run schema migrations |
//! | `attck import <dir>` | Scan a directory tree, parse manifests, import |
//! | `attck files <path>...` | Import an explicit list of manifest files |
//! | `attck check <path>` | Parse one manifest and print the outcome |
//! | `attck techniques load <json>` | Load ATT&CK reference tables |
//! | `attck stats` | Print database statistics |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! attck init --config ./config/attck.toml
//!
//! # Import everything under a sample tree
//! attck import ./data/files --config ./config/attck.toml
//!
//! # See what an import would do without writing
//! attck import ./data/files --dry-run
//!
//! # Debug a single manifest
//! attck check ./data/files/ab12/loader/manifest.json
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use attck_ingest::{config, ingest, migrate, progress::ProgressMode, stats};

/// ATT&CK Ingest CLI — a concurrent ingestion pipeline for malware
/// manifests with MITRE ATT&CK technique mappings.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/attck.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "attck",
    about = "ATT&CK Ingest — scan, validate, and import malware manifests into SQLite",
    version,
    long_about = "ATT&CK Ingest discovers manifest.json files under a sample tree, validates \
    and normalizes each one (including MITRE ATT&CK technique IDs, with automatic repair of \
    common malformations), and imports the results into SQLite in transactional batches with \
    retry and backoff."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/attck.toml`. Database, scanner, parser, and
    /// importer settings are read from this file.
    #[arg(long, global = true, default_value = "./config/attck.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (functions, attck_mappings, function_children, attack_tactics,
    /// attack_techniques). This command is idempotent — running it
    /// multiple times is safe.
    Init,

    /// Scan a directory tree and import every manifest found.
    ///
    /// Walks the tree with a bounded worker pool, parses each matching
    /// file concurrently, and writes valid records in transactional
    /// batches. Per-file failures are reported and never stop the run.
    Import {
        /// Root directory of the sample tree.
        root: PathBuf,

        /// File pattern: a glob, or a named shorthand (`manifest`,
        /// `json`, `all`).
        #[arg(long, default_value = "manifest")]
        pattern: String,

        /// Scan only the root directory, not its subdirectories.
        #[arg(long)]
        no_recursive: bool,

        /// Maximum directory depth to descend.
        #[arg(long)]
        max_depth: Option<usize>,

        /// Strict mode — reject malformed technique IDs instead of
        /// repairing them.
        #[arg(long)]
        strict: bool,

        /// Dry run — scan and parse, report counts, write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Progress reporting on stderr: `auto`, `off`, `human`, or `json`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Import an explicit list of manifest files, skipping the scan.
    Files {
        /// Manifest file paths.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Strict mode — reject malformed technique IDs instead of
        /// repairing them.
        #[arg(long)]
        strict: bool,

        /// Dry run — parse and report counts, write nothing.
        #[arg(long)]
        dry_run: bool,

        /// Progress reporting on stderr: `auto`, `off`, `human`, or `json`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Parse one manifest and print the outcome without importing.
    ///
    /// Prints the normalized record on success, or the classified errors
    /// on failure. Exits non-zero for an invalid manifest.
    Check {
        /// Path to a manifest.json file.
        path: PathBuf,

        /// Strict mode — reject malformed technique IDs instead of
        /// repairing them.
        #[arg(long)]
        strict: bool,
    },

    /// Manage the ATT&CK reference tables.
    Techniques {
        #[command(subcommand)]
        action: TechniquesAction,
    },

    /// Print database statistics.
    ///
    /// Function, sample, and mapping counts, plus per-status and
    /// top-technique breakdowns.
    Stats,
}

/// Reference-table subcommands.
#[derive(Subcommand)]
enum TechniquesAction {
    /// Load tactics and techniques from a matrix JSON export.
    ///
    /// The file maps tactic IDs to their techniques and sub-techniques.
    /// Loading is additive and idempotent.
    Load {
        /// Path to the matrix JSON file.
        path: PathBuf,
    },
}

fn parse_progress(raw: &str) -> anyhow::Result<ProgressMode> {
    match raw {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => anyhow::bail!("unknown progress mode '{}' (expected auto|off|human|json)", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // `check` works without a config file
    if let Commands::Check { path, strict } = &cli.command {
        let cfg = config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal());
        ingest::run_check(&cfg, path, *strict).await?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import {
            root,
            pattern,
            no_recursive,
            max_depth,
            strict,
            dry_run,
            progress,
        } => {
            let progress = parse_progress(&progress)?;
            ingest::run_import(
                &cfg,
                ingest::ImportArgs {
                    root,
                    pattern,
                    no_recursive,
                    max_depth,
                    strict,
                    dry_run,
                    progress,
                },
            )
            .await?;
        }
        Commands::Files {
            paths,
            strict,
            dry_run,
            progress,
        } => {
            let progress = parse_progress(&progress)?;
            ingest::run_files(&cfg, paths, strict, dry_run, progress).await?;
        }
        Commands::Check { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
        Commands::Techniques { action } => match action {
            TechniquesAction::Load { path } => {
                ingest::run_load_techniques(&cfg, &path).await?;
            }
        },
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

//! Command runners behind the `attck` CLI.
//!
//! Each runner loads what it needs, drives the pipeline, prints a summary
//! on stdout, and maps a failed run to a non-zero exit via `Err`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::db;
use crate::manager::{ImportManager, RunState};
use crate::migrate;
use crate::parser::Parser;
use crate::progress::ProgressMode;
use crate::refdata;
use crate::store::SqliteStore;

pub struct ImportArgs {
    pub root: PathBuf,
    pub pattern: String,
    pub no_recursive: bool,
    pub max_depth: Option<usize>,
    pub strict: bool,
    pub dry_run: bool,
    pub progress: ProgressMode,
}

pub async fn run_import(cfg: &Config, args: ImportArgs) -> Result<()> {
    let manager = build_manager(cfg, args.strict, args.dry_run, args.progress).await?;

    let mut options = manager.scan_options();
    options.pattern = args.pattern;
    options.recursive = !args.no_recursive;
    if args.max_depth.is_some() {
        options.max_depth = args.max_depth;
    }

    let result = manager.run_directory(&args.root, options).await;
    println!("{}", result.summary());

    if result.state == RunState::Failed {
        bail!("import failed: nothing could be scanned under {}", args.root.display());
    }
    Ok(())
}

pub async fn run_files(
    cfg: &Config,
    files: Vec<PathBuf>,
    strict: bool,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<()> {
    let manager = build_manager(cfg, strict, dry_run, progress).await?;
    let result = manager.run_files(files).await;
    println!("{}", result.summary());

    if result.state == RunState::Failed {
        bail!("import failed");
    }
    Ok(())
}

/// Parse a single manifest and print the outcome. Never touches the
/// database; useful for debugging a manifest before a bulk import.
pub async fn run_check(cfg: &Config, path: &Path, strict: bool) -> Result<()> {
    let mut parser_cfg = cfg.parser.clone();
    parser_cfg.strict_mode = parser_cfg.strict_mode || strict;
    let parser = Parser::new(parser_cfg);

    let outcome = parser.parse_file(path).await;
    if outcome.valid {
        let record = outcome.record.as_ref().map(|r| r.alias.as_str()).unwrap_or("?");
        println!("OK  {} ({:.2}s)", record, outcome.elapsed.as_secs_f64());
        if let Some(record) = &outcome.record {
            println!("  hash_id:    {}", record.hash_id);
            println!("  status:     {}", record.status.as_str());
            println!("  techniques: {}", record.attck.join(", "));
            println!("  tries:      {}", record.tries);
            println!("  children:   {}", record.children.len());
        }
    } else {
        let kind = outcome
            .failure
            .map(|k| k.as_str())
            .unwrap_or("unknown");
        println!("INVALID ({}): {}", kind, outcome.error_summary());
    }
    for warning in &outcome.warnings {
        println!("  warning: {}", warning);
    }

    if !outcome.valid {
        bail!("manifest is invalid: {}", path.display());
    }
    Ok(())
}

pub async fn run_load_techniques(cfg: &Config, json_path: &Path) -> Result<()> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;

    let summary = refdata::load_reference_data(&pool, json_path).await?;
    println!(
        "Loaded {} tactics, {} techniques, {} sub-techniques.",
        summary.tactics, summary.techniques, summary.sub_techniques
    );
    pool.close().await;
    Ok(())
}

async fn build_manager(
    cfg: &Config,
    strict: bool,
    dry_run: bool,
    progress: ProgressMode,
) -> Result<ImportManager> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let mut cfg = cfg.clone();
    cfg.parser.strict_mode = cfg.parser.strict_mode || strict;

    let mut manager = ImportManager::new(store, cfg).dry_run(dry_run);
    if let Some(callback) = progress.reporter() {
        manager = manager.with_progress(callback);
    }
    Ok(manager)
}

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub importer: ImporterConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Scanner knobs: directory-exploration worker pool, depth limit, and the
/// global scan timeout.
#[derive(Debug, Deserialize, Clone)]
pub struct ScannerConfig {
    #[serde(default = "default_scan_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_scan_workers(),
            max_depth: None,
            follow_symlinks: false,
            timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_scan_workers() -> usize {
    4
}
fn default_scan_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    /// Strict mode disables technique-ID repair; structural requirements
    /// are identical in both modes.
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_true")]
    pub validate_technique_ids: bool,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            strict_mode: false,
            validate_technique_ids: default_true(),
            max_file_size_bytes: default_max_file_size(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl ParserConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}
fn default_read_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImporterConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ImporterConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

/// Orchestration knobs. The parse worker pool is independent of the
/// scanner's directory workers.
#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    #[serde(default = "default_parse_workers")]
    pub parse_workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            parse_workers: default_parse_workers(),
        }
    }
}

fn default_parse_workers() -> usize {
    10
}

impl Config {
    /// A minimal in-memory-style configuration for tests and one-off tools.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("data/attck.sqlite"),
            },
            scanner: ScannerConfig::default(),
            parser: ParserConfig::default(),
            importer: ImporterConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.scanner.max_workers == 0 {
        anyhow::bail!("scanner.max_workers must be > 0");
    }

    if config.manager.parse_workers == 0 {
        anyhow::bail!("manager.parse_workers must be > 0");
    }

    if config.importer.batch_size == 0 {
        anyhow::bail!("importer.batch_size must be > 0");
    }

    if config.parser.max_file_size_bytes == 0 {
        anyhow::bail!("parser.max_file_size_bytes must be > 0");
    }

    Ok(config)
}

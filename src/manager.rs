//! Pipeline orchestration: scan, parse, import.
//!
//! The manager wires the three stages together, fans parsing out over a
//! bounded worker pool, and reports progress at stage checkpoints. Stage
//! failures are absorbed into the [`ProcessResult`]; a run only ends in
//! [`RunState::Failed`] when the scan itself produced nothing but errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::info;

use crate::config::Config;
use crate::importer::{BatchImporter, ImportResult};
use crate::models::CanonicalRecord;
use crate::parser::Parser;
use crate::progress::{self, ProgressCallback};
use crate::scanner::{ScanOptions, ScanResult, Scanner};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Scanning,
    Parsing,
    Importing,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Scanning => "scanning",
            RunState::Parsing => "parsing",
            RunState::Importing => "importing",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        }
    }
}

/// End-to-end outcome of one pipeline run.
#[derive(Debug)]
pub struct ProcessResult {
    pub state: RunState,
    /// Present for directory runs; absent when an explicit file list was
    /// given.
    pub scan: Option<ScanResult>,
    pub parse_attempted: usize,
    pub parse_valid: usize,
    pub parse_invalid: usize,
    pub parse_errors: Vec<String>,
    pub parse_warnings: Vec<String>,
    /// Absent for dry runs and runs with nothing valid to import.
    pub import: Option<ImportResult>,
    pub elapsed: Duration,
}

impl ProcessResult {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            scan: None,
            parse_attempted: 0,
            parse_valid: 0,
            parse_invalid: 0,
            parse_errors: Vec::new(),
            parse_warnings: Vec::new(),
            import: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn error_count(&self) -> usize {
        let scan_errors = self.scan.as_ref().map(|s| s.errors.len()).unwrap_or(0);
        let import_errors = self.import.as_ref().map(|i| i.errors.len()).unwrap_or(0);
        scan_errors + self.parse_errors.len() + import_errors
    }

    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "run {}: {} files parsed, {} valid, {} invalid in {:.2}s",
            self.state.as_str(),
            self.parse_attempted,
            self.parse_valid,
            self.parse_invalid,
            self.elapsed.as_secs_f64()
        )];
        if let Some(scan) = &self.scan {
            lines.push(format!("scan: {}", scan.summary()));
        }
        match &self.import {
            Some(import) => lines.push(format!("import: {}", import.summary())),
            None => lines.push("import: nothing written".to_string()),
        }

        let mut samples: Vec<&String> = Vec::new();
        if let Some(scan) = &self.scan {
            samples.extend(scan.errors.iter());
        }
        samples.extend(self.parse_errors.iter());
        if let Some(import) = &self.import {
            samples.extend(import.errors.iter());
        }
        if !samples.is_empty() {
            lines.push(format!("errors ({}):", samples.len()));
            for err in samples.iter().take(3) {
                lines.push(format!("  - {}", err));
            }
            if samples.len() > 3 {
                lines.push(format!("  ... and {} more", samples.len() - 3));
            }
        }
        lines.join("\n")
    }
}

pub struct ImportManager {
    store: Arc<dyn Store>,
    config: Config,
    parser: Arc<Parser>,
    progress: Option<ProgressCallback>,
    dry_run: bool,
}

impl ImportManager {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let parser = Arc::new(Parser::new(config.parser.clone()));
        Self {
            store,
            config,
            parser,
            progress: None,
            dry_run: false,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Parse everything but write nothing.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Scan options seeded from the configuration; callers layer CLI
    /// overrides on top.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            max_workers: self.config.scanner.max_workers,
            max_depth: self.config.scanner.max_depth,
            follow_symlinks: self.config.scanner.follow_symlinks,
            timeout: self.config.scanner.timeout(),
            ..ScanOptions::default()
        }
    }

    /// Full pipeline over a directory tree.
    pub async fn run_directory(&self, root: &Path, options: ScanOptions) -> ProcessResult {
        let started = Instant::now();
        let mut result = ProcessResult::new();

        result.state = RunState::Scanning;
        progress::emit(&self.progress, 0, 0, &format!("scanning {}", root.display()));
        let scan = Scanner::new(options).scan(root).await;
        info!(summary = %scan.summary(), root = %root.display(), "scan complete");
        progress::emit(
            &self.progress,
            0,
            scan.files.len() as u64,
            &format!("scan complete: {} files", scan.files.len()),
        );

        let files = scan.files.clone();
        let scan_failed = files.is_empty() && !scan.errors.is_empty();
        result.scan = Some(scan);

        if scan_failed {
            result.state = RunState::Failed;
            result.elapsed = started.elapsed();
            return result;
        }
        if files.is_empty() {
            result.state = RunState::Completed;
            result.elapsed = started.elapsed();
            return result;
        }

        self.process_files(files, &mut result).await;
        result.elapsed = started.elapsed();
        result
    }

    /// Pipeline over an explicit file list, skipping the scan stage.
    pub async fn run_files(&self, files: Vec<PathBuf>) -> ProcessResult {
        let started = Instant::now();
        let mut result = ProcessResult::new();

        if files.is_empty() {
            result.state = RunState::Completed;
            result.elapsed = started.elapsed();
            return result;
        }

        self.process_files(files, &mut result).await;
        result.elapsed = started.elapsed();
        result
    }

    async fn process_files(&self, files: Vec<PathBuf>, result: &mut ProcessResult) {
        result.state = RunState::Parsing;
        let total = files.len() as u64;
        result.parse_attempted = files.len();

        let parser = self.parser.clone();
        let mut outcomes = stream::iter(files.into_iter().map(|path| {
            let parser = parser.clone();
            async move { parser.parse_file(&path).await }
        }))
        .buffer_unordered(self.config.manager.parse_workers.max(1));

        let mut valid: Vec<CanonicalRecord> = Vec::new();
        let mut done: u64 = 0;
        while let Some(outcome) = outcomes.next().await {
            done += 1;
            let name = outcome
                .source_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| outcome.source_file.display().to_string());
            progress::emit(&self.progress, done, total, &format!("parsed {}", name));

            for warning in &outcome.warnings {
                result
                    .parse_warnings
                    .push(format!("{}: {}", outcome.source_file.display(), warning));
            }
            if outcome.valid {
                result.parse_valid += 1;
                if let Some(record) = outcome.record {
                    valid.push(record);
                }
            } else {
                result.parse_invalid += 1;
                result.parse_errors.push(format!(
                    "{}: {}",
                    outcome.source_file.display(),
                    outcome.error_summary()
                ));
            }
        }
        drop(outcomes);

        if valid.is_empty() || self.dry_run {
            result.state = RunState::Completed;
            return;
        }

        result.state = RunState::Importing;
        let mut importer = BatchImporter::new(self.store.clone(), self.config.importer.clone());
        if let Some(callback) = &self.progress {
            importer = importer.with_progress(callback.clone());
        }
        result.import = Some(importer.import_records(valid).await);
        result.state = RunState::Completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::fs;
    use std::sync::Mutex;

    fn write_manifest(root: &Path, hash: &str, alias: &str, body: serde_json::Value) {
        let dir = root.join(hash).join(alias);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("manifest.json"), serde_json::to_vec(&body).unwrap()).unwrap();
    }

    fn valid_body(alias: &str) -> serde_json::Value {
        json!({
            "status": "ok",
            "alias": alias,
            "summary": "writes itself to the run key",
            "attck": ["T1547.001"]
        })
    }

    fn manager(store: Arc<MemoryStore>) -> ImportManager {
        ImportManager::new(store, Config::minimal())
    }

    #[tokio::test]
    async fn end_to_end_directory_run() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "aa11", "persist_run_key", valid_body("persist_run_key"));
        write_manifest(tmp.path(), "bb22", "drop_payload", valid_body("drop_payload"));
        // one broken manifest must not stop the rest
        write_manifest(tmp.path(), "cc33", "broken", json!({"alias": "broken"}));

        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());
        let result = mgr.run_directory(tmp.path(), mgr.scan_options()).await;

        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.parse_attempted, 3);
        assert_eq!(result.parse_valid, 2);
        assert_eq!(result.parse_invalid, 1);
        let import = result.import.as_ref().unwrap();
        assert_eq!(import.successful, 2);
        assert_eq!(store.function_count(), 2);
    }

    #[tokio::test]
    async fn missing_root_fails_the_run() {
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store);
        let result = mgr
            .run_directory(Path::new("/no/such/tree"), mgr.scan_options())
            .await;

        assert_eq!(result.state, RunState::Failed);
        assert!(result.import.is_none());
        assert!(result.error_count() >= 1);
    }

    #[tokio::test]
    async fn empty_tree_completes_without_import() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());
        let result = mgr.run_directory(tmp.path(), mgr.scan_options()).await;

        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.parse_attempted, 0);
        assert!(result.import.is_none());
        assert_eq!(store.function_count(), 0);
    }

    #[tokio::test]
    async fn dry_run_parses_but_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "aa11", "persist", valid_body("persist"));

        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone()).dry_run(true);
        let result = mgr.run_directory(tmp.path(), mgr.scan_options()).await;

        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.parse_valid, 1);
        assert!(result.import.is_none());
        assert_eq!(store.function_count(), 0);
    }

    #[tokio::test]
    async fn file_list_run_skips_scan() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "aa11", "persist", valid_body("persist"));
        let file = tmp.path().join("aa11/persist/manifest.json");

        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone());
        let result = mgr.run_files(vec![file]).await;

        assert_eq!(result.state, RunState::Completed);
        assert!(result.scan.is_none());
        assert_eq!(result.parse_valid, 1);
        assert_eq!(store.function_count(), 1);
    }

    #[tokio::test]
    async fn progress_covers_every_parsed_file() {
        let tmp = tempfile::tempdir().unwrap();
        for (hash, alias) in [("aa", "one"), ("bb", "two"), ("cc", "three")] {
            write_manifest(tmp.path(), hash, alias, valid_body(alias));
        }

        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let callback: ProgressCallback = Arc::new(move |_, _, message| {
            sink.lock().unwrap().push(message.to_string());
        });

        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store).with_progress(callback);
        let result = mgr.run_directory(tmp.path(), mgr.scan_options()).await;
        assert_eq!(result.state, RunState::Completed);

        let messages = messages.lock().unwrap();
        let parsed = messages.iter().filter(|m| m.starts_with("parsed ")).count();
        assert_eq!(parsed, 3);
        assert!(messages.iter().any(|m| m.starts_with("scanning ")));
        assert!(messages.iter().any(|m| m == "scan complete: 3 files"));
    }

    #[tokio::test]
    async fn panicking_callback_does_not_abort_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(tmp.path(), "aa11", "persist", valid_body("persist"));

        let callback: ProgressCallback = Arc::new(|_, _, _| panic!("observer bug"));
        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store.clone()).with_progress(callback);
        let result = mgr.run_directory(tmp.path(), mgr.scan_options()).await;

        assert_eq!(result.state, RunState::Completed);
        assert_eq!(store.function_count(), 1);
    }

    #[tokio::test]
    async fn summary_caps_sample_errors() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..5 {
            write_manifest(
                tmp.path(),
                &format!("h{}", i),
                &format!("a{}", i),
                json!({"alias": format!("a{}", i)}),
            );
        }

        let store = Arc::new(MemoryStore::new());
        let mgr = manager(store);
        let result = mgr.run_directory(tmp.path(), mgr.scan_options()).await;

        assert_eq!(result.parse_invalid, 5);
        let summary = result.summary();
        assert!(summary.contains("errors (5):"));
        assert!(summary.contains("... and 2 more"));
    }
}

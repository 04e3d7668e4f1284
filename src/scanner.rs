//! Concurrent recursive discovery of manifest files.
//!
//! The scanner only lists directories and reads metadata; file content is
//! never touched here. Subtree exploration is bounded by a worker semaphore,
//! so result ordering across concurrent subtrees is not guaranteed. All
//! failures are absorbed into the [`ScanResult`]: a bad root produces a
//! root-level error, per-subdirectory problems become warnings and the scan
//! continues elsewhere.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::Semaphore;
use tracing::debug;

/// Caller-supplied predicate applied after pattern matching.
pub type ScanFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ScanOptions {
    /// Glob pattern, or a named shorthand: `manifest` (manifest.json),
    /// `json` (*.json), `all` (*).
    pub pattern: String,
    pub recursive: bool,
    pub max_depth: Option<usize>,
    /// Bound on concurrently listed directories.
    pub max_workers: usize,
    pub follow_symlinks: bool,
    /// Global scan timeout; on expiry the partial result carries an error.
    pub timeout: Duration,
    pub filter: Option<ScanFilter>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            pattern: "manifest".to_string(),
            recursive: true,
            max_depth: None,
            max_workers: 4,
            follow_symlinks: false,
            timeout: Duration::from_secs(300),
            filter: None,
        }
    }
}

/// Outcome of one scan call. Transient, created per scan.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<PathBuf>,
    pub directories_scanned: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl ScanResult {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn summary(&self) -> String {
        let mut parts = vec![format!("found {} files", self.files.len())];
        if self.directories_scanned > 0 {
            parts.push(format!("{} directories", self.directories_scanned));
        }
        if !self.errors.is_empty() {
            parts.push(format!("{} errors", self.errors.len()));
        }
        if !self.warnings.is_empty() {
            parts.push(format!("{} warnings", self.warnings.len()));
        }
        parts.push(format!("in {:.2}s", self.elapsed.as_secs_f64()));
        parts.join(", ")
    }
}

/// Shared mutable state for one scan run. Tasks in different subtrees
/// append concurrently.
struct ScanState {
    files: Mutex<Vec<PathBuf>>,
    directories_scanned: AtomicU64,
    errors: Mutex<Vec<String>>,
    warnings: Mutex<Vec<String>>,
}

impl ScanState {
    fn new() -> Self {
        Self {
            files: Mutex::new(Vec::new()),
            directories_scanned: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    fn push_error(&self, msg: String) {
        self.errors.lock().expect("scan state poisoned").push(msg);
    }

    fn push_warning(&self, msg: String) {
        self.warnings.lock().expect("scan state poisoned").push(msg);
    }
}

struct ScanCtx {
    root: PathBuf,
    matcher: GlobSet,
    name_glob: globset::GlobMatcher,
    filter: Option<ScanFilter>,
    recursive: bool,
    max_depth: Option<usize>,
    follow_symlinks: bool,
    workers: Semaphore,
    state: ScanState,
}

pub struct Scanner {
    options: ScanOptions,
}

impl Scanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Expand named pattern shorthands into globs.
    fn resolve_pattern(pattern: &str) -> &str {
        match pattern {
            "manifest" => "manifest.json",
            "json" => "*.json",
            "all" => "*",
            other => other,
        }
    }

    pub async fn scan(&self, root: &Path) -> ScanResult {
        let started = Instant::now();
        let mut result = ScanResult::default();

        // Root validation: errors here are root-level; the scan returns an
        // empty result instead of failing the caller.
        let meta = match tokio::fs::metadata(root).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                result
                    .errors
                    .push(format!("root directory does not exist: {}", root.display()));
                result.elapsed = started.elapsed();
                return result;
            }
            Err(err) => {
                result
                    .errors
                    .push(format!("cannot read root {}: {}", root.display(), err));
                result.elapsed = started.elapsed();
                return result;
            }
        };
        if !meta.is_dir() {
            result
                .errors
                .push(format!("path is not a directory: {}", root.display()));
            result.elapsed = started.elapsed();
            return result;
        }

        let pattern = Self::resolve_pattern(&self.options.pattern);
        let (matcher, name_glob) = match build_matchers(pattern) {
            Ok(pair) => pair,
            Err(err) => {
                result
                    .errors
                    .push(format!("invalid file pattern '{}': {}", pattern, err));
                result.elapsed = started.elapsed();
                return result;
            }
        };

        let ctx = Arc::new(ScanCtx {
            root: root.to_path_buf(),
            matcher,
            name_glob,
            filter: self.options.filter.clone(),
            recursive: self.options.recursive,
            max_depth: self.options.max_depth,
            follow_symlinks: self.options.follow_symlinks,
            workers: Semaphore::new(self.options.max_workers.max(1)),
            state: ScanState::new(),
        });

        let walk = scan_directory(ctx.clone(), root.to_path_buf(), 0);
        if tokio::time::timeout(self.options.timeout, walk).await.is_err() {
            ctx.state.push_error(format!(
                "scan timed out after {:.0}s",
                self.options.timeout.as_secs_f64()
            ));
        }

        // Timed-out subtree tasks may still hold clones of ctx, so take a
        // snapshot rather than unwrapping the Arc.
        result.files = std::mem::take(&mut *ctx.state.files.lock().expect("scan state poisoned"));
        result.directories_scanned = ctx.state.directories_scanned.load(Ordering::Relaxed);
        result
            .errors
            .extend(ctx.state.errors.lock().expect("scan state poisoned").drain(..));
        result.warnings =
            std::mem::take(&mut *ctx.state.warnings.lock().expect("scan state poisoned"));
        result.elapsed = started.elapsed();

        debug!(
            files = result.files.len(),
            directories = result.directories_scanned,
            "scan finished"
        );
        result
    }
}

fn build_matchers(pattern: &str) -> Result<(GlobSet, globset::GlobMatcher), globset::Error> {
    // Match against the root-relative path as well as the bare file name.
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(pattern)?);
    builder.add(Glob::new(&format!("**/{}", pattern))?);
    let set = builder.build()?;
    let name_glob = Glob::new(pattern)?.compile_matcher();
    Ok((set, name_glob))
}

/// Recursively scan one directory. The worker semaphore is held only while
/// listing, so parents awaiting children never starve the pool.
fn scan_directory(ctx: Arc<ScanCtx>, dir: PathBuf, depth: usize) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(max) = ctx.max_depth {
            if depth >= max {
                ctx.state
                    .push_warning(format!("max depth {} reached at {}", max, dir.display()));
                return;
            }
        }

        let entries = {
            let _permit = ctx
                .workers
                .acquire()
                .await
                .expect("scan semaphore closed");
            list_directory(&dir).await
        };

        let entries = match entries {
            Ok(entries) => {
                ctx.state.directories_scanned.fetch_add(1, Ordering::Relaxed);
                entries
            }
            Err(err) => {
                let msg = format!("cannot scan directory {}: {}", dir.display(), err);
                if depth == 0 {
                    ctx.state.push_error(msg);
                } else {
                    ctx.state.push_warning(msg);
                }
                return;
            }
        };

        let mut subdirectories = Vec::new();
        for (path, mut file_type) in entries {
            if file_type.is_symlink() {
                if !ctx.follow_symlinks {
                    continue;
                }
                // Classify through the link target; broken links are skipped.
                match tokio::fs::metadata(&path).await {
                    Ok(meta) => file_type = meta.file_type(),
                    Err(_) => continue,
                }
            }
            if file_type.is_dir() {
                if ctx.recursive {
                    subdirectories.push(path);
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative = path.strip_prefix(&ctx.root).unwrap_or(&path);
            let name_matches = path
                .file_name()
                .map(|n| ctx.name_glob.is_match(Path::new(n)))
                .unwrap_or(false);
            if !name_matches && !ctx.matcher.is_match(relative) {
                continue;
            }
            if let Some(filter) = &ctx.filter {
                if !filter(&path) {
                    continue;
                }
            }
            ctx.state
                .files
                .lock()
                .expect("scan state poisoned")
                .push(path);
        }

        if subdirectories.is_empty() {
            return;
        }

        let mut handles = Vec::with_capacity(subdirectories.len());
        for sub in subdirectories {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(scan_directory(ctx, sub, depth + 1)));
        }
        for handle in handles {
            let _ = handle.await;
        }
    })
}

async fn list_directory(
    dir: &Path,
) -> std::io::Result<Vec<(PathBuf, std::fs::FileType)>> {
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        match entry.file_type().await {
            Ok(file_type) => entries.push((entry.path(), file_type)),
            Err(err) => {
                // Entry vanished or is unreadable; skip it, the caller
                // records directory-level problems.
                debug!(path = %entry.path().display(), %err, "unreadable entry skipped");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_manifest(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("manifest.json"), "{}").unwrap();
    }

    #[tokio::test]
    async fn missing_root_is_an_error_not_a_panic() {
        let scanner = Scanner::new(ScanOptions::default());
        let result = scanner.scan(Path::new("/no/such/root")).await;
        assert!(result.files.is_empty());
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("does not exist"));
    }

    #[tokio::test]
    async fn file_as_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not_a_dir");
        fs::write(&file, "x").unwrap();
        let result = Scanner::new(ScanOptions::default()).scan(&file).await;
        assert!(result.files.is_empty());
        assert!(result.errors[0].contains("not a directory"));
    }

    #[tokio::test]
    async fn finds_manifests_in_layout() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(&tmp.path().join("abc123/loader"));
        write_manifest(&tmp.path().join("abc123/injector"));
        write_manifest(&tmp.path().join("def456/dropper"));
        fs::write(tmp.path().join("abc123/notes.txt"), "ignored").unwrap();

        let result = Scanner::new(ScanOptions::default()).scan(tmp.path()).await;
        assert_eq!(result.files.len(), 3);
        assert!(result.errors.is_empty());
        assert!(result.directories_scanned >= 4);
    }

    #[tokio::test]
    async fn max_depth_halts_descent_with_warning() {
        let tmp = tempfile::tempdir().unwrap();
        // 3-level tree: manifests live at depth 3.
        write_manifest(&tmp.path().join("hash/alias"));
        fs::write(tmp.path().join("top.json"), "{}").unwrap();

        let options = ScanOptions {
            pattern: "json".to_string(),
            max_depth: Some(1),
            ..ScanOptions::default()
        };
        let result = Scanner::new(options).scan(tmp.path()).await;

        assert_eq!(result.files.len(), 1, "only the root-level file: {:?}", result.files);
        assert!(result.files[0].ends_with("top.json"));
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("max depth 1 reached")));
    }

    #[tokio::test]
    async fn non_recursive_scans_root_only() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(&tmp.path().join("hash/alias"));
        fs::write(tmp.path().join("manifest.json"), "{}").unwrap();

        let options = ScanOptions {
            recursive: false,
            ..ScanOptions::default()
        };
        let result = Scanner::new(options).scan(tmp.path()).await;
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.directories_scanned, 1);
    }

    #[tokio::test]
    async fn caller_filter_is_applied_after_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(&tmp.path().join("keep/loader"));
        write_manifest(&tmp.path().join("drop/loader"));

        let filter: ScanFilter =
            Arc::new(|path: &Path| path.to_string_lossy().contains("keep"));
        let options = ScanOptions {
            filter: Some(filter),
            ..ScanOptions::default()
        };
        let result = Scanner::new(options).scan(tmp.path()).await;
        assert_eq!(result.files.len(), 1);
        assert!(result.files[0].to_string_lossy().contains("keep"));
    }

    #[tokio::test]
    async fn global_timeout_reports_partial_results() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("early.json"), "{}").unwrap();
        write_manifest(&tmp.path().join("hash/alias"));

        // The filter stalls past the deadline after the root-level file is
        // matched, so the subtree is never reached.
        let filter: ScanFilter = Arc::new(|_: &Path| {
            std::thread::sleep(Duration::from_millis(300));
            true
        });
        let options = ScanOptions {
            pattern: "json".to_string(),
            timeout: Duration::from_millis(100),
            filter: Some(filter),
            ..ScanOptions::default()
        };
        let result = Scanner::new(options).scan(tmp.path()).await;

        assert!(
            result.errors.iter().any(|e| e.contains("scan timed out")),
            "errors: {:?}",
            result.errors
        );
        assert!(
            result.files.iter().any(|f| f.ends_with("early.json")),
            "partial results missing: {:?}",
            result.files
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_subdirectory_warns_and_siblings_survive() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        write_manifest(&tmp.path().join("readable/alias"));
        let locked = tmp.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not bind root; nothing to observe then.
        if fs::read_dir(&locked).is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = Scanner::new(ScanOptions::default()).scan(tmp.path()).await;
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(result.files.len(), 1, "sibling manifest lost: {:?}", result.files);
        assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.contains("cannot scan directory")),
            "warnings: {:?}",
            result.warnings
        );
    }

    #[tokio::test]
    async fn relative_path_patterns_match() {
        let tmp = tempfile::tempdir().unwrap();
        write_manifest(&tmp.path().join("abc/loader"));

        let options = ScanOptions {
            pattern: "abc/*/manifest.json".to_string(),
            ..ScanOptions::default()
        };
        let result = Scanner::new(options).scan(tmp.path()).await;
        assert_eq!(result.files.len(), 1);
    }
}

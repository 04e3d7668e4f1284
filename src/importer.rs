//! Transactional batch import of canonical records.
//!
//! Records are filtered, flagged for likely duplicates, chunked into
//! batches, and written through the [`Store`] one transaction per batch.
//! A failing batch rolls back whole and never stops the batches after it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::ImporterConfig;
use crate::error::StoreError;
use crate::models::CanonicalRecord;
use crate::progress::{self, ProgressCallback};
use crate::store::Store;

/// Aggregated outcome of one import run.
///
/// Invariant: `attempted == successful + failed`, and
/// `total == attempted + skipped`.
#[derive(Debug, Default)]
pub struct ImportResult {
    /// Records handed to the importer.
    pub total: usize,
    /// Records sent to the store.
    pub attempted: usize,
    pub successful: usize,
    pub failed: usize,
    /// Records rejected before any store contact.
    pub skipped: usize,
    /// Records flagged as likely duplicates. Flagging does not remove
    /// them; the store's constraints have the final say.
    pub duplicates: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub imported_ids: Vec<i64>,
    pub elapsed: Duration,
}

impl ImportResult {
    pub fn summary(&self) -> String {
        format!(
            "imported {}/{} records ({} failed, {} skipped, {} duplicates) in {:.2}s",
            self.successful,
            self.total,
            self.failed,
            self.skipped,
            self.duplicates,
            self.elapsed.as_secs_f64()
        )
    }
}

pub struct BatchImporter {
    store: Arc<dyn Store>,
    config: ImporterConfig,
    progress: Option<ProgressCallback>,
}

impl BatchImporter {
    pub fn new(store: Arc<dyn Store>, config: ImporterConfig) -> Self {
        Self {
            store,
            config,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Import a set of records. Failures are absorbed into the result;
    /// the call itself only describes what happened.
    pub async fn import_records(&self, records: Vec<CanonicalRecord>) -> ImportResult {
        let started = Instant::now();
        let mut result = ImportResult {
            total: records.len(),
            ..ImportResult::default()
        };
        if records.is_empty() {
            result.elapsed = started.elapsed();
            return result;
        }

        let mut viable = Vec::with_capacity(records.len());
        for record in records {
            match record.schema_violation() {
                Some(violation) => {
                    result.skipped += 1;
                    result
                        .errors
                        .push(format!("skipped '{}': {}", record.alias, violation));
                }
                None => viable.push(record),
            }
        }

        self.flag_duplicates(&viable, &mut result).await;
        self.check_technique_references(&mut viable, &mut result)
            .await;

        let total_viable = viable.len() as u64;
        let mut sent: u64 = 0;
        let batches: Vec<Vec<CanonicalRecord>> = chunk_records(viable, self.config.batch_size);

        for (index, batch) in batches.into_iter().enumerate() {
            let batch_len = batch.len();
            result.attempted += batch_len;
            sent += batch_len as u64;

            let outcome = match self.insert_with_retry(&batch, &mut result).await {
                Ok(ids) => {
                    result.successful += batch_len;
                    result.imported_ids.extend(ids);
                    "written"
                }
                Err(err) => {
                    result.failed += batch_len;
                    result
                        .errors
                        .push(format!("batch {} failed ({} records): {}", index + 1, batch_len, err));
                    "failed"
                }
            };

            progress::emit(
                &self.progress,
                sent,
                total_viable,
                &format!("batch {} {}", index + 1, outcome),
            );
        }

        result.elapsed = started.elapsed();
        debug!(summary = %result.summary(), "import finished");
        result
    }

    /// Flag records whose alias or hash already exists in the store. They
    /// stay in the batch; the unique constraint decides their fate.
    async fn flag_duplicates(&self, records: &[CanonicalRecord], result: &mut ImportResult) {
        if records.is_empty() {
            return;
        }
        let aliases: Vec<String> = records.iter().map(|r| r.alias.clone()).collect();
        let hash_ids: Vec<String> = records.iter().map(|r| r.hash_id.clone()).collect();

        let existing_aliases = match self.store.existing_aliases(&aliases).await {
            Ok(set) => set,
            Err(err) => {
                warn!(%err, "duplicate check unavailable");
                result
                    .warnings
                    .push(format!("duplicate check unavailable: {}", err));
                return;
            }
        };
        let existing_hashes = match self.store.existing_hash_ids(&hash_ids).await {
            Ok(set) => set,
            Err(err) => {
                warn!(%err, "duplicate check unavailable");
                result
                    .warnings
                    .push(format!("duplicate check unavailable: {}", err));
                HashSet::new()
            }
        };

        for record in records.iter() {
            if existing_aliases.contains(&record.alias) {
                result.duplicates += 1;
                result
                    .warnings
                    .push(format!("alias already in store: '{}'", record.alias));
            } else if existing_hashes.contains(&record.hash_id) {
                result.duplicates += 1;
                result.warnings.push(format!(
                    "hash_id already in store: '{}' (alias '{}')",
                    record.hash_id, record.alias
                ));
            }
        }
    }

    /// Drop mappings to techniques absent from the reference tables. When
    /// the tables are unpopulated the check is skipped entirely.
    async fn check_technique_references(
        &self,
        records: &mut Vec<CanonicalRecord>,
        result: &mut ImportResult,
    ) {
        if records.is_empty() {
            return;
        }
        let known = match self.store.known_technique_ids().await {
            Ok(Some(known)) => known,
            Ok(None) => {
                result.warnings.push(
                    "technique reference tables are empty; referential check skipped".to_string(),
                );
                return;
            }
            Err(err) => {
                warn!(%err, "technique reference check unavailable");
                result
                    .warnings
                    .push(format!("technique reference check unavailable: {}", err));
                return;
            }
        };

        for record in records.iter_mut() {
            let before = record.attck.len();
            record.attck.retain(|id| {
                let keep = known.contains(id) || known.contains(base_technique(id));
                if !keep {
                    result
                        .warnings
                        .push(format!("unknown technique '{}' dropped from '{}'", id, record.alias));
                }
                keep
            });
            if record.attck.is_empty() && before > 0 {
                result.warnings.push(format!(
                    "'{}' has no recognized techniques left; importing without mappings",
                    record.alias
                ));
            }
        }
    }

    /// One batch, one transaction, with exponential backoff on transient
    /// store errors. Constraint violations abandon retries immediately.
    async fn insert_with_retry(
        &self,
        batch: &[CanonicalRecord],
        result: &mut ImportResult,
    ) -> Result<Vec<i64>, StoreError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.store.insert_batch(batch).await {
                Ok(ids) => return Ok(ids),
                Err(err) if err.is_constraint() => return Err(err),
                Err(err) if err.is_retryable() && attempt <= self.config.max_retries => {
                    let delay = self.config.retry_delay() * 2u32.saturating_pow(attempt - 1);
                    result.errors.push(format!(
                        "transient store error on attempt {}: {} (retrying in {:?})",
                        attempt, err, delay
                    ));
                    warn!(attempt, %err, ?delay, "retrying batch");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn chunk_records(records: Vec<CanonicalRecord>, batch_size: usize) -> Vec<Vec<CanonicalRecord>> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(records.len()));
    for record in records {
        current.push(record);
        if current.len() == size {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// `T1055.001` falls back to `T1055` for the referential check.
fn base_technique(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordStatus;
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn record(alias: &str) -> CanonicalRecord {
        CanonicalRecord {
            hash_id: format!("hash-{}", alias),
            alias: alias.to_string(),
            summary: "does a thing".to_string(),
            status: RecordStatus::Ok,
            attck: vec!["T1055".to_string()],
            root_function: None,
            source_code: None,
            source_path: None,
            manifest_path: None,
            tries: 1,
            children: Vec::new(),
            manifest_json: Value::Null,
        }
    }

    fn importer(store: Arc<MemoryStore>) -> BatchImporter {
        BatchImporter::new(store, ImporterConfig::default())
    }

    fn fast_retry_config() -> ImporterConfig {
        ImporterConfig {
            batch_size: 1000,
            max_retries: 3,
            retry_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn clean_batch_imports_fully() {
        let store = Arc::new(MemoryStore::new());
        let result = importer(store.clone())
            .import_records(vec![record("a"), record("b")])
            .await;

        assert_eq!(result.total, 2);
        assert_eq!(result.successful, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(result.imported_ids.len(), 2);
        assert_eq!(result.attempted, result.successful + result.failed);
        assert_eq!(store.function_count(), 2);
    }

    #[tokio::test]
    async fn schema_violations_are_skipped_not_attempted() {
        let store = Arc::new(MemoryStore::new());
        let mut bad = record("bad");
        bad.summary = "  ".to_string();

        let result = importer(store.clone())
            .import_records(vec![record("ok"), bad])
            .await;

        assert_eq!(result.skipped, 1);
        assert_eq!(result.successful, 1);
        assert_eq!(result.total, result.attempted + result.skipped);
        assert!(result.errors.iter().any(|e| e.contains("summary is empty")));
        assert_eq!(store.function_count(), 1);
    }

    #[tokio::test]
    async fn second_import_of_same_alias_fails_on_constraint() {
        let store = Arc::new(MemoryStore::new());
        let imp = importer(store.clone());

        let first = imp.import_records(vec![record("a")]).await;
        assert_eq!(first.successful, 1);

        let second = imp.import_records(vec![record("a")]).await;
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.failed, 1);
        assert_eq!(second.successful, 0);
        assert!(second
            .warnings
            .iter()
            .any(|w| w.contains("already in store")));
        // at most one row for that alias
        assert_eq!(store.functions_with_alias("a").len(), 1);
    }

    #[tokio::test]
    async fn one_violator_fails_its_whole_batch() {
        let store = Arc::new(MemoryStore::new());
        let imp = importer(store.clone());
        imp.import_records(vec![record("taken")]).await;

        let records = vec![record("x"), record("taken"), record("y")];
        let result = imp.import_records(records).await;

        assert_eq!(result.failed, 3);
        assert_eq!(result.successful, 0);
        assert_eq!(store.function_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let store = Arc::new(MemoryStore::new().with_transient_failures(2));
        let imp = BatchImporter::new(store.clone(), fast_retry_config());

        let result = imp.import_records(vec![record("a")]).await;

        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 0);
        let transient_errors = result
            .errors
            .iter()
            .filter(|e| e.contains("transient store error"))
            .count();
        assert_eq!(transient_errors, 2);
    }

    #[tokio::test]
    async fn retries_exhaust_and_batch_fails() {
        let store = Arc::new(MemoryStore::new().with_transient_failures(10));
        let imp = BatchImporter::new(store.clone(), fast_retry_config());

        let result = imp.import_records(vec![record("a")]).await;

        assert_eq!(result.failed, 1);
        assert_eq!(result.successful, 0);
        assert!(result.errors.iter().any(|e| e.contains("batch 1 failed")));
        assert_eq!(store.function_count(), 0);
    }

    #[tokio::test]
    async fn unknown_techniques_are_dropped_with_warning() {
        let store = Arc::new(MemoryStore::new());
        store.set_known_techniques(["T1055"]);

        let mut rec = record("a");
        rec.attck = vec!["T1055".into(), "T9999".into()];
        let result = importer(store.clone()).import_records(vec![rec]).await;

        assert_eq!(result.successful, 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("unknown technique 'T9999'")));
        assert_eq!(store.functions_with_alias("a")[0].techniques, vec!["T1055"]);
    }

    #[tokio::test]
    async fn subtechniques_pass_via_base_id() {
        let store = Arc::new(MemoryStore::new());
        store.set_known_techniques(["T1055"]);

        let mut rec = record("a");
        rec.attck = vec!["T1055.001".into()];
        let result = importer(store.clone()).import_records(vec![rec]).await;

        assert_eq!(result.successful, 1);
        assert!(result.warnings.iter().all(|w| !w.contains("unknown technique")));
    }

    #[tokio::test]
    async fn empty_reference_tables_skip_check_with_one_warning() {
        let store = Arc::new(MemoryStore::new());
        let mut rec = record("a");
        rec.attck = vec!["T9999".into()];

        let result = importer(store.clone()).import_records(vec![rec]).await;

        assert_eq!(result.successful, 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("referential check skipped")));
        assert_eq!(store.functions_with_alias("a")[0].techniques, vec!["T9999"]);
    }

    #[tokio::test]
    async fn batches_are_chunked_and_later_batches_survive_failures() {
        let store = Arc::new(MemoryStore::new());
        let imp = BatchImporter::new(
            store.clone(),
            ImporterConfig {
                batch_size: 1,
                max_retries: 0,
                retry_delay_ms: 1,
            },
        );
        imp.import_records(vec![record("b")]).await;

        // batch 1: a (clean) / batch 2: b (constraint) / batch 3: c (clean)
        let result = imp
            .import_records(vec![record("a"), record("b"), record("c")])
            .await;

        assert_eq!(result.successful, 2);
        assert_eq!(result.failed, 1);
        assert_eq!(store.function_count(), 3);
    }

    /// Delegates to a [`MemoryStore`] except that hash lookups always fail.
    struct HashLookupDown(MemoryStore);

    #[async_trait::async_trait]
    impl Store for HashLookupDown {
        async fn existing_aliases(
            &self,
            aliases: &[String],
        ) -> Result<HashSet<String>, StoreError> {
            self.0.existing_aliases(aliases).await
        }

        async fn existing_hash_ids(&self, _: &[String]) -> Result<HashSet<String>, StoreError> {
            Err(StoreError::Transient("lookup connection lost".to_string()))
        }

        async fn known_technique_ids(&self) -> Result<Option<HashSet<String>>, StoreError> {
            self.0.known_technique_ids().await
        }

        async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<i64>, StoreError> {
            self.0.insert_batch(records).await
        }
    }

    #[tokio::test]
    async fn hash_lookup_failure_warns_and_import_continues() {
        let store = Arc::new(HashLookupDown(MemoryStore::new()));
        let imp = BatchImporter::new(store, ImporterConfig::default());

        let result = imp.import_records(vec![record("a")]).await;

        assert_eq!(result.successful, 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("duplicate check unavailable")));
    }

    #[tokio::test]
    async fn progress_distinguishes_failed_batches() {
        let store = Arc::new(MemoryStore::new());
        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let callback: ProgressCallback = Arc::new(move |_, _, message| {
            sink.lock().unwrap().push(message.to_string());
        });

        let imp = BatchImporter::new(
            store,
            ImporterConfig {
                batch_size: 1,
                max_retries: 0,
                retry_delay_ms: 1,
            },
        )
        .with_progress(callback);
        imp.import_records(vec![record("taken")]).await;
        // batch 1: taken (constraint) / batch 2: fresh (clean)
        imp.import_records(vec![record("taken"), record("fresh")])
            .await;

        let messages = messages.lock().unwrap();
        assert!(messages.iter().any(|m| m == "batch 1 failed"), "messages: {:?}", messages);
        assert!(messages.iter().any(|m| m == "batch 2 written"), "messages: {:?}", messages);
    }

    #[tokio::test]
    async fn progress_reports_batch_checkpoints() {
        let store = Arc::new(MemoryStore::new());
        let calls = Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let callback: ProgressCallback = Arc::new(move |_, _, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        let imp = BatchImporter::new(
            store,
            ImporterConfig {
                batch_size: 1,
                ..ImporterConfig::default()
            },
        )
        .with_progress(callback);
        imp.import_records(vec![record("a"), record("b")]).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

//! In-memory [`Store`] used by tests and dry runs.
//!
//! Mirrors the SQLite backend's observable behavior: alias uniqueness,
//! all-or-nothing batches, and monotonically increasing row IDs. Transient
//! failures can be injected to exercise the importer's retry path.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::CanonicalRecord;
use crate::store::Store;

#[derive(Default)]
struct Inner {
    records: Vec<StoredFunction>,
    next_id: i64,
    known_techniques: Option<HashSet<String>>,
    transient_failures: u32,
}

#[derive(Clone)]
pub struct StoredFunction {
    pub id: i64,
    pub hash_id: String,
    pub alias: String,
    pub techniques: Vec<String>,
    pub child_count: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` insert_batch calls with a transient error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.inner.lock().unwrap().transient_failures = count;
        self
    }

    /// Populate the simulated reference tables.
    pub fn set_known_techniques<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = ids.into_iter().map(Into::into).collect();
        self.inner.lock().unwrap().known_techniques = Some(set);
    }

    pub fn function_count(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn functions_with_alias(&self, alias: &str) -> Vec<StoredFunction> {
        self.inner
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.alias == alias)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn existing_aliases(&self, aliases: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(aliases
            .iter()
            .filter(|a| inner.records.iter().any(|r| &r.alias == *a))
            .cloned()
            .collect())
    }

    async fn existing_hash_ids(&self, hash_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(hash_ids
            .iter()
            .filter(|h| inner.records.iter().any(|r| &r.hash_id == *h))
            .cloned()
            .collect())
    }

    async fn known_technique_ids(&self) -> Result<Option<HashSet<String>>, StoreError> {
        Ok(self.inner.lock().unwrap().known_techniques.clone())
    }

    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<i64>, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(StoreError::Transient("simulated connection loss".to_string()));
        }

        // Validate the whole batch before touching state, matching the
        // SQLite transaction's all-or-nothing behavior.
        let mut batch_aliases = HashSet::new();
        for record in records {
            let duplicate_in_store = inner.records.iter().any(|r| r.alias == record.alias);
            if duplicate_in_store || !batch_aliases.insert(record.alias.clone()) {
                return Err(StoreError::Constraint(format!(
                    "UNIQUE constraint failed: functions.alias ({})",
                    record.alias
                )));
            }
        }

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            inner.next_id += 1;
            let id = inner.next_id;
            let mut techniques: Vec<String> = Vec::new();
            for technique in &record.attck {
                if !techniques.contains(technique) {
                    techniques.push(technique.clone());
                }
            }
            inner.records.push(StoredFunction {
                id,
                hash_id: record.hash_id.clone(),
                alias: record.alias.clone(),
                techniques,
                child_count: record.children.len(),
            });
            ids.push(id);
        }
        Ok(ids)
    }
}

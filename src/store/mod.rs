//! Persistence abstraction for the importer.
//!
//! The importer only speaks [`Store`]; the production backend is
//! [`SqliteStore`], and [`MemoryStore`] backs tests and dry runs without a
//! database file.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::CanonicalRecord;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Which of the given aliases already have a `functions` row.
    async fn existing_aliases(&self, aliases: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Which of the given hash IDs already have a `functions` row.
    async fn existing_hash_ids(&self, hash_ids: &[String]) -> Result<HashSet<String>, StoreError>;

    /// The technique IDs present in the reference tables, or `None` when
    /// the tables have never been populated. A `None` tells the importer
    /// to skip the referential check rather than reject every mapping.
    async fn known_technique_ids(&self) -> Result<Option<HashSet<String>>, StoreError>;

    /// Insert a batch of records in one transaction. All-or-nothing: on
    /// error no row of the batch persists. Returns the new row IDs in
    /// input order.
    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<i64>, StoreError>;
}

//! SQLite-backed [`Store`] built on the shared connection pool.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, SqlitePool};

use crate::error::StoreError;
use crate::models::CanonicalRecord;
use crate::store::Store;

// SQLite caps bound parameters per statement; stay well under it.
const IN_CHUNK: usize = 400;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn existing_values(
        &self,
        column: &str,
        values: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let mut found = HashSet::new();
        for chunk in values.chunks(IN_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("SELECT {} FROM functions WHERE {} IN (", column, column));
            let mut separated = builder.separated(", ");
            for value in chunk {
                separated.push_bind(value);
            }
            separated.push_unseparated(")");

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in rows {
                found.insert(row.try_get::<String, _>(0).map_err(StoreError::from)?);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn existing_aliases(&self, aliases: &[String]) -> Result<HashSet<String>, StoreError> {
        if aliases.is_empty() {
            return Ok(HashSet::new());
        }
        self.existing_values("alias", aliases).await
    }

    async fn existing_hash_ids(&self, hash_ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if hash_ids.is_empty() {
            return Ok(HashSet::new());
        }
        self.existing_values("hash_id", hash_ids).await
    }

    async fn known_technique_ids(&self) -> Result<Option<HashSet<String>>, StoreError> {
        let rows = sqlx::query("SELECT technique_id FROM attack_techniques")
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            ids.insert(row.try_get::<String, _>(0).map_err(StoreError::from)?);
        }
        Ok(Some(ids))
    }

    async fn insert_batch(&self, records: &[CanonicalRecord]) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let manifest_json =
                serde_json::to_string(&record.manifest_json).map_err(|err| {
                    StoreError::Other(format!("cannot serialize manifest for {}: {}", record.alias, err))
                })?;

            let function_id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO functions
                    (hash_id, alias, root_function, summary, source_code,
                     source_path, manifest_path, manifest_json, tries, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&record.hash_id)
            .bind(&record.alias)
            .bind(&record.root_function)
            .bind(&record.summary)
            .bind(&record.source_code)
            .bind(&record.source_path)
            .bind(&record.manifest_path)
            .bind(&manifest_json)
            .bind(record.tries)
            .bind(record.status.as_str())
            .fetch_one(&mut *tx)
            .await?;

            // A record may list the same technique twice; the unique pair
            // constraint folds those instead of failing the batch.
            for technique_id in &record.attck {
                sqlx::query(
                    r#"
                    INSERT INTO attck_mappings (function_id, technique_id)
                    VALUES (?, ?)
                    ON CONFLICT(function_id, technique_id) DO NOTHING
                    "#,
                )
                .bind(function_id)
                .bind(technique_id)
                .execute(&mut *tx)
                .await?;
            }

            for child in &record.children {
                sqlx::query(
                    r#"
                    INSERT INTO function_children (parent_function_id, name, alias, description)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(function_id)
                .bind(&child.name)
                .bind(&child.alias)
                .bind(&child.description)
                .execute(&mut *tx)
                .await?;
            }

            ids.push(function_id);
        }

        tx.commit().await?;
        Ok(ids)
    }
}

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema setup. Safe to run on every startup.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per parsed malware function
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS functions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hash_id TEXT NOT NULL,
            alias TEXT NOT NULL,
            root_function TEXT,
            summary TEXT NOT NULL,
            source_code TEXT,
            source_path TEXT,
            manifest_path TEXT,
            manifest_json TEXT NOT NULL,
            tries INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(alias)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Function -> ATT&CK technique mappings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attck_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            function_id INTEGER NOT NULL,
            technique_id TEXT NOT NULL,
            UNIQUE(function_id, technique_id),
            FOREIGN KEY (function_id) REFERENCES functions(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS function_children (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            parent_function_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            alias TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            FOREIGN KEY (parent_function_id) REFERENCES functions(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ATT&CK reference tables, populated by `techniques load`
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attack_tactics (
            tactic_id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attack_techniques (
            technique_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            tactic_id TEXT,
            parent_technique_id TEXT,
            FOREIGN KEY (tactic_id) REFERENCES attack_tactics(tactic_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_functions_hash_id ON functions(hash_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_functions_status ON functions(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_mappings_technique ON attck_mappings(technique_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_children_parent ON function_children(parent_function_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

//! Database statistics and health overview.
//!
//! Provides a quick summary of what's been ingested: function counts,
//! mapping counts, per-status and per-technique breakdowns. Used by
//! `attck stats` to confirm imports landed as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct StatusStats {
    status: String,
    count: i64,
}

struct TechniqueStats {
    technique_id: String,
    name: Option<String>,
    count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::apply(&pool).await?;

    let total_functions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM functions")
        .fetch_one(&pool)
        .await?;

    let total_samples: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT hash_id) FROM functions")
        .fetch_one(&pool)
        .await?;

    let total_mappings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attck_mappings")
        .fetch_one(&pool)
        .await?;

    let total_children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM function_children")
        .fetch_one(&pool)
        .await?;

    let reference_techniques: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attack_techniques")
        .fetch_one(&pool)
        .await?;

    let last_import: Option<String> = sqlx::query_scalar("SELECT MAX(created_at) FROM functions")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("ATT&CK Ingest — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Functions:   {}", total_functions);
    println!("  Samples:     {}", total_samples);
    println!("  Mappings:    {}", total_mappings);
    println!("  Children:    {}", total_children);
    println!(
        "  Reference:   {} techniques loaded{}",
        reference_techniques,
        if reference_techniques == 0 {
            "  (run `attck techniques load`)"
        } else {
            ""
        }
    );
    println!(
        "  Last import: {}",
        last_import
            .as_deref()
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );

    // Per-status breakdown
    let status_rows = sqlx::query(
        "SELECT status, COUNT(*) AS count FROM functions GROUP BY status ORDER BY count DESC",
    )
    .fetch_all(&pool)
    .await?;
    let status_stats: Vec<StatusStats> = status_rows
        .iter()
        .map(|row| StatusStats {
            status: row.get("status"),
            count: row.get("count"),
        })
        .collect();

    if !status_stats.is_empty() {
        println!();
        println!("  By status:");
        for s in &status_stats {
            println!("  {:<16} {:>8}", s.status, s.count);
        }
    }

    // Most common techniques
    let technique_rows = sqlx::query(
        r#"
        SELECT
            m.technique_id,
            t.name AS name,
            COUNT(*) AS count
        FROM attck_mappings m
        LEFT JOIN attack_techniques t ON t.technique_id = m.technique_id
        GROUP BY m.technique_id
        ORDER BY count DESC
        LIMIT 10
        "#,
    )
    .fetch_all(&pool)
    .await?;
    let technique_stats: Vec<TechniqueStats> = technique_rows
        .iter()
        .map(|row| TechniqueStats {
            technique_id: row.get("technique_id"),
            name: row.get("name"),
            count: row.get("count"),
        })
        .collect();

    if !technique_stats.is_empty() {
        println!();
        println!("  Top techniques:");
        println!("  {:<12} {:>8}   {}", "TECHNIQUE", "COUNT", "NAME");
        println!("  {}", "-".repeat(56));
        for t in &technique_stats {
            println!(
                "  {:<12} {:>8}   {}",
                t.technique_id,
                t.count,
                t.name.as_deref().unwrap_or("-")
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a SQLite `datetime('now')` string as a relative time
/// (e.g. "3 hours ago").
fn format_ts_relative(raw: &str) -> String {
    let parsed = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc());
    let ts = match parsed {
        Ok(dt) => dt,
        Err(_) => return raw.to_string(),
    };

    let delta = (chrono::Utc::now() - ts).num_seconds();
    if delta < 0 {
        return ts.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        ts.format("%Y-%m-%d %H:%M").to_string()
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_scales() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamp_is_relative() {
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        assert_eq!(format_ts_relative(&now), "just now");
        assert_eq!(format_ts_relative("garbage"), "garbage");
    }
}

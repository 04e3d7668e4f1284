//! ATT&CK reference-table loading.
//!
//! Consumes the matrix JSON export: a map of tactic ID to tactic metadata,
//! where each technique entry carries its ID as the key and optionally a
//! `sub` list of sub-technique entries in the same shape. Loading is
//! additive and idempotent (`INSERT OR IGNORE`).

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;

#[derive(Debug, Deserialize)]
struct TacticEntry {
    #[serde(rename = "tactic_name_en", alias = "name")]
    name: String,
    #[serde(default)]
    techniques: Vec<TechniqueEntry>,
}

/// `{"T1055": "Process Injection", "sub": [{"T1055.001": "DLL Injection"}]}`
#[derive(Debug, Deserialize)]
struct TechniqueEntry {
    #[serde(default)]
    sub: Vec<BTreeMap<String, String>>,
    #[serde(flatten)]
    ids: BTreeMap<String, String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefdataSummary {
    pub tactics: usize,
    pub techniques: usize,
    pub sub_techniques: usize,
}

pub async fn load_reference_data(pool: &SqlitePool, path: &Path) -> Result<RefdataSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read reference data: {}", path.display()))?;
    let matrix: BTreeMap<String, TacticEntry> =
        serde_json::from_str(&content).with_context(|| "Failed to parse reference data JSON")?;

    let mut summary = RefdataSummary::default();
    let mut tx = pool.begin().await?;

    for (tactic_id, tactic) in &matrix {
        sqlx::query("INSERT OR IGNORE INTO attack_tactics (tactic_id, name) VALUES (?, ?)")
            .bind(tactic_id)
            .bind(&tactic.name)
            .execute(&mut *tx)
            .await?;
        summary.tactics += 1;

        for technique in &tactic.techniques {
            for (technique_id, name) in &technique.ids {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO attack_techniques
                        (technique_id, name, tactic_id, parent_technique_id)
                    VALUES (?, ?, ?, NULL)
                    "#,
                )
                .bind(technique_id)
                .bind(name)
                .bind(tactic_id)
                .execute(&mut *tx)
                .await?;
                summary.techniques += 1;

                for sub in &technique.sub {
                    for (sub_id, sub_name) in sub {
                        sqlx::query(
                            r#"
                            INSERT OR IGNORE INTO attack_techniques
                                (technique_id, name, tactic_id, parent_technique_id)
                            VALUES (?, ?, ?, ?)
                            "#,
                        )
                        .bind(sub_id)
                        .bind(sub_name)
                        .bind(tactic_id)
                        .bind(technique_id)
                        .execute(&mut *tx)
                        .await?;
                        summary.sub_techniques += 1;
                    }
                }
            }
        }
    }

    tx.commit().await?;
    info!(
        tactics = summary.tactics,
        techniques = summary.techniques,
        sub_techniques = summary.sub_techniques,
        "reference data loaded"
    );
    Ok(summary)
}

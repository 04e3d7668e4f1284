//! Core data models used throughout the ingestion pipeline.
//!
//! A [`CanonicalRecord`] is the validated, normalized in-memory form of one
//! manifest. It is produced exactly once by the parser, consumed exactly
//! once by the importer (becoming a `functions` row plus mapping and child
//! rows), then discarded.

use serde_json::Value;

/// Lifecycle status reported by the manifest generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Ok,
    Error,
    Pending,
    Generated,
    Failed,
    /// Anything the generator emitted that we do not recognize. Preserved
    /// as-is; the parser records a warning.
    Other(String),
}

impl RecordStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ok" => RecordStatus::Ok,
            "error" => RecordStatus::Error,
            "pending" => RecordStatus::Pending,
            "generated" => RecordStatus::Generated,
            "failed" => RecordStatus::Failed,
            _ => RecordStatus::Other(s.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordStatus::Ok => "ok",
            RecordStatus::Error => "error",
            RecordStatus::Pending => "pending",
            RecordStatus::Generated => "generated",
            RecordStatus::Failed => "failed",
            RecordStatus::Other(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, RecordStatus::Other(_))
    }
}

/// A child-function descriptor from the manifest's `children_aliases` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildFunction {
    pub name: String,
    pub alias: String,
    pub description: String,
}

/// One malware "function" unit, ready for persistence.
#[derive(Debug, Clone)]
pub struct CanonicalRecord {
    /// Content hash identifying the originating sample. Derived from the
    /// directory layout or the manifest, else SHA-256 of the alias.
    pub hash_id: String,
    /// Non-empty, at most 255 characters.
    pub alias: String,
    /// Non-empty human description of what the function does.
    pub summary: String,
    pub status: RecordStatus,
    /// Normalized technique IDs (`T1055`, `T1055.001`). Non-empty; duplicates
    /// are allowed here, the mapping table deduplicates per pair.
    pub attck: Vec<String>,
    pub root_function: Option<String>,
    /// Generated source text carried by the manifest.
    pub source_code: Option<String>,
    /// Path of the generated source file next to the manifest.
    pub source_path: Option<String>,
    pub manifest_path: Option<String>,
    pub tries: i32,
    pub children: Vec<ChildFunction>,
    /// The full original manifest document, persisted verbatim.
    pub manifest_json: Value,
}

impl CanonicalRecord {
    /// Minimal schema checks the importer re-applies before sending a record
    /// to the store. Returns the first violation, if any.
    pub fn schema_violation(&self) -> Option<String> {
        if self.alias.trim().is_empty() {
            return Some("alias is empty".to_string());
        }
        let alias_chars = self.alias.chars().count();
        if alias_chars > 255 {
            return Some(format!("alias too long: {} > 255", alias_chars));
        }
        if self.summary.trim().is_empty() {
            return Some("summary is empty".to_string());
        }
        if self.attck.is_empty() {
            return Some("no technique mappings".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        assert_eq!(RecordStatus::parse("ok"), RecordStatus::Ok);
        assert_eq!(RecordStatus::parse(" Generated "), RecordStatus::Generated);
        assert_eq!(
            RecordStatus::parse("weird"),
            RecordStatus::Other("weird".to_string())
        );
        assert!(!RecordStatus::parse("weird").is_known());
        assert_eq!(RecordStatus::parse("FAILED").as_str(), "failed");
    }

    #[test]
    fn schema_violation_catches_overlong_alias() {
        let rec = CanonicalRecord {
            hash_id: "h".into(),
            alias: "a".repeat(256),
            summary: "s".into(),
            status: RecordStatus::Ok,
            attck: vec!["T1055".into()],
            root_function: None,
            source_code: None,
            source_path: None,
            manifest_path: None,
            tries: 1,
            children: Vec::new(),
            manifest_json: Value::Null,
        };
        assert!(rec.schema_violation().unwrap().contains("too long"));
    }

    #[test]
    fn schema_violation_measures_alias_in_characters() {
        // 100 characters, 300 bytes
        let rec = CanonicalRecord {
            hash_id: "h".into(),
            alias: "注".repeat(100),
            summary: "s".into(),
            status: RecordStatus::Ok,
            attck: vec!["T1055".into()],
            root_function: None,
            source_code: None,
            source_path: None,
            manifest_path: None,
            tries: 1,
            children: Vec::new(),
            manifest_json: Value::Null,
        };
        assert!(rec.schema_violation().is_none());
    }
}

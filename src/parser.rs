//! Per-file manifest parsing, validation, and normalization.
//!
//! `parse_file` never returns `Err`: every failure is classified, recorded
//! on the [`ParseOutcome`], and the caller moves on to the next file. A
//! successful parse yields exactly one [`CanonicalRecord`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::ParserConfig;
use crate::error::{ParseErrorKind, ParseFailure};
use crate::identity::{DirectoryLayout, IdentityResolver};
use crate::models::{CanonicalRecord, ChildFunction, RecordStatus};

const REQUIRED_FIELDS: [&str; 4] = ["status", "alias", "summary", "attck"];

/// Result of parsing one manifest file.
#[derive(Debug)]
pub struct ParseOutcome {
    pub valid: bool,
    pub record: Option<CanonicalRecord>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Failure classification when `valid` is false.
    pub failure: Option<ParseErrorKind>,
    pub source_file: PathBuf,
    pub elapsed: Duration,
}

impl ParseOutcome {
    fn pending(source_file: PathBuf) -> Self {
        Self {
            valid: false,
            record: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            source_file,
            elapsed: Duration::ZERO,
        }
    }

    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "no errors".to_string();
        }
        let shown: Vec<&str> = self.errors.iter().take(3).map(String::as_str).collect();
        if self.errors.len() > 3 {
            format!("{} errors: {}...", self.errors.len(), shown.join("; "))
        } else {
            format!("{} errors: {}", self.errors.len(), shown.join("; "))
        }
    }
}

pub struct Parser {
    config: ParserConfig,
    resolver: Arc<dyn IdentityResolver>,
    technique_id: Regex,
    technique_prefix: Regex,
}

impl Parser {
    pub fn new(config: ParserConfig) -> Self {
        Self::with_resolver(config, Arc::new(DirectoryLayout))
    }

    pub fn with_resolver(config: ParserConfig, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            config,
            resolver,
            technique_id: Regex::new(r"^T\d{4}(\.\d+)?$").expect("technique regex"),
            technique_prefix: Regex::new(r"^[Tt]\d{4}(\.\d+)?").expect("technique prefix regex"),
        }
    }

    /// Parse one manifest file. Infallible at the call site: file-system,
    /// decoding, and validation problems all land in the outcome.
    pub async fn parse_file(&self, path: &Path) -> ParseOutcome {
        let started = Instant::now();
        let mut outcome = ParseOutcome::pending(path.to_path_buf());

        let document = match self.read_document(path).await {
            Ok(doc) => doc,
            Err(failure) => {
                debug!(file = %path.display(), kind = failure.kind.as_str(), "parse failed");
                outcome.failure = Some(failure.kind);
                outcome.errors.push(failure.message);
                outcome.elapsed = started.elapsed();
                return outcome;
            }
        };

        if let Some(record) = self.validate_and_normalize(&document, path, &mut outcome) {
            outcome.valid = true;
            outcome.record = Some(record);
        } else {
            outcome.failure = Some(ParseErrorKind::Structural);
        }
        outcome.elapsed = started.elapsed();
        outcome
    }

    /// Pre-checks, bounded read, and JSON decode.
    async fn read_document(&self, path: &Path) -> Result<Value, ParseFailure> {
        let meta = tokio::fs::metadata(path).await.map_err(|err| {
            ParseFailure::new(
                ParseErrorKind::from_io(&err),
                format!("cannot access {}: {}", path.display(), err),
            )
        })?;

        if meta.len() == 0 {
            return Err(ParseFailure::new(
                ParseErrorKind::Structural,
                format!("manifest is empty: {}", path.display()),
            ));
        }
        if meta.len() > self.config.max_file_size_bytes {
            return Err(ParseFailure::new(
                ParseErrorKind::TooLarge,
                format!(
                    "manifest too large: {} bytes (limit {})",
                    meta.len(),
                    self.config.max_file_size_bytes
                ),
            ));
        }
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ParseFailure::new(
                ParseErrorKind::Structural,
                format!("not a .json file: {}", path.display()),
            ));
        }

        let bytes = match tokio::time::timeout(self.config.read_timeout(), tokio::fs::read(path))
            .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                return Err(ParseFailure::new(
                    ParseErrorKind::from_io(&err),
                    format!("cannot read {}: {}", path.display(), err),
                ));
            }
            Err(_) => {
                return Err(ParseFailure::new(
                    ParseErrorKind::Timeout,
                    format!(
                        "read timed out after {}s: {}",
                        self.config.read_timeout_secs,
                        path.display()
                    ),
                ));
            }
        };

        // Invalid UTF-8 sequences are replaced rather than rejected; the
        // JSON decoder decides whether what remains is usable.
        let text = String::from_utf8_lossy(&bytes);
        serde_json::from_str(&text).map_err(|err| {
            ParseFailure::new(
                ParseErrorKind::Decode,
                format!(
                    "invalid JSON at line {} column {}: {}",
                    err.line(),
                    err.column(),
                    err
                ),
            )
        })
    }

    fn validate_and_normalize(
        &self,
        document: &Value,
        path: &Path,
        outcome: &mut ParseOutcome,
    ) -> Option<CanonicalRecord> {
        let object = match document.as_object() {
            Some(object) => object,
            None => {
                outcome.errors.push("manifest must be a JSON object".to_string());
                return None;
            }
        };

        for field in REQUIRED_FIELDS {
            match object.get(field) {
                None => outcome.errors.push(format!("missing required field: {}", field)),
                Some(Value::Null) => {
                    outcome.errors.push(format!("required field is null: {}", field))
                }
                Some(_) => {}
            }
        }

        let alias = self.validate_alias(object.get("alias"), outcome);
        let summary = self.validate_summary(object.get("summary"), outcome);
        let attck = self.normalize_techniques(object.get("attck"), outcome);

        if !outcome.errors.is_empty() {
            return None;
        }
        let alias = alias?;
        let summary = summary?;
        let attck = attck?;

        let status = match object.get("status").and_then(Value::as_str) {
            Some(raw) => {
                let status = RecordStatus::parse(raw);
                if !status.is_known() {
                    outcome
                        .warnings
                        .push(format!("unrecognized status value: {}", raw));
                }
                status
            }
            None => {
                outcome.errors.push("status must be a string".to_string());
                return None;
            }
        };

        let tries = coerce_tries(object.get("tries"), outcome);
        if !outcome.errors.is_empty() {
            return None;
        }
        let identity = self.resolver.resolve(path);

        let hash_id = match field_string(object, "hash_id") {
            Some(hash) => hash,
            None => match &identity {
                Some(identity) => {
                    outcome
                        .warnings
                        .push(format!("hash_id derived from path: {}", identity.hash_id));
                    identity.hash_id.clone()
                }
                None => {
                    let digest = hex_digest(&alias);
                    outcome
                        .warnings
                        .push("hash_id missing, derived from alias digest".to_string());
                    digest
                }
            },
        };

        if let Some(identity) = &identity {
            if identity.alias != alias {
                outcome.warnings.push(format!(
                    "alias mismatch: manifest says '{}', directory says '{}'",
                    alias, identity.alias
                ));
            }
        }

        let source_path = field_string(object, "cpp_filepath").or_else(|| {
            identity
                .as_ref()
                .map(|id| sibling_source_path(path, &id.alias))
        });

        Some(CanonicalRecord {
            hash_id,
            alias,
            summary,
            status,
            attck,
            root_function: field_string(object, "root_function"),
            source_code: field_string(object, "generated_cpp"),
            source_path,
            manifest_path: Some(path.display().to_string()),
            tries,
            children: collect_children(object.get("children_aliases"), outcome),
            manifest_json: document.clone(),
        })
    }

    fn validate_alias(&self, value: Option<&Value>, outcome: &mut ParseOutcome) -> Option<String> {
        let value = value?;
        let alias = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => return None,
            _ => {
                outcome.errors.push("alias must be a string".to_string());
                return None;
            }
        };
        if alias.is_empty() {
            outcome.errors.push("alias must not be empty".to_string());
            return None;
        }
        let chars = alias.chars().count();
        if chars > 255 {
            outcome
                .errors
                .push(format!("alias too long: {} > 255 characters", chars));
            return None;
        }
        Some(alias)
    }

    fn validate_summary(&self, value: Option<&Value>, outcome: &mut ParseOutcome) -> Option<String> {
        let value = value?;
        let summary = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => return None,
            other => {
                outcome.warnings.push(format!(
                    "summary coerced to string from {}",
                    json_type_name(other)
                ));
                other.to_string()
            }
        };
        if summary.is_empty() {
            outcome.errors.push("summary must not be empty".to_string());
            return None;
        }
        Some(summary)
    }

    /// Normalize the technique list: strip `:description` suffixes,
    /// uppercase, validate against `T####` / `T####.###`, and in
    /// non-strict mode repair common malformations.
    fn normalize_techniques(
        &self,
        value: Option<&Value>,
        outcome: &mut ParseOutcome,
    ) -> Option<Vec<String>> {
        let value = value?;
        let items = match value {
            Value::Array(items) => items,
            Value::Null => return None,
            _ => {
                outcome.errors.push("attck must be an array".to_string());
                return None;
            }
        };
        if items.is_empty() {
            outcome
                .errors
                .push("attck must contain at least one technique ID".to_string());
            return None;
        }

        let mut normalized = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let raw = match item {
                Value::String(s) => s.trim().to_string(),
                other => {
                    outcome.errors.push(format!(
                        "attck[{}] must be a string, got {}",
                        index,
                        json_type_name(other)
                    ));
                    continue;
                }
            };
            if raw.is_empty() {
                outcome
                    .errors
                    .push(format!("attck[{}] must not be empty", index));
                continue;
            }

            // `T1055.001:process injection` carries a free-text suffix.
            let (id_part, suffix) = match raw.split_once(':') {
                Some((id, rest)) => (id.trim().to_string(), Some(rest.trim().to_string())),
                None => (raw.clone(), None),
            };
            let candidate = id_part.to_uppercase();

            if !self.config.validate_technique_ids {
                normalized.push(candidate);
                continue;
            }

            if self.technique_id.is_match(&candidate) {
                if let Some(suffix) = suffix {
                    if !suffix.is_empty() {
                        outcome.warnings.push(format!(
                            "technique suffix dropped: '{}' -> '{}'",
                            raw, candidate
                        ));
                    }
                }
                normalized.push(candidate);
                continue;
            }

            if self.config.strict_mode {
                outcome
                    .errors
                    .push(format!("invalid technique ID: '{}'", raw));
                continue;
            }

            match self.repair_technique_id(&id_part) {
                Some(repaired) => {
                    outcome
                        .warnings
                        .push(format!("technique ID repaired: '{}' -> '{}'", raw, repaired));
                    normalized.push(repaired);
                }
                None => {
                    outcome
                        .errors
                        .push(format!("unrepairable technique ID: '{}'", raw));
                }
            }
        }

        if !outcome.errors.is_empty() {
            return None;
        }
        Some(normalized)
    }

    /// Repair strategies for malformed technique IDs, tried in order:
    /// bare four digits gain a `T` prefix, otherwise a valid `T####` or
    /// `T####.###` prefix is extracted and the tail discarded.
    fn repair_technique_id(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Some(format!("T{}", trimmed));
        }
        self.technique_prefix
            .find(trimmed)
            .map(|m| m.as_str().to_uppercase())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn field_string(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Coerce `tries` to an integer attempt count, floor 1. A negative count
/// can only come from a corrupt manifest and is an error.
fn coerce_tries(value: Option<&Value>, outcome: &mut ParseOutcome) -> i32 {
    let coerced = match value {
        None | Some(Value::Null) => return 1,
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };
    match coerced {
        Some(n) if n > 1000 => {
            outcome
                .warnings
                .push(format!("suspiciously large tries value: {}", n));
            n.min(i32::MAX as i64) as i32
        }
        Some(n) if n >= 1 => n as i32,
        Some(0) => {
            outcome
                .warnings
                .push("tries is 0, using 1".to_string());
            1
        }
        Some(n) => {
            outcome
                .errors
                .push(format!("tries must not be negative: {}", n));
            1
        }
        None => {
            outcome
                .warnings
                .push("tries is not numeric, using 1".to_string());
            1
        }
    }
}

/// `children_aliases` maps function names either to a bare alias string or
/// to an object carrying `alias` and `description`.
fn collect_children(value: Option<&Value>, outcome: &mut ParseOutcome) -> Vec<ChildFunction> {
    let object = match value {
        Some(Value::Object(object)) => object,
        Some(Value::Null) | None => return Vec::new(),
        Some(other) => {
            outcome.warnings.push(format!(
                "children_aliases ignored: expected object, got {}",
                json_type_name(other)
            ));
            return Vec::new();
        }
    };

    let mut children = Vec::with_capacity(object.len());
    for (name, entry) in object {
        match entry {
            Value::String(alias) => children.push(ChildFunction {
                name: name.clone(),
                alias: alias.trim().to_string(),
                description: String::new(),
            }),
            Value::Object(fields) => children.push(ChildFunction {
                name: name.clone(),
                alias: fields
                    .get("alias")
                    .and_then(Value::as_str)
                    .unwrap_or(name)
                    .trim()
                    .to_string(),
                description: fields
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            }),
            other => outcome.warnings.push(format!(
                "child entry '{}' ignored: expected string or object, got {}",
                name,
                json_type_name(other)
            )),
        }
    }
    children
}

fn hex_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sibling_source_path(manifest_path: &Path, alias: &str) -> String {
    let dir = manifest_path.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("{}.cpp", alias)).display().to_string()
}

//! Import progress reporting.
//!
//! The pipeline reports `(current, total, message)` through a single
//! callback so callers can drive a TUI, a log, or nothing at all.
//! Built-in reporters emit on **stderr** so stdout remains parseable
//! for scripts. A panicking callback is contained; it never takes the
//! import down with it.

use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

/// Observer for pipeline progress: `(current, total, message)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Invoke a progress callback, absorbing panics.
pub fn emit(callback: &Option<ProgressCallback>, current: u64, total: u64, message: &str) {
    if let Some(callback) = callback {
        let result = catch_unwind(AssertUnwindSafe(|| callback(current, total, message)));
        if result.is_err() {
            warn!(current, total, "progress callback panicked; continuing");
        }
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build the callback for this mode, or `None` when progress is off.
    pub fn reporter(&self) -> Option<ProgressCallback> {
        match self {
            ProgressMode::Off => None,
            ProgressMode::Human => Some(Arc::new(|current, total, message| {
                let line = if total > 0 {
                    format!(
                        "import  {} / {}  {}\n",
                        format_number(current),
                        format_number(total),
                        message
                    )
                } else {
                    format!("import  {}\n", message)
                };
                let _ = std::io::stderr().lock().write_all(line.as_bytes());
                let _ = std::io::stderr().lock().flush();
            })),
            ProgressMode::Json => Some(Arc::new(|current, total, message| {
                let obj = serde_json::json!({
                    "event": "progress",
                    "current": current,
                    "total": total,
                    "message": message,
                });
                if let Ok(line) = serde_json::to_string(&obj) {
                    let _ = writeln!(std::io::stderr().lock(), "{}", line);
                    let _ = std::io::stderr().lock().flush();
                }
            })),
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len().saturating_sub(1)) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn panicking_callback_is_contained() {
        let callback: ProgressCallback = Arc::new(|_, _, _| panic!("observer bug"));
        emit(&Some(callback), 1, 10, "parsing");
    }

    #[test]
    fn callback_receives_counts() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = seen.clone();
        let callback: ProgressCallback = Arc::new(move |current, _, _| {
            seen2.store(current, Ordering::SeqCst);
        });
        emit(&Some(callback), 7, 10, "importing");
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}

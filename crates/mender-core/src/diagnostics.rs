//! Diagnostics: pull line/column locations out of interpreter and compiler errors

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::warn;

use crate::language::Language;

static PY_FRAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile_pattern("python_frame", r#"File "[^"]*", line (\d+)"#));

static PY_EXCEPTION: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile_pattern(
        "python_exception",
        r"^([A-Za-z_][A-Za-z0-9_.]*(?:Error|Exception|Warning|Interrupt|Exit))(?::\s*(.*))?$",
    )
});

static GCC_DIAGNOSTIC: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile_pattern(
        "gcc_diagnostic",
        r"^[^:\n]+:(\d+):(\d+):\s*(fatal error|error|warning):\s*(.+)$",
    )
});

fn compile_pattern(name: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("Failed to compile diagnostic pattern '{}': {}", name, e);
            None
        }
    }
}

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A located error message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: u32,
    pub column: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

/// Parse error output for `language` into located diagnostics.
///
/// Entries without a usable line number are dropped.
pub fn parse(language: Language, error_text: &str) -> Vec<Diagnostic> {
    if error_text.trim().is_empty() {
        return Vec::new();
    }
    match language {
        Language::Python => parse_python(error_text),
        Language::Cpp => parse_gcc(error_text),
    }
}

/// A Python traceback yields one diagnostic: the innermost frame plus the
/// exception line that follows it.
fn parse_python(text: &str) -> Vec<Diagnostic> {
    let (Some(frame), Some(exception)) = (PY_FRAME.as_ref(), PY_EXCEPTION.as_ref()) else {
        return Vec::new();
    };
    let mut line = None;
    let mut message = None;

    for raw in text.lines() {
        if let Some(caps) = frame.captures(raw) {
            line = caps[1].parse::<u32>().ok();
            continue;
        }
        let trimmed = raw.trim();
        if let Some(caps) = exception.captures(trimmed) {
            message = Some(match caps.get(2) {
                Some(detail) if !detail.as_str().is_empty() => {
                    format!("{}: {}", &caps[1], detail.as_str())
                }
                _ => caps[1].to_string(),
            });
        }
    }

    match (line, message) {
        (Some(line), Some(message)) if line > 0 => vec![Diagnostic {
            line,
            column: None,
            severity: Severity::Error,
            message,
        }],
        _ => Vec::new(),
    }
}

fn parse_gcc(text: &str) -> Vec<Diagnostic> {
    let Some(pattern) = GCC_DIAGNOSTIC.as_ref() else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|raw| {
            let caps = pattern.captures(raw.trim_end())?;
            let line = caps[1].parse::<u32>().ok().filter(|l| *l > 0)?;
            let severity = if &caps[3] == "warning" {
                Severity::Warning
            } else {
                Severity::Error
            };
            Some(Diagnostic {
                line,
                column: caps[2].parse().ok(),
                severity,
                message: caps[4].trim().to_string(),
            })
        })
        .collect()
}

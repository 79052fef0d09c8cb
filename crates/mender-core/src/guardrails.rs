//! Safety gate: lexical blocklist check for submitted and AI-generated code
//!
//! This is a shallow substring filter, not an isolation boundary. It cannot
//! see through string concatenation, aliasing (`import os as o` is caught,
//! `importlib.import_module("o" + "s")` is not), macros, or any semantically
//! equivalent construct. Real isolation has to come from the execution
//! environment; the gate only stops the obvious cases cheaply.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Terms rejected by default, matched against the lowercased snippet.
///
/// Order matters: the first hit is the one reported.
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    "import os",
    "import sys",
    "import subprocess",
    "from os",
    "from sys",
    "from subprocess",
    "eval(",
    "exec(",
    "open(",
    "__import__",
    "os.system",
    "subprocess.",
    "shutil.",
    "#include <filesystem>",
    "#include <cstdlib>",
    "system(",
    "popen(",
    "fork(",
];

/// Outcome of a safety check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    /// Human-readable reason naming the matched term
    pub reason: Option<String>,
    /// The blocklist entry that matched
    pub matched: Option<String>,
}

impl SafetyVerdict {
    pub fn pass() -> Self {
        Self {
            safe: true,
            reason: None,
            matched: None,
        }
    }

    pub fn blocked(term: &str) -> Self {
        Self {
            safe: false,
            reason: Some(format!("Blocked keyword detected: {}", term)),
            matched: Some(term.to_string()),
        }
    }
}

/// Stateless blocklist filter
#[derive(Debug, Clone)]
pub struct SafetyGate {
    terms: Vec<String>,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyGate {
    /// Gate with the default blocklist
    pub fn new() -> Self {
        Self {
            terms: DEFAULT_BLOCKLIST.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Default blocklist plus extra terms (lowercased, blanks and duplicates dropped)
    pub fn with_extra_terms<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut gate = Self::new();
        for term in extra {
            let term = term.as_ref().trim().to_lowercase();
            if term.is_empty() || gate.terms.contains(&term) {
                continue;
            }
            debug!("Safety gate: adding extra term '{}'", term);
            gate.terms.push(term);
        }
        gate
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Scan `code` and report the first blocklisted term it contains
    pub fn check(&self, code: &str) -> SafetyVerdict {
        let lowered = code.to_lowercase();
        match self.terms.iter().find(|term| lowered.contains(term.as_str())) {
            Some(term) => {
                warn!("Safety gate: blocked snippet (matched '{}')", term);
                SafetyVerdict::blocked(term)
            }
            None => SafetyVerdict::pass(),
        }
    }
}

//! Supported snippet languages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RequestError;

/// A language the sandbox knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Cpp];

    /// Canonical lowercase name, as accepted on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Cpp => "cpp",
        }
    }

    /// Source file extension (without the dot)
    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Cpp => "cpp",
        }
    }

    /// Whether a compile step runs before execution
    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::Cpp)
    }

    /// Human-facing name, used in prompts
    pub fn display_name(&self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::Cpp => "C++",
        }
    }

    /// Guess the language from a file extension (`py`, `cpp`, `cc`, `cxx`)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "py" => Some(Language::Python),
            "cpp" | "cc" | "cxx" | "c++" => Some(Language::Cpp),
            _ => None,
        }
    }

    /// Comma-separated list of supported names, for error messages
    pub fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "cpp" | "c++" => Ok(Language::Cpp),
            other => Err(RequestError::UnsupportedLanguage(other.to_string())),
        }
    }
}

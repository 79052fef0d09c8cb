//! Execution policy: time and output limits plus toolchain commands

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::language::Language;

/// Resource limits for a single sandboxed run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock limit for running the program
    pub timeout_secs: u64,
    /// Wall-clock limit for the compile step of compiled languages
    pub compile_timeout_secs: u64,
    /// Captured bytes kept per stream; the rest is drained and dropped
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            compile_timeout_secs: 10,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Interpreter and compiler invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Toolchain {
    pub python: String,
    pub python_args: Vec<String>,
    pub cpp_compiler: String,
    pub cpp_flags: Vec<String>,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            python_args: Vec::new(),
            cpp_compiler: "g++".to_string(),
            cpp_flags: Vec::new(),
        }
    }
}

/// Full sandbox configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory for source files and binaries (system temp dir when unset)
    pub work_dir: Option<PathBuf>,
    pub limits: ResourceLimits,
    pub toolchain: Toolchain,
}

impl SandboxConfig {
    /// Directory artifacts are written to
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Command that runs a prepared program.
    ///
    /// `artifact` is the source file for interpreted languages and the
    /// compiled binary for compiled ones.
    pub fn run_command_for(&self, language: Language, artifact: &Path) -> Vec<String> {
        let artifact = artifact.display().to_string();
        match language {
            Language::Python => {
                let mut argv = vec![self.toolchain.python.clone()];
                argv.extend(self.toolchain.python_args.iter().cloned());
                argv.push(artifact);
                argv
            }
            Language::Cpp => vec![artifact],
        }
    }

    /// Command that compiles `source` into `binary`, if the language needs one
    pub fn compile_command_for(
        &self,
        language: Language,
        source: &Path,
        binary: &Path,
    ) -> Option<Vec<String>> {
        match language {
            Language::Python => None,
            Language::Cpp => {
                let mut argv = vec![self.toolchain.cpp_compiler.clone()];
                argv.extend(self.toolchain.cpp_flags.iter().cloned());
                argv.push(source.display().to_string());
                argv.push("-o".to_string());
                argv.push(binary.display().to_string());
                Some(argv)
            }
        }
    }

    /// Binary that must be on PATH to run `language`
    pub fn toolchain_binary(&self, language: Language) -> &str {
        match language {
            Language::Python => &self.toolchain.python,
            Language::Cpp => &self.toolchain.cpp_compiler,
        }
    }
}

//! Structured outcome of one sandboxed run

use serde::{Deserialize, Serialize};
use std::fmt;

/// Text used when a failed run left no stderr and no failure reason
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// The stage a run ended in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStage {
    /// Preparing artifacts, before any process started
    Setup,
    Compile,
    Run,
}

/// Why a run failed, when the failure is not a plain nonzero exit of the program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The compiler rejected the snippet; stderr holds its diagnostics
    CompilationFailed,
    TimedOut,
    /// Infrastructure trouble: temp file, spawn, wait
    Internal(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::CompilationFailed => write!(f, "compilation failed"),
            FailureReason::TimedOut => write!(f, "timed out"),
            FailureReason::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub stage: ExecutionStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Program exited 0
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            succeeded: true,
            stdout,
            stderr,
            failure_reason: None,
            stage: ExecutionStage::Run,
            exit_code: Some(0),
            duration_ms: 0,
        }
    }

    /// Program ran and exited nonzero (or was killed by a signal)
    pub fn runtime_failure(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            succeeded: false,
            stdout,
            stderr,
            failure_reason: None,
            stage: ExecutionStage::Run,
            exit_code,
            duration_ms: 0,
        }
    }

    /// Compiler exited nonzero
    pub fn compile_failure(stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            succeeded: false,
            stdout: String::new(),
            stderr,
            failure_reason: Some(FailureReason::CompilationFailed),
            stage: ExecutionStage::Compile,
            exit_code,
            duration_ms: 0,
        }
    }

    /// Wall-clock limit hit; output is discarded
    pub fn timed_out(stage: ExecutionStage) -> Self {
        Self {
            succeeded: false,
            stdout: String::new(),
            stderr: String::new(),
            failure_reason: Some(FailureReason::TimedOut),
            stage,
            exit_code: None,
            duration_ms: 0,
        }
    }

    pub fn internal(stage: ExecutionStage, message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            stdout: String::new(),
            stderr: String::new(),
            failure_reason: Some(FailureReason::Internal(message.into())),
            stage,
            exit_code: None,
            duration_ms: 0,
        }
    }

    pub fn is_compile_failure(&self) -> bool {
        matches!(self.failure_reason, Some(FailureReason::CompilationFailed))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.failure_reason, Some(FailureReason::TimedOut))
    }

    /// Text handed to a fix provider: stderr, else the failure reason, else a placeholder
    pub fn error_signal(&self) -> String {
        if !self.stderr.trim().is_empty() {
            return self.stderr.clone();
        }
        match &self.failure_reason {
            Some(reason) => reason.to_string(),
            None => UNKNOWN_ERROR.to_string(),
        }
    }
}

//! mender-core: sandboxed snippet execution and the AI fix-and-retry loop

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod guardrails;
pub mod language;
pub mod providers;
pub mod retry;
pub mod sandbox;
pub mod service;

pub use config::MenderConfig;
pub use error::{RequestError, SessionError};
pub use guardrails::{SafetyGate, SafetyVerdict};
pub use language::Language;
pub use providers::{FixProposal, FixProvider, FixResult, Provenance};
pub use retry::{
    Attempt, NoFixPolicy, RetryOrchestrator, RetrySession, SessionState, SessionSummary,
};
pub use sandbox::{CodeRunner, ExecutionResult, ExecutionStage, FailureReason, ProcessSandbox};
pub use service::{DebugReport, DebugService};

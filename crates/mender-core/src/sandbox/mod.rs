//! Sandbox: run one snippet and describe the outcome
//!
//! The default runner starts the interpreter or compiler as a local child
//! process under a wall-clock limit. It offers no filesystem, network or
//! memory isolation; swap in another `CodeRunner` for that.

pub mod policy;
pub mod process;
pub mod result;

use async_trait::async_trait;

use crate::language::Language;

pub use policy::{ResourceLimits, SandboxConfig, Toolchain};
pub use process::ProcessSandbox;
pub use result::{ExecutionResult, ExecutionStage, FailureReason};

/// Something that can execute a snippet.
///
/// Implementations never fail: every problem, including their own, is
/// reported on the returned `ExecutionResult`.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, language: Language, code: &str) -> ExecutionResult;
}

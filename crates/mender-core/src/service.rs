//! Debug service: request validation in front of the sandbox and the retry loop

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MenderConfig;
use crate::diagnostics::{self, Diagnostic};
use crate::error::{RequestError, SessionError};
use crate::guardrails::{SafetyGate, SafetyVerdict};
use crate::language::Language;
use crate::providers::{FixProvider, FixResult, build_provider_or_unconfigured};
use crate::retry::{
    Attempt, FixPipeline, RetryOrchestrator, SessionRegistry, SessionSummary,
};
use crate::sandbox::{CodeRunner, ExecutionResult, ProcessSandbox};

/// Result of a single run plus, on failure, one fix suggestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugReport {
    pub result: ExecutionResult,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub fix: Option<FixResult>,
}

/// Entry point shared by the CLI and the gateway
pub struct DebugService {
    config: MenderConfig,
    orchestrator: RetryOrchestrator,
}

impl DebugService {
    /// Local process sandbox and the configured providers.
    /// Providers without a key are replaced by ones that always fail.
    pub fn from_config(config: MenderConfig) -> Self {
        let runner: Arc<dyn CodeRunner> = Arc::new(ProcessSandbox::new(config.sandbox.clone()));
        let primary = build_provider_or_unconfigured(&config.providers.primary);
        let fallback = config
            .providers
            .fallback
            .as_ref()
            .map(build_provider_or_unconfigured);
        Self::with_components(config, runner, primary, fallback)
    }

    pub fn with_components(
        config: MenderConfig,
        runner: Arc<dyn CodeRunner>,
        primary: Arc<dyn FixProvider>,
        fallback: Option<Arc<dyn FixProvider>>,
    ) -> Self {
        let gate = SafetyGate::with_extra_terms(&config.safety.extra_terms);
        let fixer = FixPipeline::new(
            primary,
            fallback,
            gate,
            Duration::from_secs(config.retry.provider_timeout_secs),
        );
        let registry = SessionRegistry::new(config.retry.max_sessions);
        let orchestrator = RetryOrchestrator::new(runner, fixer, registry, config.retry.on_no_fix);
        Self {
            config,
            orchestrator,
        }
    }

    pub fn config(&self) -> &MenderConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &RetryOrchestrator {
        &self.orchestrator
    }

    pub fn gate(&self) -> &SafetyGate {
        self.orchestrator.fixer().gate()
    }

    pub fn check(&self, code: &str) -> SafetyVerdict {
        self.gate().check(code)
    }

    /// Language, length and safety checks, in that order
    pub fn validate(&self, language: &str, code: &str) -> Result<Language, RequestError> {
        let language: Language = language.parse()?;

        if code.trim().is_empty() {
            return Err(RequestError::EmptyCode);
        }
        let len = code.chars().count();
        let max = self.config.retry.max_code_length;
        if len > max {
            return Err(RequestError::CodeTooLong { len, max });
        }

        let verdict = self.check(code);
        if !verdict.safe {
            return Err(RequestError::Unsafe(verdict.reason.unwrap_or_default()));
        }
        Ok(language)
    }

    /// Apply the default and the accepted range to a requested budget
    pub fn resolve_max_attempts(&self, requested: Option<u32>) -> Result<u32, RequestError> {
        let retry = &self.config.retry;
        let max_attempts = requested.unwrap_or(retry.default_max_attempts);
        if !(1..=retry.max_attempts_limit).contains(&max_attempts) {
            return Err(RequestError::InvalidMaxAttempts {
                got: max_attempts,
                max: retry.max_attempts_limit,
            });
        }
        Ok(max_attempts)
    }

    pub async fn execute(&self, language: &str, code: &str) -> Result<ExecutionResult, RequestError> {
        let language = self.validate(language, code)?;
        Ok(self.orchestrator.runner().run(language, code).await)
    }

    /// Run once; on failure ask for a single fix
    pub async fn debug_once(&self, language: &str, code: &str) -> Result<DebugReport, RequestError> {
        let language = self.validate(language, code)?;
        let result = self.orchestrator.runner().run(language, code).await;
        if result.succeeded {
            return Ok(DebugReport {
                result,
                diagnostics: Vec::new(),
                fix: None,
            });
        }

        let signal = result.error_signal();
        let diagnostics = diagnostics::parse(language, &signal);
        debug!("Debug request failed, asking for a fix");
        let fix = self.orchestrator.fixer().fix(language, code, &signal).await;
        Ok(DebugReport {
            result,
            diagnostics,
            fix: Some(fix),
        })
    }

    pub async fn run_session(
        &self,
        language: &str,
        code: &str,
        max_attempts: Option<u32>,
    ) -> Result<SessionSummary, SessionError> {
        self.run_session_with_cancel(language, code, max_attempts, CancellationToken::new())
            .await
    }

    pub async fn run_session_with_cancel(
        &self,
        language: &str,
        code: &str,
        max_attempts: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, SessionError> {
        let language = self.validate(language, code)?;
        let max_attempts = self.resolve_max_attempts(max_attempts)?;
        info!("Auto-retry session: {} snippet, up to {} attempts", language, max_attempts);
        self.orchestrator
            .run_session_with_cancel(language, code, max_attempts, cancel)
            .await
    }

    pub async fn start_session(
        &self,
        language: &str,
        code: &str,
        max_attempts: Option<u32>,
    ) -> Result<SessionSummary, SessionError> {
        let language = self.validate(language, code)?;
        let max_attempts = self.resolve_max_attempts(max_attempts)?;
        self.orchestrator
            .start_session(language, code, max_attempts)
            .await
    }

    pub async fn step(&self, id: &str) -> Result<Attempt, SessionError> {
        self.orchestrator.step(id).await
    }

    pub async fn session(&self, id: &str) -> Result<SessionSummary, SessionError> {
        self.orchestrator.session(id).await
    }

    pub async fn delete_session(&self, id: &str) -> Result<SessionSummary, SessionError> {
        self.orchestrator.remove_session(id).await
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.orchestrator.list_sessions().await
    }
}

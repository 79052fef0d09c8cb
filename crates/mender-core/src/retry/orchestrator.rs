//! Retry orchestrator: execute, fix, validate, replace, repeat

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fix::FixPipeline;
use super::registry::{SessionHandle, SessionMode, SessionRegistry};
use super::session::{Attempt, NoFixPolicy, RetrySession, SessionState, SessionSummary};
use crate::config::MAX_ATTEMPTS_CEILING;
use crate::diagnostics;
use crate::error::{RequestError, SessionError};
use crate::language::Language;
use crate::sandbox::CodeRunner;

/// Drives retry sessions and owns the registry they live in
pub struct RetryOrchestrator {
    runner: Arc<dyn CodeRunner>,
    fixer: FixPipeline,
    registry: SessionRegistry,
    on_no_fix: NoFixPolicy,
}

impl RetryOrchestrator {
    pub fn new(
        runner: Arc<dyn CodeRunner>,
        fixer: FixPipeline,
        registry: SessionRegistry,
        on_no_fix: NoFixPolicy,
    ) -> Self {
        Self {
            runner,
            fixer,
            registry,
            on_no_fix,
        }
    }

    pub fn runner(&self) -> &Arc<dyn CodeRunner> {
        &self.runner
    }

    pub fn fixer(&self) -> &FixPipeline {
        &self.fixer
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn no_fix_policy(&self) -> NoFixPolicy {
        self.on_no_fix
    }

    /// Run a whole session in one call. The session is evicted before returning.
    pub async fn run_session(
        &self,
        language: Language,
        code: &str,
        max_attempts: u32,
    ) -> Result<SessionSummary, SessionError> {
        self.run_session_with_cancel(language, code, max_attempts, CancellationToken::new())
            .await
    }

    /// Like [`run_session`](Self::run_session), stopping between attempts once
    /// `cancel` fires
    pub async fn run_session_with_cancel(
        &self,
        language: Language,
        code: &str,
        max_attempts: u32,
        cancel: CancellationToken,
    ) -> Result<SessionSummary, SessionError> {
        let handle = self
            .register(language, code, max_attempts, SessionMode::Batch, cancel.child_token())
            .await?;

        while !handle.state().read().await.is_complete() {
            match self.advance(&handle).await {
                Ok(_) => {}
                Err(SessionError::Cancelled(_)) | Err(SessionError::AlreadyComplete(_)) => break,
                Err(e) => {
                    self.evict(handle.id()).await;
                    return Err(e);
                }
            }
        }

        let summary = handle.summary().await;
        self.evict(handle.id()).await;
        info!(
            "Session {} finished: {} after {} attempt(s) in {:.2}s",
            summary.session_id, summary.state, summary.total_attempts, summary.elapsed_seconds
        );
        Ok(summary)
    }

    /// Register a session without running it; drive it with [`step`](Self::step)
    pub async fn start_session(
        &self,
        language: Language,
        code: &str,
        max_attempts: u32,
    ) -> Result<SessionSummary, SessionError> {
        let handle = self
            .register(language, code, max_attempts, SessionMode::Paced, CancellationToken::new())
            .await?;
        Ok(handle.summary().await)
    }

    /// Run exactly one attempt of a registered session
    pub async fn step(&self, id: &str) -> Result<Attempt, SessionError> {
        let handle = self.registry.get(id).await?;
        self.advance(&handle).await
    }

    pub async fn session(&self, id: &str) -> Result<SessionSummary, SessionError> {
        Ok(self.registry.get(id).await?.summary().await)
    }

    /// Delete a session, cancelling it if something is still driving it
    pub async fn remove_session(&self, id: &str) -> Result<SessionSummary, SessionError> {
        let handle = self.registry.remove(id).await?;
        Ok(handle.summary().await)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list().await
    }

    async fn register(
        &self,
        language: Language,
        code: &str,
        max_attempts: u32,
        mode: SessionMode,
        cancel: CancellationToken,
    ) -> Result<Arc<SessionHandle>, SessionError> {
        if !(1..=MAX_ATTEMPTS_CEILING).contains(&max_attempts) {
            return Err(RequestError::InvalidMaxAttempts {
                got: max_attempts,
                max: MAX_ATTEMPTS_CEILING,
            }
            .into());
        }
        let id = format!("retry_{}", uuid::Uuid::new_v4().simple());
        let session = RetrySession::new(id, language, code.to_string(), max_attempts);
        self.registry.insert(session, mode, cancel).await
    }

    async fn evict(&self, id: &str) {
        if let Err(e) = self.registry.remove(id).await {
            debug!("Session {} already gone: {}", id, e);
        }
    }

    /// One iteration of the loop: run, and on failure fetch the next code
    async fn advance(&self, handle: &SessionHandle) -> Result<Attempt, SessionError> {
        let _run = handle.lock_run().await;

        let (language, code, index, max_attempts) = {
            let mut session = handle.state().write().await;
            if session.state == SessionState::Cancelled {
                return Err(SessionError::Cancelled(session.id.clone()));
            }
            if session.is_complete() {
                return Err(SessionError::AlreadyComplete(session.id.clone()));
            }
            if handle.cancel_token().is_cancelled() {
                session.finish(SessionState::Cancelled);
                info!("Session {} cancelled before attempt {}", session.id, session.next_index());
                return Err(SessionError::Cancelled(session.id.clone()));
            }
            (
                session.language,
                session.current_code.clone(),
                session.next_index(),
                session.max_attempts,
            )
        };

        debug!(
            "Session {}: attempt {}/{} ({} bytes)",
            handle.id(),
            index,
            max_attempts,
            code.len()
        );
        let timestamp = chrono::Utc::now();
        let result = self.runner.run(language, &code).await;

        let mut fix = None;
        let mut next_code = None;
        let mut outcome = None;
        let mut diagnostics = Vec::new();

        if result.succeeded {
            outcome = Some(SessionState::Succeeded);
        } else {
            let signal = result.error_signal();
            diagnostics = diagnostics::parse(language, &signal);

            if index >= max_attempts {
                outcome = Some(SessionState::Exhausted);
            } else {
                let proposed = self.fixer.fix(language, &code, &signal).await;
                if proposed.is_usable() {
                    next_code = Some(proposed.fixed_code.clone());
                } else {
                    match self.on_no_fix {
                        NoFixPolicy::RetryUnchanged => {
                            warn!(
                                "Session {}: no usable fix after attempt {}, retrying unchanged code",
                                handle.id(),
                                index
                            );
                        }
                        NoFixPolicy::Abort => {
                            warn!(
                                "Session {}: no usable fix after attempt {}, aborting",
                                handle.id(),
                                index
                            );
                            outcome = Some(SessionState::Aborted);
                        }
                    }
                }
                fix = Some(proposed);
            }
        }

        let attempt = Attempt {
            index,
            code_used: code,
            succeeded: result.succeeded,
            execution_result: result,
            fix,
            diagnostics,
            timestamp,
        };

        handle
            .state()
            .write()
            .await
            .record(attempt.clone(), next_code, outcome);

        info!(
            "Session {}: attempt {} {}{}",
            handle.id(),
            index,
            if attempt.succeeded { "succeeded" } else { "failed" },
            match outcome {
                Some(state) => format!(", session {}", state),
                None => String::new(),
            }
        );
        Ok(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::SafetyGate;
    use crate::providers::{FixProvider, Provenance};
    use crate::retry::fix::testing::{Reply, ScriptedProvider};
    use crate::sandbox::{ExecutionResult, ProcessSandbox, SandboxConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Succeeds when the code contains `pass_marker`, otherwise fails with a traceback
    struct ScriptedRunner {
        pass_marker: &'static str,
        calls: AtomicUsize,
        delay: Duration,
        cancel_on_call: Option<CancellationToken>,
    }

    impl ScriptedRunner {
        fn new(pass_marker: &'static str) -> Arc<Self> {
            Arc::new(Self {
                pass_marker,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                cancel_on_call: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CodeRunner for ScriptedRunner {
        async fn run(&self, _language: Language, code: &str) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = &self.cancel_on_call {
                token.cancel();
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if code.contains(self.pass_marker) {
                ExecutionResult::success("8\n".into(), String::new())
            } else {
                ExecutionResult::runtime_failure(
                    String::new(),
                    "  File \"/tmp/x.py\", line 1\nSyntaxError: invalid syntax\n".into(),
                    Some(1),
                )
            }
        }
    }

    fn orchestrator(
        runner: Arc<dyn CodeRunner>,
        primary: Arc<ScriptedProvider>,
        fallback: Option<Arc<ScriptedProvider>>,
        on_no_fix: NoFixPolicy,
    ) -> RetryOrchestrator {
        let fixer = FixPipeline::new(
            primary,
            fallback.map(|f| f as Arc<dyn FixProvider>),
            SafetyGate::new(),
            Duration::from_millis(200),
        );
        RetryOrchestrator::new(runner, fixer, SessionRegistry::new(100), on_no_fix)
    }

    #[tokio::test]
    async fn test_never_succeeding_code_exhausts_budget() {
        let runner = ScriptedRunner::new("NEVER");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("print('still broken'")]);
        let orch = orchestrator(runner.clone(), primary.clone(), None, NoFixPolicy::default());

        let summary = orch.run_session(Language::Python, "print(", 4).await.unwrap();
        assert_eq!(summary.state, SessionState::Exhausted);
        assert!(summary.is_complete);
        assert!(!summary.succeeded);
        assert_eq!(summary.total_attempts, 4);
        assert_eq!(runner.calls(), 4);
        // No fix is requested after the final attempt
        assert_eq!(primary.calls(), 3);
        assert!(summary.attempts[3].fix.is_none());
        let indexes: Vec<u32> = summary.attempts.iter().map(|a| a.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_success_at_third_attempt() {
        let runner = ScriptedRunner::new("v3");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("v2"), Reply::Fix("v3")]);
        let orch = orchestrator(runner, primary.clone(), None, NoFixPolicy::default());

        let summary = orch.run_session(Language::Python, "v1", 5).await.unwrap();
        assert_eq!(summary.state, SessionState::Succeeded);
        assert_eq!(summary.total_attempts, 3);
        assert_eq!(summary.final_code, "v3");
        assert_eq!(summary.initial_code, "v1");
        assert_eq!(primary.calls(), 2);

        let last = summary.attempts.last().unwrap();
        assert!(last.succeeded);
        assert!(last.fix.is_none());
        assert!(last.diagnostics.is_empty());

        let first = &summary.attempts[0];
        assert_eq!(first.code_used, "v1");
        assert!(first.fix_applied());
        assert_eq!(first.diagnostics.len(), 1);
        assert_eq!(first.diagnostics[0].line, 1);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt_requests_no_fix() {
        let runner = ScriptedRunner::new("print");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("x")]);
        let orch = orchestrator(runner, primary.clone(), None, NoFixPolicy::default());

        let summary = orch.run_session(Language::Python, "print(8)", 1).await.unwrap();
        assert!(summary.succeeded);
        assert_eq!(summary.total_attempts, 1);
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_called_once_per_failed_attempt() {
        let runner = ScriptedRunner::new("NEVER");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let fallback = ScriptedProvider::new("fallback", vec![Reply::Fix("still broken")]);
        let orch = orchestrator(
            runner,
            primary.clone(),
            Some(fallback.clone()),
            NoFixPolicy::default(),
        );

        let summary = orch.run_session(Language::Python, "broken", 3).await.unwrap();
        assert_eq!(summary.total_attempts, 3);
        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 2);
        let fix = summary.attempts[0].fix.as_ref().unwrap();
        assert_eq!(fix.provenance, Provenance::Fallback);
    }

    #[tokio::test]
    async fn test_unsafe_fix_is_never_run() {
        let runner = ScriptedRunner::new("import os");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("import os\nprint(8)")]);
        let orch = orchestrator(runner, primary, None, NoFixPolicy::RetryUnchanged);

        let summary = orch.run_session(Language::Python, "broken", 3).await.unwrap();
        assert_eq!(summary.state, SessionState::Exhausted);
        for attempt in &summary.attempts {
            assert_eq!(attempt.code_used, "broken");
        }
        let fix = summary.attempts[0].fix.as_ref().unwrap();
        assert_eq!(fix.provenance, Provenance::None);
        assert!(fix.fixed_code.is_empty());
    }

    #[tokio::test]
    async fn test_no_fix_retry_unchanged_reruns_same_code() {
        let runner = ScriptedRunner::new("NEVER");
        let primary = ScriptedProvider::new("primary", vec![Reply::Empty]);
        let fallback = ScriptedProvider::new("fallback", vec![Reply::Fail]);
        let orch = orchestrator(runner.clone(), primary, Some(fallback), NoFixPolicy::RetryUnchanged);

        let summary = orch.run_session(Language::Python, "broken", 3).await.unwrap();
        assert_eq!(summary.state, SessionState::Exhausted);
        assert_eq!(summary.total_attempts, 3);
        assert_eq!(runner.calls(), 3);
        assert!(summary.attempts.iter().all(|a| a.code_used == "broken"));
    }

    #[tokio::test]
    async fn test_no_fix_abort_stops_after_first_attempt() {
        let runner = ScriptedRunner::new("NEVER");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let fallback = ScriptedProvider::new("fallback", vec![Reply::Empty]);
        let orch = orchestrator(runner.clone(), primary, Some(fallback), NoFixPolicy::Abort);

        let summary = orch.run_session(Language::Python, "broken", 5).await.unwrap();
        assert_eq!(summary.state, SessionState::Aborted);
        assert!(summary.is_complete);
        assert_eq!(summary.total_attempts, 1);
        assert_eq!(runner.calls(), 1);
        assert_eq!(
            summary.attempts[0].fix.as_ref().unwrap().provenance,
            Provenance::None
        );
    }

    #[tokio::test]
    async fn test_batch_run_evicts_session() {
        let runner = ScriptedRunner::new("ok");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let orch = orchestrator(runner, primary, None, NoFixPolicy::default());

        let summary = orch.run_session(Language::Python, "ok", 2).await.unwrap();
        assert!(summary.session_id.starts_with("retry_"));
        assert_eq!(orch.registry().count().await, 0);
        assert!(matches!(
            orch.session(&summary.session_id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_step_by_step_session() {
        let runner = ScriptedRunner::new("v2");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("v2")]);
        let orch = orchestrator(runner, primary, None, NoFixPolicy::default());

        let started = orch.start_session(Language::Python, "v1", 3).await.unwrap();
        assert_eq!(started.total_attempts, 0);
        assert_eq!(started.state, SessionState::Running);

        let first = orch.step(&started.session_id).await.unwrap();
        assert_eq!(first.index, 1);
        assert!(!first.succeeded);
        let mid = orch.session(&started.session_id).await.unwrap();
        assert_eq!(mid.total_attempts, 1);
        assert_eq!(mid.final_code, "v2");
        assert!(!mid.is_complete);

        let second = orch.step(&started.session_id).await.unwrap();
        assert!(second.succeeded);

        let err = orch.step(&started.session_id).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyComplete(_)));

        // Externally paced sessions stay until deleted
        let done = orch.remove_session(&started.session_id).await.unwrap();
        assert!(done.succeeded);
        assert_eq!(orch.registry().count().await, 0);
    }

    #[tokio::test]
    async fn test_step_after_delete_is_not_found() {
        let runner = ScriptedRunner::new("NEVER");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let orch = orchestrator(runner, primary, None, NoFixPolicy::default());

        let started = orch.start_session(Language::Cpp, "int main(", 3).await.unwrap();
        orch.remove_session(&started.session_id).await.unwrap();
        assert!(matches!(
            orch.step(&started.session_id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let runner = ScriptedRunner::new("NEVER");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("x")]);
        let orch = orchestrator(runner.clone(), primary, None, NoFixPolicy::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orch
            .run_session_with_cancel(Language::Python, "broken", 5, cancel)
            .await
            .unwrap();
        assert_eq!(summary.state, SessionState::Cancelled);
        assert_eq!(summary.total_attempts, 0);
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_between_attempts() {
        let cancel = CancellationToken::new();
        let runner = Arc::new(ScriptedRunner {
            pass_marker: "NEVER",
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            cancel_on_call: Some(cancel.clone()),
        });
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("still broken")]);
        let orch = orchestrator(runner.clone(), primary, None, NoFixPolicy::default());

        let summary = orch
            .run_session_with_cancel(Language::Python, "broken", 5, cancel)
            .await
            .unwrap();
        // The in-flight attempt completes, the next one never starts
        assert_eq!(summary.state, SessionState::Cancelled);
        assert_eq!(summary.total_attempts, 1);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_inspection_does_not_wait_for_running_attempt() {
        let runner = Arc::new(ScriptedRunner {
            pass_marker: "ok",
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(500),
            cancel_on_call: None,
        });
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let orch = Arc::new(orchestrator(runner, primary, None, NoFixPolicy::default()));

        let started = orch.start_session(Language::Python, "ok", 2).await.unwrap();
        let id = started.session_id.clone();
        let stepping = {
            let orch = orch.clone();
            let id = id.clone();
            tokio::spawn(async move { orch.step(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = tokio::time::timeout(Duration::from_millis(200), orch.session(&id))
            .await
            .expect("inspection blocked on a running attempt")
            .unwrap();
        assert_eq!(snapshot.total_attempts, 0);

        let attempt = stepping.await.unwrap().unwrap();
        assert!(attempt.succeeded);
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_independent() {
        let runner = ScriptedRunner::new("v2");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix("v2")]);
        let orch = orchestrator(runner, primary, None, NoFixPolicy::default());

        let (a, b) = tokio::join!(
            orch.run_session(Language::Python, "v1", 3),
            orch.run_session(Language::Cpp, "v1", 3),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.session_id, b.session_id);
        assert!(a.succeeded && b.succeeded);
        assert_eq!(a.total_attempts, 2);
        assert_eq!(b.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_rejected() {
        let runner = ScriptedRunner::new("x");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let orch = orchestrator(runner, primary, None, NoFixPolicy::default());
        let err = orch.run_session(Language::Python, "x", 0).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Request(RequestError::InvalidMaxAttempts { got: 0, max: 10 })
        );
        assert!(err.to_string().contains("10"));

        let err = orch.start_session(Language::Python, "x", 11).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Request(RequestError::InvalidMaxAttempts { got: 11, max: 10 })
        ));
    }

    #[tokio::test]
    async fn test_abandoned_paced_sessions_do_not_block_batch_runs() {
        let runner = ScriptedRunner::new("ok");
        let primary = ScriptedProvider::new("primary", vec![Reply::Fail]);
        let fixer = FixPipeline::new(
            primary,
            None,
            SafetyGate::new(),
            Duration::from_millis(200),
        );
        let orch = RetryOrchestrator::new(
            runner,
            fixer,
            SessionRegistry::new(2),
            NoFixPolicy::default(),
        );

        orch.start_session(Language::Python, "v1", 3).await.unwrap();
        orch.start_session(Language::Python, "v2", 3).await.unwrap();
        assert_eq!(
            orch.start_session(Language::Python, "v3", 3).await.unwrap_err(),
            SessionError::CapacityReached(2)
        );

        let summary = orch.run_session(Language::Python, "ok", 1).await.unwrap();
        assert!(summary.succeeded);
        assert_eq!(orch.list_sessions().await.len(), 2);
    }

    #[tokio::test]
    async fn test_calculate_sum_scenario_with_real_python() {
        let sandbox = ProcessSandbox::new(SandboxConfig::default());
        if !sandbox.is_available(Language::Python).await {
            eprintln!("skipping: python3 not installed");
            return;
        }
        let fixed = "def calculate_sum(a, b):\n    return a + b\n\nresult = calculate_sum(5, 3)\nprint(result)\n";
        let primary = ScriptedProvider::new("primary", vec![Reply::Fix(fixed)]);
        let orch = orchestrator(Arc::new(sandbox), primary.clone(), None, NoFixPolicy::default());

        let summary = orch
            .run_session(Language::Python, "result = calculate_sum(5, 3\nprint(result)", 3)
            .await
            .unwrap();

        assert!(summary.succeeded);
        assert_eq!(summary.total_attempts, 2);
        assert_eq!(primary.calls(), 1);
        let first = &summary.attempts[0];
        assert!(first.execution_result.stderr.contains("SyntaxError"));
        assert!(first.fix_applied());
        assert_eq!(summary.attempts[1].execution_result.stdout.trim(), "8");
    }
}

//! Retry session record: attempts, state and summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostic;
use crate::language::Language;
use crate::providers::FixResult;
use crate::sandbox::ExecutionResult;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Succeeded,
    /// Budget used up without a passing run
    Exhausted,
    /// Stopped because no usable fix was available
    Aborted,
    /// Abandoned between attempts
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Exhausted => "exhausted",
            SessionState::Aborted => "aborted",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What to do after a failed attempt when no usable fix came back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoFixPolicy {
    /// Run the same code again on the next attempt
    #[default]
    RetryUnchanged,
    /// End the session as aborted
    Abort,
}

impl std::str::FromStr for NoFixPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "retry_unchanged" | "retry" => Ok(NoFixPolicy::RetryUnchanged),
            "abort" => Ok(NoFixPolicy::Abort),
            other => Err(format!(
                "unknown no-fix policy '{}' (expected retry_unchanged or abort)",
                other
            )),
        }
    }
}

/// One execution of the session's code, immutable once recorded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based
    pub index: u32,
    pub code_used: String,
    pub execution_result: ExecutionResult,
    /// Fix requested after this attempt failed; never set on the last one
    pub fix: Option<FixResult>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub timestamp: DateTime<Utc>,
    pub succeeded: bool,
}

impl Attempt {
    /// Whether this attempt changed the code for the next one
    pub fn fix_applied(&self) -> bool {
        self.fix.as_ref().is_some_and(|f| f.is_usable())
    }
}

/// Mutable state of one debugging run
#[derive(Debug, Clone)]
pub struct RetrySession {
    pub id: String,
    pub language: Language,
    pub initial_code: String,
    pub current_code: String,
    pub max_attempts: u32,
    pub attempts: Vec<Attempt>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RetrySession {
    pub fn new(id: String, language: Language, code: String, max_attempts: u32) -> Self {
        Self {
            id,
            language,
            current_code: code.clone(),
            initial_code: code,
            max_attempts,
            attempts: Vec::new(),
            state: SessionState::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.state == SessionState::Succeeded
    }

    /// Index the next attempt will get
    pub fn next_index(&self) -> u32 {
        self.attempts.len() as u32 + 1
    }

    /// Append an attempt, then move to `next_code` and/or `outcome`
    pub fn record(
        &mut self,
        attempt: Attempt,
        next_code: Option<String>,
        outcome: Option<SessionState>,
    ) {
        self.attempts.push(attempt);
        if let Some(code) = next_code {
            self.current_code = code;
        }
        if let Some(state) = outcome {
            self.finish(state);
        }
    }

    /// Move to a terminal state; already-finished sessions are left alone
    pub fn finish(&mut self, state: SessionState) {
        if self.is_complete() {
            return;
        }
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    pub fn elapsed_seconds(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            language: self.language,
            initial_code: self.initial_code.clone(),
            final_code: self.current_code.clone(),
            max_attempts: self.max_attempts,
            total_attempts: self.attempts.len() as u32,
            state: self.state,
            is_complete: self.is_complete(),
            succeeded: self.succeeded(),
            started_at: self.started_at,
            elapsed_seconds: self.elapsed_seconds(),
            attempts: self.attempts.clone(),
        }
    }
}

/// Snapshot of a session returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub language: Language,
    pub initial_code: String,
    pub final_code: String,
    pub max_attempts: u32,
    pub total_attempts: u32,
    pub state: SessionState,
    pub is_complete: bool,
    pub succeeded: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub attempts: Vec<Attempt>,
}

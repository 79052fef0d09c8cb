//! Auto-retry debugging: run, ask for a fix, re-validate, run again

pub mod fix;
pub mod orchestrator;
pub mod registry;
pub mod session;

use serde::{Deserialize, Serialize};

pub use fix::FixPipeline;
pub use orchestrator::RetryOrchestrator;
pub use registry::{SessionHandle, SessionMode, SessionRegistry, normalize_session_key};
pub use session::{Attempt, NoFixPolicy, RetrySession, SessionState, SessionSummary};

/// `[retry]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// Upper bound accepted from callers
    #[serde(default = "default_max_attempts_limit")]
    pub max_attempts_limit: u32,
    /// Longest accepted snippet, in characters
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,
    /// Outer bound on each provider call
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    #[serde(default)]
    pub on_no_fix: NoFixPolicy,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_max_attempts_limit() -> u32 {
    10
}

fn default_max_code_length() -> usize {
    5000
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_max_sessions() -> usize {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            max_attempts_limit: default_max_attempts_limit(),
            max_code_length: default_max_code_length(),
            provider_timeout_secs: default_provider_timeout(),
            on_no_fix: NoFixPolicy::default(),
            max_sessions: default_max_sessions(),
        }
    }
}

//! Fix pipeline: primary provider, then fallback, then the safety gate

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::guardrails::SafetyGate;
use crate::language::Language;
use crate::providers::{FixProposal, FixProvider, FixResult, Provenance};

/// Turns a failure into at most one usable, safe fix.
///
/// The primary is always asked first. The fallback is asked at most once, and
/// only when the primary errors, times out, returns no code or returns code
/// the gate rejects.
pub struct FixPipeline {
    primary: Arc<dyn FixProvider>,
    fallback: Option<Arc<dyn FixProvider>>,
    gate: SafetyGate,
    call_timeout: Duration,
}

impl FixPipeline {
    pub fn new(
        primary: Arc<dyn FixProvider>,
        fallback: Option<Arc<dyn FixProvider>>,
        gate: SafetyGate,
        call_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            gate,
            call_timeout,
        }
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn primary(&self) -> &Arc<dyn FixProvider> {
        &self.primary
    }

    pub fn fallback(&self) -> Option<&Arc<dyn FixProvider>> {
        self.fallback.as_ref()
    }

    pub async fn fix(&self, language: Language, code: &str, error: &str) -> FixResult {
        let primary_problem = match self.ask(self.primary.as_ref(), language, code, error).await {
            Ok(proposal) => {
                info!("Fix from primary {}", self.primary.label());
                return FixResult::from_proposal(proposal, Provenance::Primary, self.primary.label());
            }
            Err(problem) => problem,
        };
        warn!("Primary fix unusable: {}", primary_problem);

        let Some(fallback) = &self.fallback else {
            return FixResult::none(format!("All fix providers failed. {}", primary_problem));
        };

        match self.ask(fallback.as_ref(), language, code, error).await {
            Ok(proposal) => {
                info!("Fix from fallback {}", fallback.label());
                FixResult::from_proposal(proposal, Provenance::Fallback, fallback.label())
            }
            Err(fallback_problem) => {
                warn!("Fallback fix unusable: {}", fallback_problem);
                FixResult::none(format!(
                    "All fix providers failed. {} {}",
                    primary_problem, fallback_problem
                ))
            }
        }
    }

    /// Ask one provider; `Ok` only for non-empty code that passes the gate
    async fn ask(
        &self,
        provider: &dyn FixProvider,
        language: Language,
        code: &str,
        error: &str,
    ) -> Result<FixProposal, String> {
        let label = provider.label();
        debug!("Requesting fix from {}", label);

        let mut proposal =
            match tokio::time::timeout(self.call_timeout, provider.propose(language, code, error))
                .await
            {
                Ok(Ok(proposal)) => proposal,
                Ok(Err(e)) => return Err(format!("{} failed: {:#}.", label, e)),
                Err(_) => {
                    return Err(format!(
                        "{} timed out after {}s.",
                        label,
                        self.call_timeout.as_secs_f64()
                    ));
                }
            };

        if proposal.fixed_code.trim().is_empty() {
            return Err(format!("{} returned no fix: {}.", label, proposal.explanation));
        }

        let verdict = self.gate.check(&proposal.fixed_code);
        if !verdict.safe {
            return Err(format!(
                "{} proposed unsafe code ({}).",
                label,
                verdict.reason.unwrap_or_default()
            ));
        }

        if !provider.reports_confidence() {
            proposal.confidence = None;
        }
        Ok(proposal)
    }
}

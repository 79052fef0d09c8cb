//! Provider-agnostic fix types

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::language::Language;

/// What a provider proposes for one failing snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    #[serde(default)]
    pub explanation: String,
    /// Empty means "no usable fix"
    #[serde(default)]
    pub fixed_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl FixProposal {
    /// A proposal carrying only an explanation
    pub fn unusable(explanation: impl Into<String>) -> Self {
        Self {
            explanation: explanation.into(),
            fixed_code: String::new(),
            confidence: None,
        }
    }
}

/// Which provider produced the fix that was acted upon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Primary,
    Fallback,
    None,
}

/// Fix recorded on an attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    pub explanation: String,
    pub fixed_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub provenance: Provenance,
    /// `provider/model` that produced the fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl FixResult {
    pub fn from_proposal(
        proposal: FixProposal,
        provenance: Provenance,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            explanation: proposal.explanation,
            fixed_code: proposal.fixed_code,
            confidence: proposal.confidence,
            provenance,
            provider: Some(provider.into()),
        }
    }

    /// Neither provider produced anything usable
    pub fn none(explanation: impl Into<String>) -> Self {
        Self {
            explanation: explanation.into(),
            fixed_code: String::new(),
            confidence: None,
            provenance: Provenance::None,
            provider: None,
        }
    }

    /// Whether this fix should replace the current code
    pub fn is_usable(&self) -> bool {
        self.provenance != Provenance::None && !self.fixed_code.trim().is_empty()
    }
}

/// Trait that every fix backend implements
#[async_trait]
pub trait FixProvider: Send + Sync {
    /// Short backend name (e.g. "gemini", "openrouter")
    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;

    /// Whether proposals carry a confidence score
    fn reports_confidence(&self) -> bool;

    /// Ask for a corrected version of `code`.
    ///
    /// Transport and HTTP failures are errors. Malformed model output is not:
    /// it comes back as a proposal with empty `fixed_code`.
    async fn propose(&self, language: Language, code: &str, error: &str) -> Result<FixProposal>;

    /// `provider/model` label used in logs and on fix results
    fn label(&self) -> String {
        format!("{}/{}", self.provider_name(), self.model())
    }
}

//! Fix providers: external services that propose corrected code
//!
//! Backends implement [`FixProvider`]. The retry loop talks to a primary and
//! a fallback through [`crate::retry::FixPipeline`].

pub mod google;
pub mod openai_compat;
pub mod structured;
pub mod types;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::language::Language;

pub use google::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use types::{FixProposal, FixProvider, FixResult, Provenance};

/// Backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    OpenaiCompat,
}

/// One `[providers.*]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl ProviderConfig {
    pub fn gemini() -> Self {
        Self {
            kind: ProviderKind::Gemini,
            model: Some(google::DEFAULT_MODEL.to_string()),
            api_key_env: "GEMINI_API_KEY".to_string(),
            base_url: None,
            timeout_secs: default_http_timeout(),
        }
    }

    pub fn openrouter() -> Self {
        Self {
            kind: ProviderKind::OpenaiCompat,
            model: Some(openai_compat::DEFAULT_MODEL.to_string()),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            base_url: None,
            timeout_secs: default_http_timeout(),
        }
    }
}

/// Build a provider from config, reading its key from the environment
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn FixProvider>> {
    let api_key = std::env::var(&config.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| anyhow!("environment variable {} is not set", config.api_key_env))?;
    let timeout = Duration::from_secs(config.timeout_secs);

    let provider: Arc<dyn FixProvider> = match config.kind {
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            timeout,
        )?),
        ProviderKind::OpenaiCompat => Arc::new(OpenAiCompatProvider::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            timeout,
        )?),
    };
    info!("Fix provider ready: {}", provider.label());
    Ok(provider)
}

/// Like [`build_provider`], but a missing key yields a provider that always
/// fails, so execution keeps working without credentials
pub fn build_provider_or_unconfigured(config: &ProviderConfig) -> Arc<dyn FixProvider> {
    match build_provider(config) {
        Ok(provider) => provider,
        Err(e) => {
            warn!("Fix provider {:?} unavailable: {:#}", config.kind, e);
            Arc::new(UnconfiguredProvider::new(config, format!("{:#}", e)))
        }
    }
}

/// Placeholder for a provider that could not be built
#[derive(Debug)]
pub struct UnconfiguredProvider {
    name: String,
    model: String,
    reason: String,
}

impl UnconfiguredProvider {
    pub fn new(config: &ProviderConfig, reason: impl Into<String>) -> Self {
        let name = match config.kind {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenaiCompat => "openai_compat",
        };
        Self {
            name: name.to_string(),
            model: config.model.clone().unwrap_or_default(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl FixProvider for UnconfiguredProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn reports_confidence(&self) -> bool {
        false
    }

    async fn propose(&self, _language: Language, _code: &str, _error: &str) -> Result<FixProposal> {
        Err(anyhow!("{} is not configured: {}", self.name, self.reason))
    }
}

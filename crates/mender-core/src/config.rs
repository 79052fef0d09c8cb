//! Configuration: TOML file with per-field defaults

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::providers::ProviderConfig;
use crate::retry::RetryConfig;
use crate::sandbox::SandboxConfig;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "MENDER_CONFIG";

/// Hard ceiling on attempts per session
pub const MAX_ATTEMPTS_CEILING: u32 = 10;

/// `[safety]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Terms blocked in addition to the built-in list
    #[serde(default)]
    pub extra_terms: Vec<String>,
}

/// `[providers]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderConfig::gemini")]
    pub primary: ProviderConfig,
    #[serde(default = "default_fallback")]
    pub fallback: Option<ProviderConfig>,
}

fn default_fallback() -> Option<ProviderConfig> {
    Some(ProviderConfig::openrouter())
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            primary: ProviderConfig::gemini(),
            fallback: default_fallback(),
        }
    }
}

/// `[gateway]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed by CORS; empty disables the layer
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MenderConfig {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// `<config_dir>/mender/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mender").join("config.toml"))
}

impl MenderConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load using the lookup order: explicit path, `$MENDER_CONFIG`,
    /// the per-user config file, built-in defaults.
    ///
    /// Returns the config and the file it came from, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            let path = PathBuf::from(path);
            debug!("Using config from ${}", CONFIG_ENV);
            return Ok((Self::from_file(&path)?, Some(path)));
        }

        if let Some(path) = default_config_path().filter(|p| p.is_file()) {
            return Ok((Self::from_file(&path)?, Some(path)));
        }

        info!("No config file found, using defaults");
        Ok((Self::default(), None))
    }

    /// Reject out-of-range limits and malformed provider settings
    pub fn validate(&self) -> Result<()> {
        let limits = &self.sandbox.limits;
        if limits.timeout_secs == 0 {
            bail!("sandbox.limits.timeout_secs must be at least 1");
        }
        if limits.compile_timeout_secs == 0 {
            bail!("sandbox.limits.compile_timeout_secs must be at least 1");
        }
        if limits.max_output_bytes == 0 {
            bail!("sandbox.limits.max_output_bytes must be positive");
        }
        if self.sandbox.toolchain.python.trim().is_empty()
            || self.sandbox.toolchain.cpp_compiler.trim().is_empty()
        {
            bail!("sandbox.toolchain binaries cannot be empty");
        }

        let retry = &self.retry;
        if !(1..=MAX_ATTEMPTS_CEILING).contains(&retry.max_attempts_limit) {
            bail!(
                "retry.max_attempts_limit must be between 1 and {}, got {}",
                MAX_ATTEMPTS_CEILING,
                retry.max_attempts_limit
            );
        }
        if !(1..=retry.max_attempts_limit).contains(&retry.default_max_attempts) {
            bail!(
                "retry.default_max_attempts must be between 1 and {}, got {}",
                retry.max_attempts_limit,
                retry.default_max_attempts
            );
        }
        if retry.max_code_length == 0 {
            bail!("retry.max_code_length must be positive");
        }
        if retry.provider_timeout_secs == 0 {
            bail!("retry.provider_timeout_secs must be at least 1");
        }
        if retry.max_sessions == 0 {
            bail!("retry.max_sessions must be positive");
        }

        validate_provider("providers.primary", &self.providers.primary)?;
        if let Some(fallback) = &self.providers.fallback {
            validate_provider("providers.fallback", fallback)?;
        }

        if self.gateway.host.trim().is_empty() {
            bail!("gateway.host cannot be empty");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn validate_provider(section: &str, provider: &ProviderConfig) -> Result<()> {
    if provider.api_key_env.trim().is_empty() {
        bail!("{}.api_key_env cannot be empty", section);
    }
    if provider.timeout_secs == 0 {
        bail!("{}.timeout_secs must be at least 1", section);
    }
    if let Some(base_url) = &provider.base_url {
        let parsed = url::Url::parse(base_url)
            .with_context(|| format!("{}.base_url is not a valid URL: {}", section, base_url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("{}.base_url must use http or https", section);
        }
    }
    Ok(())
}

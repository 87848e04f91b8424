use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{aggregator::Thresholds, heuristic::HeuristicRules};

/// Environment variables consulted for secrets and endpoints.
pub const ENV_REPUTATION_API_KEY: &str = "VIGIL_REPUTATION_API_KEY";
/// Secondary multi-scanner key.
pub const ENV_MULTISCAN_API_KEY: &str = "VIGIL_MULTISCAN_API_KEY";
/// Blocklist key.
pub const ENV_BLOCKLIST_API_KEY: &str = "VIGIL_BLOCKLIST_API_KEY";
/// Generative service key.
pub const ENV_EXPLAINER_API_KEY: &str = "VIGIL_EXPLAINER_API_KEY";
/// Generative service endpoint.
pub const ENV_EXPLAINER_ENDPOINT: &str = "VIGIL_EXPLAINER_ENDPOINT";

/// Top-level configuration document.
#[derive(Debug, Clone, Default)]
pub struct VigilConfig {
    /// Fan-out and cache settings.
    pub orchestrator: OrchestratorSettings,
    /// Primary reputation aggregator.
    pub reputation: ReputationConfig,
    /// Secondary multi-scanner (failover).
    pub multiscan: MultiScanConfig,
    /// Blocklist lookup (URLs only).
    pub blocklist: BlocklistConfig,
    /// Generative explanation service.
    pub explainer: ExplainerConfig,
    /// Detection-rate thresholds.
    pub thresholds: Thresholds,
    /// Heuristic rule tables.
    pub heuristic: HeuristicRules,
}

impl VigilConfig {
    /// Loads configuration from a TOML file and applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading vigil config {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::from_toml_str(&raw, &source_dir)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document; relative paths resolve against `source_dir`.
    pub fn from_toml_str(raw: &str, source_dir: &Path) -> Result<Self> {
        let document: VigilConfigSerde = toml::from_str(raw)?;
        let mut orchestrator = document.orchestrator;
        if let Some(cache_file) = orchestrator.cache_file.as_mut() {
            if cache_file.is_relative() {
                *cache_file = source_dir.join(&*cache_file);
            }
        }
        let config = Self {
            orchestrator,
            reputation: document.reputation,
            multiscan: document.multiscan,
            blocklist: document.blocklist,
            explainer: document.explainer,
            thresholds: document.thresholds,
            heuristic: document.heuristic,
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no file is given.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Fills secrets and endpoints from `lookup`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(key) = read(ENV_REPUTATION_API_KEY) {
            self.reputation.api_key = Some(key);
        }
        if let Some(key) = read(ENV_MULTISCAN_API_KEY) {
            self.multiscan.api_key = Some(key);
        }
        if let Some(key) = read(ENV_BLOCKLIST_API_KEY) {
            self.blocklist.api_key = Some(key);
        }
        if let Some(key) = read(ENV_EXPLAINER_API_KEY) {
            self.explainer.api_key = Some(key);
        }
        if let Some(endpoint) = read(ENV_EXPLAINER_ENDPOINT) {
            self.explainer.endpoint = endpoint;
        }
    }

    /// Rejects settings that would make the orchestrator misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.ceiling_timeout_ms == 0 || self.orchestrator.engine_timeout_ms == 0 {
            bail!("orchestrator timeouts must be positive");
        }
        if self.orchestrator.cache_ttl_secs == 0 {
            bail!("cache ttl must be positive");
        }
        self.thresholds.validate()?;
        for (name, attempts, interval) in [
            (
                "reputation",
                self.reputation.max_poll_attempts.min(self.reputation.max_file_poll_attempts),
                self.reputation.poll_interval_ms,
            ),
            (
                "multiscan",
                self.multiscan.max_poll_attempts,
                self.multiscan.poll_interval_ms,
            ),
        ] {
            if attempts == 0 {
                bail!("{name}: max poll attempts must be at least 1");
            }
            if interval == 0 {
                bail!("{name}: poll interval must be positive");
            }
        }
        if self.explainer.timeout_ms == 0 {
            bail!("explainer timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct VigilConfigSerde {
    #[serde(default)]
    orchestrator: OrchestratorSettings,
    #[serde(default)]
    reputation: ReputationConfig,
    #[serde(default)]
    multiscan: MultiScanConfig,
    #[serde(default)]
    blocklist: BlocklistConfig,
    #[serde(default)]
    explainer: ExplainerConfig,
    #[serde(default)]
    thresholds: Thresholds,
    #[serde(default)]
    heuristic: HeuristicRules,
}

/// Fan-out, adapter and cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSettings {
    /// Global wait for all adapters.
    #[serde(default = "default_ceiling_timeout_ms")]
    pub ceiling_timeout_ms: u64,
    /// Per-adapter budget handed to `EngineAdapter::analyze`.
    #[serde(default = "default_engine_timeout_ms")]
    pub engine_timeout_ms: u64,
    /// Verdict lifetime in the cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// JSON snapshot file for a persistent cache; in-memory when unset.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl OrchestratorSettings {
    /// Ceiling as a duration.
    #[must_use]
    pub const fn ceiling_timeout(&self) -> Duration {
        Duration::from_millis(self.ceiling_timeout_ms)
    }

    /// Adapter budget as a duration.
    #[must_use]
    pub const fn engine_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_timeout_ms)
    }

    /// Cache TTL as a duration.
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            ceiling_timeout_ms: default_ceiling_timeout_ms(),
            engine_timeout_ms: default_engine_timeout_ms(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_file: None,
        }
    }
}

/// Reputation aggregator (submit-then-poll, hash lookup).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Whether the adapter is wired in.
    pub enabled: bool,
    /// API root, e.g. `https://www.virustotal.com/vtapi/v2`.
    pub base_url: String,
    /// API key; without it the adapter reports `Unreachable` without calling out.
    pub api_key: Option<String>,
    /// Per HTTP request timeout.
    pub request_timeout_ms: u64,
    /// Fixed wait between report polls.
    pub poll_interval_ms: u64,
    /// Poll attempts after a URL submission.
    pub max_poll_attempts: u32,
    /// Poll attempts after a file upload.
    pub max_file_poll_attempts: u32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://www.virustotal.com/vtapi/v2".into(),
            api_key: None,
            request_timeout_ms: 15_000,
            poll_interval_ms: 5_000,
            max_poll_attempts: 6,
            max_file_poll_attempts: 9,
        }
    }
}

/// Secondary multi-scanner (hash lookup, upload-then-poll, URL lookup).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiScanConfig {
    /// Whether the adapter is wired in.
    pub enabled: bool,
    /// API root, e.g. `https://api.metadefender.com/v4`.
    pub base_url: String,
    /// API key sent in the `apikey` header.
    pub api_key: Option<String>,
    /// Per HTTP request timeout.
    pub request_timeout_ms: u64,
    /// Fixed wait between progress polls.
    pub poll_interval_ms: u64,
    /// Poll attempts after an upload.
    pub max_poll_attempts: u32,
}

impl Default for MultiScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.metadefender.com/v4".into(),
            api_key: None,
            request_timeout_ms: 30_000,
            poll_interval_ms: 5_000,
            max_poll_attempts: 9,
        }
    }
}

/// Blocklist lookup (single match query).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Whether the adapter is wired in.
    pub enabled: bool,
    /// API root, e.g. `https://safebrowsing.googleapis.com/v4`.
    pub base_url: String,
    /// API key passed as the `key` query parameter.
    pub api_key: Option<String>,
    /// Request timeout.
    pub request_timeout_ms: u64,
    /// Client id reported to the service.
    pub client_id: String,
    /// Client version reported to the service.
    pub client_version: String,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://safebrowsing.googleapis.com/v4".into(),
            api_key: None,
            request_timeout_ms: 10_000,
            client_id: "vigil".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Generative explanation service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExplainerConfig {
    /// When false only the template table is used.
    pub enabled: bool,
    /// Generation endpoint accepting `{prompt, max_tokens, temperature, top_p}`.
    pub endpoint: String,
    /// Sent as `x-api-key`.
    pub api_key: Option<String>,
    /// Sent as a bearer token.
    pub bearer_token: Option<String>,
    /// Budget for one generation call.
    pub timeout_ms: u64,
    /// Raw outputs shorter than this are malformed.
    pub min_output_chars: usize,
    /// Generation length cap.
    pub max_tokens: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling.
    pub top_p: f32,
}

impl ExplainerConfig {
    /// Generation budget as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:9000/generate".into(),
            api_key: None,
            bearer_token: None,
            timeout_ms: 15_000,
            min_output_chars: 20,
            max_tokens: 256,
            temperature: 0.2,
            top_p: 0.9,
        }
    }
}

const fn default_ceiling_timeout_ms() -> u64 {
    60_000
}

const fn default_engine_timeout_ms() -> u64 {
    55_000
}

const fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;
    use tempfile::tempdir;

    #[test]
    fn loads_and_normalizes_document() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("vigil.toml");
        fs::write(
            &config_path,
            r#"
[orchestrator]
ceiling_timeout_ms = 5000
cache_file = "state/cache.json"

[reputation]
api_key = "from-file"
max_poll_attempts = 3

[thresholds]
critical = 0.8
blocklist_floor = "HIGH"

[blocklist]
enabled = false
"#,
        )
        .unwrap();
        let config = VigilConfig::load(&config_path).unwrap();
        assert_eq!(config.orchestrator.ceiling_timeout(), Duration::from_secs(5));
        assert_eq!(config.orchestrator.cache_ttl(), Duration::from_secs(86_400));
        assert!(config.orchestrator.cache_file.unwrap().is_absolute());
        assert_eq!(config.reputation.max_poll_attempts, 3);
        assert_eq!(config.reputation.poll_interval_ms, 5_000);
        assert!((config.thresholds.critical - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.thresholds.blocklist_floor, RiskLevel::High);
        assert!(!config.blocklist.enabled);
        assert!(config.multiscan.enabled);
    }

    #[test]
    fn env_overrides_secrets() {
        let mut config = VigilConfig::default();
        config.apply_env(|key| match key {
            ENV_REPUTATION_API_KEY => Some("vt-key".into()),
            ENV_EXPLAINER_ENDPOINT => Some("http://llm.internal/generate".into()),
            ENV_MULTISCAN_API_KEY => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.reputation.api_key.as_deref(), Some("vt-key"));
        assert_eq!(config.explainer.endpoint, "http://llm.internal/generate");
        assert!(config.multiscan.api_key.is_none());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = VigilConfig::from_toml_str(
            "[thresholds]\ncritical = 0.2\nhigh = 0.3\n",
            Path::new("."),
        )
        .unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn rejects_zero_poll_attempts() {
        let err = VigilConfig::from_toml_str(
            "[multiscan]\nmax_poll_attempts = 0\n",
            Path::new("."),
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiscan"));
    }
}

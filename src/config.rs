//! Pipeline configuration loaded from `.pipeline/config.yaml`.
//!
//! Loading never fails: `${NAME}` env-var substitution runs first, then the
//! YAML is parsed and validated, and any parse or validation failure
//! reverts the whole config to defaults. A half-valid file is not merged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONFIG_RELATIVE_PATH: &str = ".pipeline/config.yaml";

// ── Sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    pub max_files: i64,
    pub max_lines: i64,
    #[serde(default)]
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BranchConfig {
    /// Prefix for pipeline-created branches, e.g. `pipeline/`.
    pub pipeline_prefix: String,
    pub target_branch: String,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            pipeline_prefix: "pipeline/".to_string(),
            target_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSpec {
    pub prompt: String,
    pub model: Option<String>,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoCorrectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub agent: String,
}

impl Default for AutoCorrectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 2,
            agent: "corrector".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from(".pipeline/dlq"),
            max_retries: 5,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub dlq: DlqConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectorConfig {
    /// Seconds between integration sweeps; 0 disables the director loop.
    pub interval_seconds: u64,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Keep branches and worktrees around when a pipeline fails.
    pub keep_on_failure: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            keep_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    pub enabled: bool,
    pub url: String,
    /// Shared secret for the HMAC signature header; never logged.
    pub secret: String,
    pub timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: String::new(),
            secret: String::new(),
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub dir: PathBuf,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".pipeline/events"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ── Top level ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub tiers: BTreeMap<String, TierConfig>,
    pub branch: BranchConfig,
    pub agents: BTreeMap<String, AgentSpec>,
    pub auto_correction: AutoCorrectionConfig,
    pub resilience: ResilienceConfig,
    pub director: DirectorConfig,
    pub cleanup: CleanupConfig,
    pub adapters: BTreeMap<String, AdapterConfig>,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            "small".to_string(),
            TierConfig {
                max_files: 3,
                max_lines: 50,
                agents: vec!["tests".to_string(), "style".to_string()],
            },
        );
        tiers.insert(
            "medium".to_string(),
            TierConfig {
                max_files: 10,
                max_lines: 400,
                agents: vec![
                    "tests".to_string(),
                    "style".to_string(),
                    "security".to_string(),
                ],
            },
        );
        tiers.insert(
            "large".to_string(),
            TierConfig {
                max_files: i64::MAX,
                max_lines: i64::MAX,
                agents: vec![
                    "tests".to_string(),
                    "style".to_string(),
                    "security".to_string(),
                    "architecture".to_string(),
                ],
            },
        );
        Self {
            tiers,
            branch: BranchConfig::default(),
            agents: BTreeMap::new(),
            auto_correction: AutoCorrectionConfig::default(),
            resilience: ResilienceConfig::default(),
            director: DirectorConfig::default(),
            cleanup: CleanupConfig::default(),
            adapters: BTreeMap::new(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from `<project_root>/.pipeline/config.yaml`, falling back to
    /// defaults on a missing file, parse failure, or validation failure.
    pub fn load(project_root: &Path) -> Self {
        let path = project_root.join(CONFIG_RELATIVE_PATH);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };

        let substituted = substitute_env_vars(&raw);
        match serde_yaml::from_str::<PipelineConfig>(&substituted) {
            Ok(config) => {
                if let Err(reason) = config.validate() {
                    warn!(path = %path.display(), reason, "invalid pipeline config, using defaults");
                    Self::default()
                } else {
                    config
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unparseable pipeline config, using defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.tiers.is_empty() {
            return Err("no tiers defined".to_string());
        }
        for (name, tier) in &self.tiers {
            if tier.max_files <= 0 {
                return Err(format!("tier {}: max_files must be positive", name));
            }
            if tier.max_lines <= 0 {
                return Err(format!("tier {}: max_lines must be positive", name));
            }
        }
        let dlq = &self.resilience.dlq;
        if dlq.base_delay_ms == 0 {
            return Err("dlq.base_delay_ms must be positive".to_string());
        }
        if dlq.backoff_factor < 1.0 {
            return Err("dlq.backoff_factor must be >= 1.0".to_string());
        }
        for (name, adapter) in &self.adapters {
            if adapter.enabled && adapter.url.is_empty() {
                return Err(format!("adapter {}: url is required", name));
            }
        }
        Ok(())
    }

    /// Pick the smallest tier whose thresholds admit the change, largest as
    /// the catch-all. Tier order is small < medium < large by max_files.
    pub fn classify_tier(&self, files_changed: i64, lines_changed: i64) -> String {
        let mut tiers: Vec<(&String, &TierConfig)> = self.tiers.iter().collect();
        tiers.sort_by_key(|(_, t)| (t.max_files, t.max_lines));
        for (name, tier) in &tiers {
            if files_changed <= tier.max_files && lines_changed <= tier.max_lines {
                return (*name).clone();
            }
        }
        tiers
            .last()
            .map(|(name, _)| (*name).clone())
            .unwrap_or_else(|| "large".to_string())
    }

    pub fn tier_agents(&self, tier: &str) -> Vec<String> {
        self.tiers
            .get(tier)
            .map(|t| t.agents.clone())
            .unwrap_or_default()
    }
}

/// Replace every `${NAME}` with the process env value, empty if unset.
/// Runs before parsing so substitution errors cannot surface.
pub fn substitute_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

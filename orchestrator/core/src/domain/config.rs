// Copyright (c) 2026 Strata Contributors
// SPDX-License-Identifier: AGPL-3.0

// Engine Configuration
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) carrying:
// - rate limits per named resource plus a default
// - the tool approval policy
// - strategy tuning and per-strategy base costs
// - orchestrator checkpointing and step ceilings
// - event bus capacity and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::rate_limit::RateLimitConfig;
use crate::domain::resources::Credits;
use crate::domain::step::StrategyType;
use crate::domain::tool_policy::ToolApprovalPolicy;

pub const API_VERSION: &str = "strata.dev/v1";
pub const KIND: &str = "EngineConfig";
pub const CONFIG_PATH_ENV: &str = "STRATA_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "./strata-config.yaml";

/// Top-level engine configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfigManifest {
    /// API version (must be "strata.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "EngineConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: EngineConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigSpec {
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub tool_approval: ToolApprovalPolicy,

    #[serde(default)]
    pub strategies: StrategiesConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub event_bus: EventBusConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Applied to any resource without its own entry
    #[serde(default)]
    pub default: RateLimitConfig,

    #[serde(default)]
    pub resources: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            default: RateLimitConfig::default(),
            resources: HashMap::from([(
                "tool_calls".to_string(),
                RateLimitConfig::new(30, 60, Duration::from_secs(60)),
            )]),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub conversational: ConversationalConfig,

    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    /// Base credit estimate per strategy before per-step hints
    #[serde(default)]
    pub costs: StrategyCosts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationalConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
}

impl Default for ConversationalConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Ask the reasoning engine when no route condition matches
    #[serde(default = "default_true")]
    pub model_fallback: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            model_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyCosts {
    #[serde(default = "default_conversational_cost")]
    pub conversational: Credits,
    #[serde(default)]
    pub deterministic: Credits,
    #[serde(default = "default_reasoning_cost")]
    pub reasoning: Credits,
    #[serde(default = "default_routing_cost")]
    pub routing: Credits,
}

impl Default for StrategyCosts {
    fn default() -> Self {
        Self {
            conversational: default_conversational_cost(),
            deterministic: Credits::ZERO,
            reasoning: default_reasoning_cost(),
            routing: default_routing_cost(),
        }
    }
}

impl StrategyCosts {
    pub fn base(&self, strategy: StrategyType) -> Credits {
        match strategy {
            StrategyType::Conversational => self.conversational,
            StrategyType::Deterministic => self.deterministic,
            StrategyType::Reasoning => self.reasoning,
            StrategyType::Routing => self.routing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Write a checkpoint every N completed steps
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Hard ceiling on leaf dispatches per run, loops included
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            max_steps_per_run: default_max_steps_per_run(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "compact" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_turns() -> u32 {
    8
}

fn default_max_iterations() -> u32 {
    3
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_conversational_cost() -> Credits {
    Credits::new(10)
}

fn default_reasoning_cost() -> Credits {
    Credits::new(20)
}

fn default_routing_cost() -> Credits {
    Credits::new(1)
}

fn default_checkpoint_interval() -> u32 {
    5
}

fn default_max_steps_per_run() -> u32 {
    1000
}

fn default_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for EngineConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "strata-engine".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: EngineConfigSpec::default(),
        }
    }
}

impl EngineConfigManifest {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. STRATA_CONFIG_PATH environment variable
    /// 2. ./strata-config.yaml (working directory)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
        if cwd.exists() {
            return Some(cwd);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found, using built-in defaults");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Environment overrides for container deployments
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("STRATA_LOG_LEVEL") {
            tracing::info!("Environment override: STRATA_LOG_LEVEL={}", level);
            self.spec.observability.log_level = level;
        }

        if let Ok(val) = std::env::var("STRATA_EVENT_BUS_CAPACITY") {
            match val.parse::<usize>() {
                Ok(capacity) if capacity > 0 => {
                    tracing::info!("Environment override: STRATA_EVENT_BUS_CAPACITY={}", capacity);
                    self.spec.event_bus.capacity = capacity;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for STRATA_EVENT_BUS_CAPACITY: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.trim().is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let limits = &self.spec.rate_limits;
        for (name, limit) in std::iter::once(("default", &limits.default))
            .chain(limits.resources.iter().map(|(k, v)| (k.as_str(), v)))
        {
            if limit.window.is_zero() {
                anyhow::bail!("Rate limit window for '{}' must be greater than zero", name);
            }
            if limit.burst_limit < limit.limit {
                anyhow::bail!(
                    "Rate limit burst_limit ({}) for '{}' is below limit ({})",
                    limit.burst_limit,
                    name,
                    limit.limit
                );
            }
        }

        let threshold = self.spec.strategies.reasoning.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("strategies.reasoning.confidence_threshold must be within 0..=1, got {}", threshold);
        }

        if self.spec.orchestrator.checkpoint_interval == 0 {
            anyhow::bail!("orchestrator.checkpoint_interval must be greater than zero");
        }

        if self.spec.event_bus.capacity == 0 {
            anyhow::bail!("event_bus.capacity must be greater than zero");
        }

        match self.spec.observability.log_format.as_str() {
            "compact" | "json" => {}
            other => anyhow::bail!("Unknown log_format '{}'. Expected 'compact' or 'json'", other),
        }

        Ok(())
    }
}

//! Configuration for the conduit runtime.
//!
//! Settings are read from `conduit.toml` in the config directory and layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [broker]
//! message_ttl_secs = 300
//! subscription_ttl_secs = 3600
//! cleanup_interval_secs = 60
//! history_limit = 100
//!
//! [control_points]
//! default_timeout_secs = 300
//! resolved_retention_secs = 3600
//!
//! [staging]
//! ttl_secs = 3600
//! preview_max_bytes = 1024
//! sweep_interval_secs = 30
//!
//! [pipeline]
//! retention_secs = 3600
//! approval_stages = ["decision"]
//!
//! [pipeline.retry]
//! max_attempts = 3
//! base_delay_ms = 100
//! backoff = 2.0
//!
//! [[pipeline.routes]]
//! from = "insight"
//! issue = "low_confidence"
//! to = ["report"]
//!
//! [handlers]
//! max_recovery_attempts = 3
//! max_retries = 1
//! decision_requires_approval = false
//!
//! [repository]
//! kind = "file"
//! dir = ".conduit/repository"
//! io_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! format = "json"
//! file = ".conduit/logs/conduit.log"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::Domain;
use crate::pipeline::{INGESTION_STAGE, TERMINAL_STAGE};
use crate::retry::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "conduit.toml";

/// Message broker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Age after which history entries are purged
    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
    /// Idle time after which non-durable subscriptions are purged
    #[serde(default = "default_subscription_ttl_secs")]
    pub subscription_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Messages kept per correlation id
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_message_ttl_secs() -> u64 {
    300
}

fn default_subscription_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_history_limit() -> usize {
    100
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            message_ttl_secs: default_message_ttl_secs(),
            subscription_ttl_secs: default_subscription_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl BrokerConfig {
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn subscription_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Control-point settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPointConfig {
    /// Timeout applied when a request does not set one
    #[serde(default = "default_control_point_timeout_secs")]
    pub default_timeout_secs: u64,
    /// How long resolved control points stay queryable
    #[serde(default = "default_resolved_retention_secs")]
    pub resolved_retention_secs: u64,
}

fn default_control_point_timeout_secs() -> u64 {
    300
}

fn default_resolved_retention_secs() -> u64 {
    3600
}

impl Default for ControlPointConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_control_point_timeout_secs(),
            resolved_retention_secs: default_resolved_retention_secs(),
        }
    }
}

impl ControlPointConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::from_secs(self.resolved_retention_secs)
    }
}

/// Staging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingConfig {
    #[serde(default = "default_staging_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on the serialized preview shown with a control point
    #[serde(default = "default_preview_max_bytes")]
    pub preview_max_bytes: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_staging_ttl_secs() -> u64 {
    3600
}

fn default_preview_max_bytes() -> usize {
    1024
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_staging_ttl_secs(),
            preview_max_bytes: default_preview_max_bytes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl StagingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Adds or replaces one routing edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOverride {
    pub from: String,
    /// Issue type this edge applies to; `None` replaces the default edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
    pub to: Vec<String>,
}

/// Pipeline orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long terminal pipelines stay queryable
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Stages whose results must be approved before routing continues
    #[serde(default)]
    pub approval_stages: Vec<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub routes: Vec<RouteOverride>,
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            approval_stages: Vec::new(),
            retry: RetryPolicy::default(),
            routes: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn requires_approval(&self, stage: &str) -> bool {
        self.approval_stages.iter().any(|s| s == stage)
    }
}

/// Domain handler and manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Recovery notices sent for externally reported errors before escalation
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Times a manager restarts a failed run before reporting stage failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether the decision approval phase opens a control point
    #[serde(default)]
    pub decision_requires_approval: bool,
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,
    #[serde(default = "default_recommendation_top_k")]
    pub recommendation_top_k: usize,
    #[serde(default = "default_insight_min_confidence")]
    pub insight_min_confidence: f64,
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    1
}

fn default_decision_timeout_secs() -> u64 {
    300
}

fn default_recommendation_top_k() -> usize {
    5
}

fn default_insight_min_confidence() -> f64 {
    0.5
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: default_max_recovery_attempts(),
            max_retries: default_max_retries(),
            decision_requires_approval: false,
            decision_timeout_secs: default_decision_timeout_secs(),
            recommendation_top_k: default_recommendation_top_k(),
            insight_min_confidence: default_insight_min_confidence(),
        }
    }
}

impl HandlerConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }
}

/// Which repository backs the managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    #[default]
    Memory,
    File,
}

impl std::fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryKind::Memory => write!(f, "memory"),
            RepositoryKind::File => write!(f, "file"),
        }
    }
}

/// Repository settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub kind: RepositoryKind,
    /// Directory for the file repository log
    #[serde(default = "default_repository_dir")]
    pub dir: PathBuf,
    /// Bound on every repository call
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_repository_dir() -> PathBuf {
    PathBuf::from(".conduit/repository")
}

fn default_io_timeout_ms() -> u64 {
    5_000
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            kind: RepositoryKind::default(),
            dir: default_repository_dir(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

impl RepositoryConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Write logs to this file (rotated daily) instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// The complete conduit.toml structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConduitToml {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub control_points: ControlPointConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub handlers: HandlerConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConduitToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conduit.toml")
    }

    /// Load `conduit.toml` from `config_dir`, or defaults when it is absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conduit.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(level) = lookup("CONDUIT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CONDUIT_LOG_FORMAT") {
            self.logging.format = format.parse().context("CONDUIT_LOG_FORMAT")?;
        }
        if let Some(dir) = lookup("CONDUIT_REPOSITORY_DIR") {
            self.repository.kind = RepositoryKind::File;
            self.repository.dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.broker.history_limit == 0 {
            warnings.push("broker.history_limit is 0; history will keep one entry".to_string());
        }
        if self.control_points.default_timeout_secs == 0 {
            warnings.push(
                "control_points.default_timeout_secs is 0; control points time out immediately"
                    .to_string(),
            );
        }
        if self.staging.ttl_secs == 0 {
            warnings.push("staging.ttl_secs is 0; staged data expires immediately".to_string());
        }
        if self.staging.preview_max_bytes < 16 {
            warnings.push(format!(
                "staging.preview_max_bytes {} is too small for a useful preview",
                self.staging.preview_max_bytes
            ));
        }
        if self.pipeline.retry.max_attempts == 0 {
            warnings.push("pipeline.retry.max_attempts is 0; treated as 1".to_string());
        }
        if self.pipeline.retry.backoff < 1.0 {
            warnings.push(format!(
                "pipeline.retry.backoff {} is below 1.0; treated as 1.0",
                self.pipeline.retry.backoff
            ));
        }
        for stage in &self.pipeline.approval_stages {
            if !is_domain_stage(stage) {
                warnings.push(format!("Unknown approval stage '{}'", stage));
            }
        }
        for (i, route) in self.pipeline.routes.iter().enumerate() {
            if !is_known_stage(&route.from) {
                warnings.push(format!(
                    "pipeline.routes[{}]: unknown source stage '{}'",
                    i, route.from
                ));
            }
            if route.to.is_empty() {
                warnings.push(format!("pipeline.routes[{}]: no target stages", i));
            }
            for target in &route.to {
                if !is_known_stage(target) || target == INGESTION_STAGE {
                    warnings.push(format!(
                        "pipeline.routes[{}]: invalid target stage '{}'",
                        i, target
                    ));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.handlers.insight_min_confidence) {
            warnings.push(format!(
                "handlers.insight_min_confidence {} is outside 0.0..=1.0",
                self.handlers.insight_min_confidence
            ));
        }
        if self.handlers.recommendation_top_k == 0 {
            warnings.push("handlers.recommendation_top_k is 0; no recommendations survive".into());
        }
        if self.repository.io_timeout_ms == 0 {
            warnings.push("repository.io_timeout_ms is 0; every repository call times out".into());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

fn is_domain_stage(stage: &str) -> bool {
    stage.parse::<Domain>().is_ok() && stage == stage.to_lowercase()
}

fn is_known_stage(stage: &str) -> bool {
    stage == INGESTION_STAGE || stage == TERMINAL_STAGE || is_domain_stage(stage)
}

/// Effective configuration after layering file, environment and CLI.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    /// Directory holding conduit.toml
    pub config_dir: PathBuf,
    pub toml: ConduitToml,
    /// CLI override: verbose logging
    pub verbose: bool,
    /// CLI override: auto-approve every control point
    pub yes: bool,
}

impl ConduitConfig {
    /// Load from a config directory and apply environment overrides.
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        let mut toml = ConduitToml::load_or_default(&config_dir)?;
        toml.apply_env()?;
        Ok(Self {
            config_dir,
            toml,
            verbose: false,
            yes: false,
        })
    }

    /// Create a config with CLI overrides applied on top.
    pub fn with_cli_args(
        config_dir: PathBuf,
        verbose: bool,
        yes: bool,
        log_format: Option<LogFormat>,
    ) -> Result<Self> {
        let mut config = Self::new(config_dir)?;
        config.verbose = verbose;
        config.yes = yes;
        if verbose {
            config.toml.logging.level = "debug".to_string();
        }
        if let Some(format) = log_format {
            config.toml.logging.format = format;
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

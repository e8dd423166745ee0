use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.duet/config.toml`.
///
/// **Security**: This struct NEVER stores API keys. The planning agent reads
/// `ANTHROPIC_API_KEY` from the environment at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Extra or overriding entries for the model rate table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pricing: Vec<PricingEntry>,
}

impl Config {
    /// Load config from `~/.duet/config.toml`, falling back to defaults when
    /// the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.budget.validate()?;
        self.orchestrator.validate()?;
        self.session.validate()?;
        for entry in &self.pricing {
            entry.validate()?;
        }
        Ok(())
    }

    /// Where session and usage records live.
    pub fn data_dir(&self) -> PathBuf {
        match &self.general.data_dir {
            Some(dir) => expand_home(dir),
            None => default_home(),
        }
    }

    pub fn default_path() -> PathBuf {
        default_home().join("config.toml")
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".duet")
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub data_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: None,
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format must be \"text\" or \"json\", got {other:?}"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

/// Hard limits per scope. Every limit is optional; an unset limit never
/// gates a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub session_max_tokens: Option<u64>,
    #[serde(default)]
    pub session_max_cost_usd: Option<f64>,
    #[serde(default)]
    pub daily_max_tokens: Option<u64>,
    #[serde(default)]
    pub daily_max_cost_usd: Option<f64>,
    #[serde(default)]
    pub monthly_max_tokens: Option<u64>,
    #[serde(default)]
    pub monthly_max_cost_usd: Option<f64>,
    /// Percentage of a limit at which a warning event is emitted.
    #[serde(default = "default_warning_threshold_pct")]
    pub warning_threshold_pct: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            session_max_tokens: None,
            session_max_cost_usd: None,
            daily_max_tokens: None,
            daily_max_cost_usd: None,
            monthly_max_tokens: None,
            monthly_max_cost_usd: None,
            warning_threshold_pct: default_warning_threshold_pct(),
        }
    }
}

impl BudgetConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.warning_threshold_pct > 0.0 && self.warning_threshold_pct <= 100.0) {
            return Err(ConfigError::Validation(format!(
                "budget.warning_threshold_pct must be in (0, 100], got {}",
                self.warning_threshold_pct
            )));
        }
        for (name, value) in [
            ("session_max_cost_usd", self.session_max_cost_usd),
            ("daily_max_cost_usd", self.daily_max_cost_usd),
            ("monthly_max_cost_usd", self.monthly_max_cost_usd),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "budget.{name} must be a non-negative number, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn default_warning_threshold_pct() -> f64 {
    80.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Validation turn budget per request.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wall-clock bound on any single agent call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Root against which file targets are validated.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            workspace_root: default_workspace_root(),
        }
    }
}

impl OrchestratorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_attempts must be at least 1".into(),
            ));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.call_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_call_timeout_secs() -> u64 {
    300
}
fn default_workspace_root() -> String {
    ".".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of most recent records that feed the context summary.
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            summary_window: default_summary_window(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.summary_max_chars == 0 {
            return Err(ConfigError::Validation(
                "session.summary_max_chars must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_summary_window() -> usize {
    5
}
fn default_summary_max_chars() -> usize {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_planner_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_planner_input_estimate")]
    pub estimated_input_tokens: u64,
    #[serde(default = "default_planner_output_estimate")]
    pub estimated_output_tokens: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_planner_max_tokens(),
            estimated_input_tokens: default_planner_input_estimate(),
            estimated_output_tokens: default_planner_output_estimate(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_planner_max_tokens() -> u32 {
    1024
}
fn default_planner_input_estimate() -> u64 {
    2_000
}
fn default_planner_output_estimate() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Execution agent CLI binary.
    #[serde(default = "default_executor_binary")]
    pub binary: String,
    #[serde(default = "default_executor_input_estimate")]
    pub estimated_input_tokens: u64,
    #[serde(default = "default_executor_output_estimate")]
    pub estimated_output_tokens: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            binary: default_executor_binary(),
            estimated_input_tokens: default_executor_input_estimate(),
            estimated_output_tokens: default_executor_output_estimate(),
        }
    }
}

fn default_executor_binary() -> String {
    "claude".into()
}
fn default_executor_input_estimate() -> u64 {
    20_000
}
fn default_executor_output_estimate() -> u64 {
    4_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// POST target for terminal results; results are only logged when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_dispatch_timeout_secs(),
        }
    }
}

fn default_dispatch_timeout_secs() -> u64 {
    10
}

/// A rate-table row, USD per one million tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
}

impl PricingEntry {
    fn validate(&self) -> Result<(), ConfigError> {
        let ok = |v: f64| v.is_finite() && v >= 0.0;
        if !ok(self.input_cost_per_1m) || !ok(self.output_cost_per_1m) {
            return Err(ConfigError::Validation(format!(
                "pricing for {} must use non-negative rates",
                self.model
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

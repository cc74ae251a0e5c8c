use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Per-tool configuration
// ---------------------------------------------------------------------------

/// Configuration for a single checker plugin, produced by an external
/// detection/setup step and handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Free-form tool options forwarded verbatim to the plugin.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
    /// File extensions this tool cares about (e.g. `["rs", "toml"]`). Used
    /// for incremental-relevance checks; empty means relevant to everything.
    #[serde(default)]
    pub file_patterns: Vec<String>,
    /// Per-tool timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Per-tool scheduling priority override (see `scheduler::priority`).
    #[serde(default)]
    pub priority: Option<u8>,
}

impl ToolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            options: serde_json::Value::Null,
            file_patterns: Vec::new(),
            timeout_ms: None,
            priority: None,
        }
    }

    /// Whether any of `changed_files` matches this tool's file patterns.
    /// An empty pattern list matches everything.
    pub fn matches_any(&self, changed_files: &[PathBuf]) -> bool {
        if self.file_patterns.is_empty() {
            return !changed_files.is_empty();
        }
        changed_files.iter().any(|f| {
            f.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| self.file_patterns.iter().any(|p| p == ext))
        })
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Engine sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed worker pool size.
    pub max_workers: usize,
    /// Bounded pending-queue capacity.
    pub max_queue_size: usize,
    /// Dispatch loop tick interval.
    pub tick_interval_ms: u64,
    /// Default per-task timeout when none is supplied.
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: f64,
    /// Add up to 20% random jitter to retry delays.
    pub retry_jitter: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 256,
            tick_interval_ms: 10,
            default_timeout_ms: 60_000,
            default_max_retries: 2,
            retry_base_delay_ms: 100,
            retry_backoff_multiplier: 2.0,
            retry_jitter: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Project paths handed to plugins must resolve inside this directory.
    pub working_dir: PathBuf,
    /// Tracked memory ceiling for a single plugin invocation.
    pub max_memory_bytes: u64,
    pub memory_sample_interval_ms: u64,
    /// Timeout used when the sandbox is invoked outside the scheduler.
    pub default_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            max_memory_bytes: 512 * 1024 * 1024,
            memory_sample_interval_ms: 50,
            default_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub memory_limit_bytes: u64,
    /// CPU budget in whole-percent units (e.g. 400 = four cores).
    pub cpu_limit_percent: u64,
    pub max_io_ops: u64,
    pub max_network_requests: u64,
    pub monitor_interval_ms: u64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    /// Throttling lifts only once CPU usage falls below this (hysteresis).
    pub cpu_recovery_percent: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_limit_percent: 400,
            max_io_ops: 1024,
            max_network_requests: 64,
            monitor_interval_ms: 50,
            memory_warning_percent: 75.0,
            memory_critical_percent: 90.0,
            cpu_warning_percent: 75.0,
            cpu_critical_percent: 90.0,
            cpu_recovery_percent: 70.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorConfig {
    /// Error log cap; trimmed from the oldest end.
    pub max_log_size: usize,
    /// How many recent errors feed the rolling statistics window.
    pub recent_window: usize,
    pub max_consecutive_errors: u32,
    /// Errors-per-recent-window rate above which degraded mode is suggested.
    pub degraded_error_rate: f64,
    pub degraded_response_time_ms: u64,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            max_log_size: 1000,
            recent_window: 50,
            max_consecutive_errors: 5,
            degraded_error_rate: 0.5,
            degraded_response_time_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Degradation strategies
// ---------------------------------------------------------------------------

/// Trigger thresholds for stepping *up* into a degradation level. A level
/// triggers when any threshold is met or exceeded.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DegradationTriggers {
    pub error_rate: f64,
    pub consecutive_errors: u32,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub response_time_ms: u64,
}

/// Actions applied when a level becomes active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationActions {
    pub disable_plugins: Vec<String>,
    /// Multiplier applied to effective concurrency (0 < f <= 1).
    pub concurrency_factor: f64,
    /// Multiplier applied to effective timeouts (>= 1).
    pub timeout_factor: f64,
    pub enable_cache_fallback: bool,
}

impl Default for DegradationActions {
    fn default() -> Self {
        Self {
            disable_plugins: Vec::new(),
            concurrency_factor: 1.0,
            timeout_factor: 1.0,
            enable_cache_fallback: false,
        }
    }
}

/// One rung of the degradation ladder: when to enter, what to do, and the
/// success rate required (over the monitoring window) to step back down.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationStrategy {
    pub triggers: DegradationTriggers,
    pub actions: DegradationActions,
    pub recovery_success_rate: f64,
}

impl Default for DegradationStrategy {
    fn default() -> Self {
        Self {
            triggers: DegradationTriggers::default(),
            actions: DegradationActions::default(),
            recovery_success_rate: 0.9,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub minimal: DegradationStrategy,
    pub moderate: DegradationStrategy,
    pub severe: DegradationStrategy,
    pub critical: DegradationStrategy,
    /// Minimum time between level transitions before recovery is considered.
    pub cooldown_ms: u64,
    /// Age beyond which health snapshots are pruned.
    pub monitoring_window_ms: u64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            minimal: DegradationStrategy {
                triggers: DegradationTriggers {
                    error_rate: 0.10,
                    consecutive_errors: 3,
                    memory_percent: 75.0,
                    cpu_percent: 75.0,
                    response_time_ms: 15_000,
                },
                actions: DegradationActions {
                    disable_plugins: Vec::new(),
                    concurrency_factor: 0.75,
                    timeout_factor: 1.25,
                    enable_cache_fallback: true,
                },
                recovery_success_rate: 0.90,
            },
            moderate: DegradationStrategy {
                triggers: DegradationTriggers {
                    error_rate: 0.25,
                    consecutive_errors: 5,
                    memory_percent: 85.0,
                    cpu_percent: 85.0,
                    response_time_ms: 30_000,
                },
                actions: DegradationActions {
                    disable_plugins: Vec::new(),
                    concurrency_factor: 0.5,
                    timeout_factor: 1.5,
                    enable_cache_fallback: true,
                },
                recovery_success_rate: 0.92,
            },
            severe: DegradationStrategy {
                triggers: DegradationTriggers {
                    error_rate: 0.50,
                    consecutive_errors: 8,
                    memory_percent: 92.0,
                    cpu_percent: 92.0,
                    response_time_ms: 60_000,
                },
                actions: DegradationActions {
                    disable_plugins: Vec::new(),
                    concurrency_factor: 0.25,
                    timeout_factor: 2.0,
                    enable_cache_fallback: true,
                },
                recovery_success_rate: 0.95,
            },
            critical: DegradationStrategy {
                triggers: DegradationTriggers {
                    error_rate: 0.75,
                    consecutive_errors: 12,
                    memory_percent: 97.0,
                    cpu_percent: 97.0,
                    response_time_ms: 120_000,
                },
                actions: DegradationActions {
                    disable_plugins: Vec::new(),
                    concurrency_factor: 0.1,
                    timeout_factor: 3.0,
                    enable_cache_fallback: true,
                },
                recovery_success_rate: 0.98,
            },
            cooldown_ms: 5_000,
            monitoring_window_ms: 60_000,
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Top-level engine configuration, usually loaded from a TOML file produced
/// by the external project-detection step.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub sandbox: SandboxConfig,
    pub resources: ResourceConfig,
    pub errors: ErrorConfig,
    pub degradation: DegradationConfig,
    /// Enabled tools keyed by tool name.
    pub tools: HashMap<String, ToolConfig>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_workers == 0 {
            return Err(ConfigError::Invalid("scheduler.max_workers must be > 0".into()));
        }
        if self.scheduler.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_queue_size must be > 0".into(),
            ));
        }
        if self.scheduler.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "scheduler.retry_backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if self.resources.cpu_recovery_percent >= self.resources.cpu_critical_percent {
            return Err(ConfigError::Invalid(
                "resources.cpu_recovery_percent must be below cpu_critical_percent".into(),
            ));
        }
        for (level, s) in [
            ("minimal", &self.degradation.minimal),
            ("moderate", &self.degradation.moderate),
            ("severe", &self.degradation.severe),
            ("critical", &self.degradation.critical),
        ] {
            let f = s.actions.concurrency_factor;
            if !(f > 0.0 && f <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "degradation.{}.actions.concurrency_factor must be in (0, 1]",
                    level
                )));
            }
            if s.actions.timeout_factor < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "degradation.{}.actions.timeout_factor must be >= 1.0",
                    level
                )));
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Look up a tool's configuration, falling back to a default stanza.
    pub fn tool(&self, name: &str) -> ToolConfig {
        self.tools
            .get(name)
            .cloned()
            .unwrap_or_else(|| ToolConfig::new(name))
    }
}

// ---------------------------------------------------------------------------
// SettingsManager
// ---------------------------------------------------------------------------

/// Loads and saves the engine configuration as a TOML file on disk.
pub struct SettingsManager {
    path: PathBuf,
}

impl SettingsManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<EngineConfig, ConfigError> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: EngineConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, config: &EngineConfig) -> Result<(), ConfigError> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        let text = config.to_toml()?;
        std::fs::write(&self.path, text).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Load from disk, falling back to defaults when the file is missing or
    /// unparseable.
    pub fn load_or_default(&self) -> EngineConfig {
        self.load().unwrap_or_default()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use async_trait::async_trait;

use crate::config::ToolConfig;
use crate::context::AnalysisContext;
use crate::types::{PluginMetrics, ToolResult, ValidationReport};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Failure surface a plugin is allowed to expose. Everything a plugin raises
/// is caught at the sandbox boundary and turned into a result-shaped error;
/// this type only exists so plugin authors have a structured way to fail.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("initialization failed: {0}")]
    Init(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PluginError>;

// ---------------------------------------------------------------------------
// Plugin contract
// ---------------------------------------------------------------------------

/// The capability contract every checker implements.
///
/// A plugin is registered once with the engine and is immutable after
/// registration: `name()`, `version()` and `dependencies()` must return the
/// same values for the lifetime of the instance. Execution happens only
/// through the sandbox, one invocation per scheduled task.
///
/// Implementations must be cheap to share (`Send + Sync`); any mutable
/// per-invocation state belongs in `execute` locals, and lifetime counters
/// behind interior mutability surfaced via `metrics()`.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique tool name, e.g. `"eslint"`. Doubles as the registry key.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Names of plugins whose results this plugin depends on. Every name
    /// must resolve to another registered plugin before any analysis runs.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    /// Whether the plugin can meaningfully restrict itself to a changed-file
    /// list. Plugins answering `false` always run in incremental mode.
    fn supports_incremental(&self) -> bool {
        false
    }

    fn supports_cache(&self) -> bool {
        false
    }

    /// Called once before first execution with the resolved tool config.
    async fn initialize(&self, config: &ToolConfig) -> Result<()>;

    /// Run the check. The context carries the project path, the optional
    /// changed-file list, the cache handle and the cancellation token;
    /// long-running implementations should observe `ctx.token`.
    async fn execute(&self, ctx: &AnalysisContext) -> Result<ToolResult>;

    /// The configuration stanza this plugin ships out of the box.
    fn default_config(&self) -> ToolConfig {
        ToolConfig::new(self.name())
    }

    fn validate_config(&self, config: &ToolConfig) -> ValidationReport {
        if config.name == self.name() {
            ValidationReport::ok()
        } else {
            ValidationReport::invalid(vec![format!(
                "config is for `{}`, plugin is `{}`",
                config.name,
                self.name()
            )])
        }
    }

    /// Lifetime execution counters.
    fn metrics(&self) -> PluginMetrics {
        PluginMetrics::default()
    }

    /// Optional teardown, called when the engine shuts down.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

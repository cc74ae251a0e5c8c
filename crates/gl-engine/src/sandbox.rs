//! Supervised execution boundary around a single plugin invocation.
//!
//! The sandbox decouples scheduling from safety: it validates the context,
//! watches tracked memory while the plugin runs, converts panics and
//! malformed outputs into structured errors, and never lets a plugin
//! failure cross the boundary as anything but a result-shaped value.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gl_core::config::SandboxConfig;
use gl_core::context::AnalysisContext;
use gl_core::plugin::Plugin;
use gl_core::types::ToolResult;
use tracing::{debug, warn};

use crate::resources::{ResourceKind, ResourceManager};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("project path escapes the working directory: {0}")]
    PathViolation(PathBuf),
    #[error("plugin `{0}` exceeded the memory ceiling ({1} bytes)")]
    MemoryExceeded(String, u64),
    #[error("plugin `{0}` panicked")]
    Panicked(String),
    #[error("plugin error: {0}")]
    Plugin(String),
    #[error("plugin `{0}` returned a malformed result")]
    MalformedResult(String),
    #[error("execution cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SandboxError>;

// ---------------------------------------------------------------------------
// PluginSandbox
// ---------------------------------------------------------------------------

pub struct PluginSandbox {
    config: SandboxConfig,
    resources: Arc<ResourceManager>,
}

impl PluginSandbox {
    pub fn new(config: SandboxConfig, resources: Arc<ResourceManager>) -> Self {
        Self { config, resources }
    }

    /// Reject contexts whose project path contains traversal components or
    /// resolves outside the configured working directory.
    pub fn validate_context(&self, ctx: &AnalysisContext) -> Result<()> {
        let path = &ctx.project_path;
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(SandboxError::PathViolation(path.clone()));
        }
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            self.config.working_dir.join(path)
        };
        if !resolved.starts_with(&self.config.working_dir) {
            return Err(SandboxError::PathViolation(path.clone()));
        }
        Ok(())
    }

    /// Execute one plugin invocation under supervision, without a timeout:
    /// the caller (normally the scheduler) owns the timeout race. The
    /// invocation runs in its own task so a panic surfaces as a structured
    /// error instead of unwinding into the scheduler.
    pub async fn run(
        &self,
        plugin: Arc<dyn Plugin>,
        ctx: Arc<AnalysisContext>,
    ) -> Result<ToolResult> {
        self.validate_context(&ctx)?;
        let plugin_name = plugin.name().to_string();
        let token = ctx.token.clone();

        let mut handle = {
            let plugin = Arc::clone(&plugin);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { plugin.execute(&ctx).await })
        };

        let sample = Duration::from_millis(self.config.memory_sample_interval_ms.max(1));
        let mut interval = tokio::time::interval(sample);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                joined = &mut handle => {
                    return match joined {
                        Err(join_err) if join_err.is_panic() => {
                            warn!(plugin = %plugin_name, "plugin panicked inside sandbox");
                            Err(SandboxError::Panicked(plugin_name))
                        }
                        Err(_) => Err(SandboxError::Cancelled),
                        Ok(Err(e)) => Err(SandboxError::Plugin(e.to_string())),
                        Ok(Ok(result)) => self.validate_result(&plugin_name, result),
                    };
                }
                _ = token.cancelled() => {
                    debug!(plugin = %plugin_name, "cancellation observed, aborting invocation");
                    handle.abort();
                    return Err(SandboxError::Cancelled);
                }
                _ = interval.tick() => {
                    let used = self.resources.used(ResourceKind::Memory).await;
                    if used > self.config.max_memory_bytes {
                        warn!(
                            plugin = %plugin_name,
                            used,
                            ceiling = self.config.max_memory_bytes,
                            "memory ceiling exceeded, aborting invocation"
                        );
                        handle.abort();
                        return Err(SandboxError::MemoryExceeded(
                            plugin_name,
                            self.config.max_memory_bytes,
                        ));
                    }
                }
            }
        }
    }

    /// Direct single-plugin entry point (used outside the scheduler). Wraps
    /// [`run`](Self::run) in its own timeout race and converts every failure
    /// into a result-shaped value: no error ever escapes this call.
    pub async fn execute(&self, plugin: Arc<dyn Plugin>, ctx: Arc<AnalysisContext>) -> ToolResult {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.default_timeout_ms);
        let name = plugin.name().to_string();

        match tokio::time::timeout(timeout, self.run(plugin, ctx)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                ToolResult::synthetic_error(&name, start.elapsed().as_millis() as u64, e.to_string())
            }
            Err(_elapsed) => ToolResult::synthetic_error(
                &name,
                start.elapsed().as_millis() as u64,
                "Task execution timeout",
            ),
        }
    }

    /// Shape check: tool name must be present and match the plugin, and the
    /// metrics must be consistent with the issue list.
    fn validate_result(&self, plugin_name: &str, result: ToolResult) -> Result<ToolResult> {
        if !result.is_well_formed() || result.tool_name != plugin_name {
            return Err(SandboxError::MalformedResult(plugin_name.to_string()));
        }
        Ok(result)
    }

    pub fn working_dir(&self) -> &Path {
        &self.config.working_dir
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

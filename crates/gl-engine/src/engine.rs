//! The analysis engine: plugin registry, execution planning, and the
//! `run analysis -> aggregated result` operation.
//!
//! One explicitly constructed instance owns the registry and every
//! subsystem; there are no globals. Consumers watch progress through the
//! event bus and feed nothing back in except `cancel_analysis`.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use gl_core::cache::Cache;
use gl_core::cancel::CancellationToken;
use gl_core::config::{ConfigError, EngineConfig};
use gl_core::context::AnalysisContext;
use gl_core::plugin::Plugin;
use gl_core::types::{AnalysisResult, ToolResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::degradation::{DegradationLevel, DegradationManager, HealthSnapshot};
use crate::errors::{ErrorHandler, ErrorStats, RawError};
use crate::events::{EngineEvent, EventBus};
use crate::resolver::{DependencyResolver, GraphReport, ResolverError};
use crate::resources::{ResourceKind, ResourceManager, ResourceUsage, ALL_KINDS};
use crate::sandbox::PluginSandbox;
use crate::scheduler::{priority, SchedulerStats, TaskHandle, TaskOptions, TaskScheduler, TaskStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("duplicate plugin: {0}")]
    DuplicatePlugin(String),
    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),
    #[error("plugin `{plugin}` depends on unknown plugin `{dependency}`")]
    UnresolvableDependency { plugin: String, dependency: String },
    #[error("plugin `{0}` failed to initialize: {1}")]
    PluginInit(String, String),
    #[error("invalid dependency graph: {0:?}")]
    InvalidGraph(GraphReport),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error("analysis not found: {0}")]
    AnalysisNotFound(Uuid),
    #[error("analysis {0} was cancelled")]
    Cancelled(Uuid),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Options & snapshot
// ---------------------------------------------------------------------------

/// Per-run options for [`AnalysisEngine::execute_analysis`].
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Run only these plugins (plus their transitive dependencies).
    /// `None` runs every registered plugin.
    pub plugins: Option<Vec<String>>,
    /// Incremental mode: only plugins whose file patterns match at least one
    /// changed file run (plugins without incremental support always run).
    pub changed_files: Option<Vec<PathBuf>>,
    /// Per-task timeout override; tool-level and scheduler defaults apply
    /// when absent.
    pub timeout: Option<Duration>,
}

/// Point-in-time view over all subsystems, for presentation layers to poll.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub scheduler: SchedulerStats,
    pub resources: Vec<ResourceUsage>,
    pub degradation_level: DegradationLevel,
    pub errors: ErrorStats,
    pub active_analyses: usize,
}

struct ActiveRun {
    token: CancellationToken,
    task_ids: DashMap<Uuid, ()>,
}

// ---------------------------------------------------------------------------
// AnalysisEngine
// ---------------------------------------------------------------------------

pub struct AnalysisEngine {
    config: Arc<EngineConfig>,
    plugins: StdMutex<HashMap<String, Arc<dyn Plugin>>>,
    scheduler: Arc<TaskScheduler>,
    resources: Arc<ResourceManager>,
    errors: Arc<ErrorHandler>,
    degradation: Arc<DegradationManager>,
    events: EventBus,
    cache: Option<Arc<dyn Cache>>,
    active: DashMap<Uuid, Arc<ActiveRun>>,
}

impl AnalysisEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new();
        let resources = Arc::new(ResourceManager::new(config.resources.clone(), events.clone()));
        let sandbox = Arc::new(PluginSandbox::new(
            config.sandbox.clone(),
            Arc::clone(&resources),
        ));
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), sandbox));
        let errors = Arc::new(ErrorHandler::new(config.errors.clone()));
        let degradation = Arc::new(DegradationManager::new(
            config.degradation.clone(),
            events.clone(),
        ));
        Ok(Self {
            config: Arc::new(config),
            plugins: StdMutex::new(HashMap::new()),
            scheduler,
            resources,
            errors,
            degradation,
            events,
            cache: None,
            active: DashMap::new(),
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Start the scheduler dispatch loop and the resource monitor.
    pub fn start(&self) {
        self.scheduler.start();
        self.resources.start();
        info!("analysis engine started");
    }

    /// Stop the dispatch loop and resource monitor and give every plugin
    /// its cleanup call.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.resources.shutdown();
        let plugins: Vec<Arc<dyn Plugin>> = {
            let registry = self.plugins.lock().expect("plugin registry lock poisoned");
            registry.values().cloned().collect()
        };
        for plugin in plugins {
            if let Err(e) = plugin.cleanup().await {
                warn!(plugin = plugin.name(), error = %e, "plugin cleanup failed");
            }
        }
        info!("analysis engine stopped");
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn degradation(&self) -> &DegradationManager {
        &self.degradation
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register one plugin. The name must be unused and every declared
    /// dependency must already be registered.
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.register_plugins(vec![plugin]).await
    }

    /// Register a batch. Dependency names may refer to other members of the
    /// same batch.
    pub async fn register_plugins(&self, batch: Vec<Arc<dyn Plugin>>) -> Result<()> {
        {
            let registry = self.plugins.lock().expect("plugin registry lock poisoned");
            let mut known: BTreeSet<String> = registry.keys().cloned().collect();
            for plugin in &batch {
                let name = plugin.name().to_string();
                if !known.insert(name.clone()) {
                    return Err(EngineError::DuplicatePlugin(name));
                }
            }
            for plugin in &batch {
                for dep in plugin.dependencies() {
                    if !known.contains(dep) {
                        return Err(EngineError::UnresolvableDependency {
                            plugin: plugin.name().to_string(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }
        }

        for plugin in &batch {
            let name = plugin.name().to_string();
            let tool_config = self.config.tool(&name);
            let report = plugin.validate_config(&tool_config);
            if !report.valid {
                return Err(EngineError::PluginInit(name, report.errors.join("; ")));
            }
            plugin
                .initialize(&tool_config)
                .await
                .map_err(|e| EngineError::PluginInit(name.clone(), e.to_string()))?;
        }

        let mut registry = self.plugins.lock().expect("plugin registry lock poisoned");
        for plugin in batch {
            debug!(plugin = plugin.name(), version = plugin.version(), "plugin registered");
            registry.insert(plugin.name().to_string(), plugin);
        }
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        let registry = self.plugins.lock().expect("plugin registry lock poisoned");
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    // -----------------------------------------------------------------------
    // Analysis
    // -----------------------------------------------------------------------

    /// Run one analysis: plan, dispatch group by group, aggregate.
    pub async fn execute_analysis(
        &self,
        project_id: &str,
        project_path: impl Into<PathBuf>,
        options: AnalysisOptions,
    ) -> Result<AnalysisResult> {
        let started = Instant::now();

        let mut ctx = AnalysisContext::new(project_id, project_path)
            .with_config(Arc::clone(&self.config));
        if let Some(cache) = &self.cache {
            ctx = ctx.with_cache(Arc::clone(cache));
        }
        if let Some(files) = options.changed_files.clone() {
            ctx = ctx.with_changed_files(files);
        }
        let analysis_id = ctx.analysis_id;

        let plan = match self.plan(&options) {
            Ok(plan) => plan,
            Err(e) => {
                self.events.publish(EngineEvent::AnalysisFailed {
                    analysis_id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let run = Arc::new(ActiveRun {
            token: ctx.token.clone(),
            task_ids: DashMap::new(),
        });
        self.active.insert(analysis_id, Arc::clone(&run));
        self.events.publish(EngineEvent::AnalysisStarted {
            analysis_id,
            project_id: project_id.to_string(),
            plugin_count: plan.plugin_count,
            timestamp: Utc::now(),
        });

        let ctx = Arc::new(ctx);
        let mut results = Vec::new();
        for group in &plan.groups {
            if ctx.token.is_cancelled() {
                break;
            }
            self.run_group(&ctx, &run, group, &options, &mut results).await;

            self.degradation.record_health(self.health_snapshot().await);
            self.degradation.attempt_recovery();
        }

        self.active.remove(&analysis_id);
        if ctx.token.is_cancelled() {
            warn!(%analysis_id, "analysis cancelled");
            self.events.publish(EngineEvent::AnalysisFailed {
                analysis_id,
                error: "analysis cancelled".into(),
            });
            return Err(EngineError::Cancelled(analysis_id));
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let mut result = AnalysisResult::aggregate(project_id, results, duration_ms);
        result.id = analysis_id;
        info!(
            %analysis_id,
            score = result.overall_score,
            duration_ms,
            tools = result.summary.tool_count,
            "analysis completed"
        );
        self.events.publish(EngineEvent::AnalysisCompleted {
            analysis_id,
            overall_score: result.overall_score,
            duration_ms,
        });
        Ok(result)
    }

    /// Cancel a running analysis: trigger its token and cancel its in-flight
    /// scheduler tasks.
    pub async fn cancel_analysis(&self, analysis_id: Uuid) -> Result<()> {
        let run = self
            .active
            .get(&analysis_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::AnalysisNotFound(analysis_id))?;
        run.token.cancel();
        let ids: Vec<Uuid> = run.task_ids.iter().map(|e| *e.key()).collect();
        for id in ids {
            // Terminal tasks are a no-op; unknown ids are ignored.
            let _ = self.scheduler.cancel(id).await;
        }
        info!(%analysis_id, "cancellation requested");
        Ok(())
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        let mut resources = Vec::with_capacity(ALL_KINDS.len());
        for kind in ALL_KINDS {
            resources.push(self.resources.usage(kind).await);
        }
        EngineSnapshot {
            scheduler: self.scheduler.stats().await,
            resources,
            degradation_level: self.degradation.current_level(),
            errors: self.errors.stats(),
            active_analyses: self.active.len(),
        }
    }

    // -----------------------------------------------------------------------
    // Planning & dispatch
    // -----------------------------------------------------------------------

    fn plan(&self, options: &AnalysisOptions) -> Result<ExecutionPlan> {
        let registry = self.plugins.lock().expect("plugin registry lock poisoned");

        let selected: Vec<String> = match &options.plugins {
            Some(names) => names.clone(),
            None => registry.keys().cloned().collect(),
        };

        // Transitive dependency closure over the selection.
        let mut subset: Vec<(String, Vec<String>)> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut stack = selected;
        while let Some(name) = stack.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let plugin = registry
                .get(&name)
                .ok_or_else(|| EngineError::UnknownPlugin(name.clone()))?;
            let deps = plugin.dependencies().to_vec();
            for dep in &deps {
                if !seen.contains(dep) {
                    stack.push(dep.clone());
                }
            }
            subset.push((name, deps));
        }

        let mut resolver = DependencyResolver::new();
        for (name, deps) in &subset {
            resolver.add_plugin(name.clone(), deps.clone());
        }
        let report = resolver.validate();
        if !report.is_valid() {
            return Err(EngineError::InvalidGraph(report));
        }

        Ok(ExecutionPlan {
            plugin_count: subset.len(),
            groups: resolver.parallel_groups()?,
        })
    }

    async fn run_group(
        &self,
        ctx: &Arc<AnalysisContext>,
        run: &ActiveRun,
        group: &[String],
        options: &AnalysisOptions,
        results: &mut Vec<ToolResult>,
    ) {
        let runnable = self.filter_group(ctx, group);

        // Degradation shrinks effective concurrency by dispatching the group
        // in smaller chunks; the scheduler's pool itself stays fixed.
        let factor = self.degradation.concurrency_factor();
        let chunk_size =
            ((self.config.scheduler.max_workers as f64 * factor) as usize).max(1);

        for chunk in runnable.chunks(chunk_size) {
            let mut handles: Vec<(String, Option<TaskHandle>)> = Vec::new();
            for plugin in chunk {
                let name = plugin.name().to_string();
                self.events.publish(EngineEvent::PluginStarted {
                    analysis_id: ctx.analysis_id,
                    plugin: name.clone(),
                });
                let handle = self
                    .scheduler
                    .schedule(Arc::clone(plugin), Arc::clone(ctx), self.task_options(&name, options))
                    .await;
                match handle {
                    Ok(h) => {
                        run.task_ids.insert(h.id, ());
                        handles.push((name, Some(h)));
                    }
                    Err(e) => {
                        self.errors
                            .handle(RawError::new(e.to_string()).with_tool(&name));
                        self.events.publish(EngineEvent::PluginFailed {
                            analysis_id: ctx.analysis_id,
                            plugin: name.clone(),
                            error: e.to_string(),
                        });
                        handles.push((name, None));
                    }
                }
            }

            for (name, handle) in handles {
                let result = match handle {
                    Some(h) => self.collect(ctx, &name, h).await,
                    None => ToolResult::synthetic_error(&name, 0, "task could not be scheduled"),
                };
                results.push(result);
            }
        }
    }

    /// Drop plugins disabled by configuration or degradation, and in
    /// incremental mode plugins whose file patterns match no changed file.
    fn filter_group(&self, ctx: &AnalysisContext, group: &[String]) -> Vec<Arc<dyn Plugin>> {
        let registry = self.plugins.lock().expect("plugin registry lock poisoned");
        let mut runnable = Vec::new();
        for name in group {
            let Some(plugin) = registry.get(name) else {
                continue; // planned from the registry; cannot happen
            };
            let tool_config = self.config.tool(name);
            if !tool_config.enabled {
                debug!(plugin = %name, "skipped: disabled in configuration");
                continue;
            }
            if self.degradation.is_plugin_disabled(name) {
                self.events.publish(EngineEvent::PluginProgress {
                    analysis_id: ctx.analysis_id,
                    plugin: name.clone(),
                    message: "skipped: muted by degradation".into(),
                });
                continue;
            }
            if let Some(changed) = &ctx.changed_files {
                if plugin.supports_incremental() && !tool_config.matches_any(changed) {
                    self.events.publish(EngineEvent::PluginProgress {
                        analysis_id: ctx.analysis_id,
                        plugin: name.clone(),
                        message: "skipped: no relevant changed files".into(),
                    });
                    continue;
                }
            }
            runnable.push(Arc::clone(plugin));
        }
        runnable
    }

    fn task_options(&self, name: &str, options: &AnalysisOptions) -> TaskOptions {
        let tool_config = self.config.tool(name);
        let base_ms = options
            .timeout
            .map(|t| t.as_millis() as u64)
            .or(tool_config.timeout_ms)
            .unwrap_or(self.config.scheduler.default_timeout_ms);
        let timeout_ms = (base_ms as f64 * self.degradation.timeout_factor()) as u64;
        TaskOptions {
            priority: tool_config.priority.unwrap_or(priority::NORMAL),
            dependencies: Vec::new(), // ordering is enforced by group sequencing
            timeout: Duration::from_millis(timeout_ms),
            max_retries: self.config.scheduler.default_max_retries,
        }
    }

    /// Await one task and fold its record into exactly one ToolResult,
    /// feeding the error handler along the way.
    async fn collect(&self, ctx: &Arc<AnalysisContext>, name: &str, handle: TaskHandle) -> ToolResult {
        let record = match handle.recv().await {
            Ok(record) => record,
            Err(e) => {
                self.errors
                    .handle(RawError::new(e.to_string()).with_tool(name));
                return ToolResult::synthetic_error(name, 0, "scheduler shut down");
            }
        };

        match record.status {
            TaskStatus::Completed => {
                self.errors.record_success(record.execution_time_ms);
                self.events.publish(EngineEvent::PluginCompleted {
                    analysis_id: ctx.analysis_id,
                    plugin: name.to_string(),
                    execution_time_ms: record.execution_time_ms,
                    issues: record
                        .result
                        .as_ref()
                        .map(|r| r.issues.len())
                        .unwrap_or(0),
                });
                record.result.unwrap_or_else(|| {
                    ToolResult::synthetic_error(name, record.execution_time_ms, "missing result")
                })
            }
            _ => {
                let message = record
                    .error
                    .clone()
                    .unwrap_or_else(|| "task failed".into());
                self.errors.handle(
                    RawError::new(&message)
                        .with_tool(name)
                        .with_phase("execute")
                        .with_response_time(record.execution_time_ms),
                );
                self.events.publish(EngineEvent::PluginFailed {
                    analysis_id: ctx.analysis_id,
                    plugin: name.to_string(),
                    error: message.clone(),
                });
                record.result.unwrap_or_else(|| {
                    ToolResult::synthetic_error(name, record.execution_time_ms, &message)
                })
            }
        }
    }

    async fn health_snapshot(&self) -> HealthSnapshot {
        let stats = self.errors.stats();
        let sched = self.scheduler.stats().await;
        HealthSnapshot {
            error_rate: stats.recent_error_rate,
            success_rate: 1.0 - stats.recent_error_rate,
            consecutive_errors: stats.consecutive_errors,
            average_response_time_ms: stats.average_response_time_ms,
            memory_percent: self.resources.usage_percent(ResourceKind::Memory).await,
            cpu_percent: self.resources.usage_percent(ResourceKind::Cpu).await,
            active_plugins: sched.running,
            queue_depth: sched.queued,
            timestamp: Utc::now(),
        }
    }
}

struct ExecutionPlan {
    plugin_count: usize,
    groups: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gl_core::config::ToolConfig;
    use gl_core::plugin::PluginError;
    use gl_core::types::Issue;

    struct StubPlugin {
        name: String,
        deps: Vec<String>,
        fail: bool,
        incremental: bool,
        delay: Duration,
        issues: Vec<Issue>,
    }

    impl StubPlugin {
        fn ok(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                deps: vec![],
                fail: false,
                incremental: false,
                delay: Duration::from_millis(1),
                issues: vec![],
            })
        }

        fn with_deps(name: &str, deps: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                deps: deps.iter().map(|s| s.to_string()).collect(),
                fail: false,
                incremental: false,
                delay: Duration::from_millis(1),
                issues: vec![],
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                deps: vec![],
                fail: true,
                incremental: false,
                delay: Duration::from_millis(1),
                issues: vec![],
            })
        }

        fn incremental(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                deps: vec![],
                fail: false,
                incremental: true,
                delay: Duration::from_millis(1),
                issues: vec![],
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                deps: vec![],
                fail: false,
                incremental: false,
                delay,
                issues: vec![],
            })
        }
    }

    #[async_trait]
    impl Plugin for StubPlugin {
        fn name(&self) -> &str {
            &self.name
        }
        fn version(&self) -> &str {
            "0.0.0"
        }
        fn dependencies(&self) -> &[String] {
            &self.deps
        }
        fn supports_incremental(&self) -> bool {
            self.incremental
        }
        async fn initialize(&self, _c: &ToolConfig) -> gl_core::plugin::Result<()> {
            Ok(())
        }
        async fn execute(&self, _ctx: &AnalysisContext) -> gl_core::plugin::Result<ToolResult> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(PluginError::Execution("stub plugin failure".into()));
            }
            Ok(ToolResult::success(&self.name, 1, self.issues.clone()))
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scheduler.tick_interval_ms = 5;
        config.scheduler.default_max_retries = 0;
        config.sandbox.working_dir = PathBuf::from("/");
        config
    }

    fn engine() -> AnalysisEngine {
        let e = AnalysisEngine::new(test_config()).unwrap();
        e.start();
        e
    }

    #[tokio::test]
    async fn rejects_duplicate_plugin_names() {
        let e = engine();
        e.register_plugin(StubPlugin::ok("lint")).await.unwrap();
        let err = e.register_plugin(StubPlugin::ok("lint")).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicatePlugin(name) if name == "lint"));
    }

    #[tokio::test]
    async fn rejects_unresolvable_dependency() {
        let e = engine();
        let err = e
            .register_plugin(StubPlugin::with_deps("types", &["lint"]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnresolvableDependency { .. }));

        // The same dependency resolves inside one batch.
        e.register_plugins(vec![
            StubPlugin::ok("lint"),
            StubPlugin::with_deps("types", &["lint"]),
        ])
        .await
        .unwrap();
        assert_eq!(e.plugin_names(), vec!["lint", "types"]);
    }

    #[tokio::test]
    async fn runs_dependency_chain_in_order() {
        let e = engine();
        e.register_plugins(vec![
            StubPlugin::ok("a"),
            StubPlugin::with_deps("b", &["a"]),
            StubPlugin::with_deps("c", &["b"]),
        ])
        .await
        .unwrap();
        let rx = e.subscribe();

        let result = e
            .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
            .unwrap();
        assert_eq!(result.tool_results.len(), 3);
        assert_eq!(result.summary.tool_count, 3);

        let started: Vec<String> = rx
            .try_iter()
            .filter_map(|ev| match ev {
                EngineEvent::PluginStarted { plugin, .. } => Some(plugin),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn event_stream_brackets_the_run() {
        let e = engine();
        e.register_plugin(StubPlugin::ok("lint")).await.unwrap();
        let rx = e.subscribe();
        e.execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
            .unwrap();

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(matches!(events.first(), Some(EngineEvent::AnalysisStarted { .. })));
        assert!(matches!(events.last(), Some(EngineEvent::AnalysisCompleted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::PluginCompleted { plugin, .. } if plugin == "lint")));
    }

    #[tokio::test]
    async fn failing_plugin_yields_synthetic_result() {
        let e = engine();
        e.register_plugins(vec![StubPlugin::ok("good"), StubPlugin::failing("bad")])
            .await
            .unwrap();
        let result = e
            .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
            .unwrap();

        assert_eq!(result.tool_results.len(), 2);
        let bad = result
            .tool_results
            .iter()
            .find(|r| r.tool_name == "bad")
            .unwrap();
        assert_eq!(bad.metrics.errors_count, 1);
        assert!(e.snapshot().await.errors.total_errors >= 1);
    }

    #[tokio::test]
    async fn cycle_fails_fast_without_running_anything() {
        let e = engine();
        e.register_plugins(vec![
            StubPlugin::with_deps("a", &["b"]),
            StubPlugin::with_deps("b", &["a"]),
        ])
        .await
        .unwrap();
        let rx = e.subscribe();
        let err = e
            .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidGraph(_)));

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .all(|e| !matches!(e, EngineEvent::PluginStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::AnalysisFailed { .. })));
    }

    #[tokio::test]
    async fn unknown_requested_plugin_is_an_error() {
        let e = engine();
        e.register_plugin(StubPlugin::ok("lint")).await.unwrap();
        let err = e
            .execute_analysis(
                "proj",
                "/tmp/proj",
                AnalysisOptions {
                    plugins: Some(vec!["nope".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPlugin(name) if name == "nope"));
    }

    #[tokio::test]
    async fn subset_pulls_in_transitive_dependencies() {
        let e = engine();
        e.register_plugins(vec![
            StubPlugin::ok("a"),
            StubPlugin::with_deps("b", &["a"]),
            StubPlugin::ok("unrelated"),
        ])
        .await
        .unwrap();
        let result = e
            .execute_analysis(
                "proj",
                "/tmp/proj",
                AnalysisOptions {
                    plugins: Some(vec!["b".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut names: Vec<&str> = result
            .tool_results
            .iter()
            .map(|r| r.tool_name.as_str())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn incremental_mode_skips_irrelevant_plugins() {
        let mut config = test_config();
        config.tools.insert("rusty".into(), {
            let mut t = ToolConfig::new("rusty");
            t.file_patterns = vec!["rs".into()];
            t
        });
        let e = AnalysisEngine::new(config).unwrap();
        e.start();
        e.register_plugins(vec![
            StubPlugin::incremental("rusty"),
            StubPlugin::ok("always"),
        ])
        .await
        .unwrap();

        let result = e
            .execute_analysis(
                "proj",
                "/tmp/proj",
                AnalysisOptions {
                    changed_files: Some(vec![PathBuf::from("docs/readme.md")]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // `rusty` supports incremental and nothing matched its patterns;
        // `always` lacks incremental support and runs regardless.
        assert_eq!(result.tool_results.len(), 1);
        assert_eq!(result.tool_results[0].tool_name, "always");
    }

    #[tokio::test]
    async fn degradation_mutes_plugins() {
        let mut config = test_config();
        config.degradation.minimal.actions.disable_plugins = vec!["heavy".into()];
        let e = AnalysisEngine::new(config).unwrap();
        e.start();
        e.register_plugins(vec![StubPlugin::ok("light"), StubPlugin::ok("heavy")])
            .await
            .unwrap();

        let bad = HealthSnapshot {
            error_rate: 0.9,
            success_rate: 0.1,
            ..HealthSnapshot::healthy()
        };
        e.degradation().record_health(bad);
        assert_eq!(e.degradation().current_level(), DegradationLevel::Minimal);

        let result = e
            .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
            .unwrap();
        assert_eq!(result.tool_results.len(), 1);
        assert_eq!(result.tool_results[0].tool_name, "light");
    }

    #[tokio::test]
    async fn cancel_analysis_aborts_the_run() {
        let e = Arc::new(engine());
        e.register_plugin(StubPlugin::slow("glacial", Duration::from_secs(30)))
            .await
            .unwrap();
        let rx = e.subscribe();

        let runner = Arc::clone(&e);
        let run = tokio::spawn(async move {
            runner
                .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
                .await
        });

        // Wait for the run to appear, then cancel it.
        let analysis_id = loop {
            if let Ok(EngineEvent::AnalysisStarted { analysis_id, .. }) = rx.recv_async().await {
                break analysis_id;
            }
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        e.cancel_analysis(analysis_id).await.unwrap();

        let outcome = run.await.unwrap();
        assert!(matches!(outcome, Err(EngineError::Cancelled(id)) if id == analysis_id));
    }

    #[tokio::test]
    async fn cancel_unknown_analysis_errors() {
        let e = engine();
        let err = e.cancel_analysis(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::AnalysisNotFound(_)));
    }

    #[tokio::test]
    async fn snapshot_reflects_subsystems() {
        let e = engine();
        e.register_plugin(StubPlugin::ok("lint")).await.unwrap();
        e.execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
            .unwrap();

        let snap = e.snapshot().await;
        assert_eq!(snap.scheduler.completed, 1);
        assert_eq!(snap.degradation_level, DegradationLevel::None);
        assert_eq!(snap.resources.len(), 4);
        assert_eq!(snap.active_analyses, 0);
    }
}

//! Cross-module integration tests.
//!
//! These exercise whole workflows through the public engine API: planning
//! over a diamond dependency graph, failure-driven degradation, timeout
//! handling end to end, cancellation, and the serialized event stream a CLI
//! or dashboard would consume.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gl_core::config::{EngineConfig, ToolConfig};
use gl_core::context::AnalysisContext;
use gl_core::plugin::{Plugin, PluginError};
use gl_core::types::{Issue, IssueSeverity, ToolResult};
use gl_engine::degradation::DegradationLevel;
use gl_engine::engine::{AnalysisEngine, AnalysisOptions, EngineError};
use gl_engine::events::EngineEvent;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestPlugin {
    name: String,
    deps: Vec<String>,
    delay: Duration,
    fail: bool,
    issues: Vec<Issue>,
    executions: AtomicU32,
    cleanups: AtomicU32,
}

impl TestPlugin {
    fn builder(name: &str) -> TestPluginBuilder {
        TestPluginBuilder {
            name: name.to_string(),
            deps: Vec::new(),
            delay: Duration::from_millis(1),
            fail: false,
            issues: Vec::new(),
        }
    }
}

struct TestPluginBuilder {
    name: String,
    deps: Vec<String>,
    delay: Duration,
    fail: bool,
    issues: Vec<Issue>,
}

impl TestPluginBuilder {
    fn deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn issue(mut self, severity: IssueSeverity, message: &str) -> Self {
        self.issues.push(Issue::new(&self.name, severity, message));
        self
    }

    fn build(self) -> Arc<TestPlugin> {
        Arc::new(TestPlugin {
            name: self.name,
            deps: self.deps,
            delay: self.delay,
            fail: self.fail,
            issues: self.issues,
            executions: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &str {
        &self.name
    }
    fn version(&self) -> &str {
        "1.0.0"
    }
    fn dependencies(&self) -> &[String] {
        &self.deps
    }
    async fn initialize(&self, _config: &ToolConfig) -> gl_core::plugin::Result<()> {
        Ok(())
    }
    async fn execute(&self, _ctx: &AnalysisContext) -> gl_core::plugin::Result<ToolResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(PluginError::Execution("plugin deliberately failed".into()));
        }
        Ok(ToolResult::success(
            &self.name,
            self.delay.as_millis() as u64,
            self.issues.clone(),
        ))
    }
    async fn cleanup(&self) -> gl_core::plugin::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.tick_interval_ms = 5;
    config.scheduler.default_max_retries = 0;
    config.sandbox.working_dir = PathBuf::from("/");
    config
}

fn started_engine(config: EngineConfig) -> AnalysisEngine {
    gl_core::telemetry::init_logging("gauntlet-test", "warn");
    let engine = AnalysisEngine::new(config).expect("valid test config");
    engine.start();
    engine
}

// ===========================================================================
// Planning and execution over a dependency graph
// ===========================================================================

#[tokio::test]
async fn test_diamond_graph_runs_in_dependency_order() {
    let engine = started_engine(fast_config());
    engine
        .register_plugins(vec![
            TestPlugin::builder("base").build(),
            TestPlugin::builder("left").deps(&["base"]).build(),
            TestPlugin::builder("right").deps(&["base"]).build(),
            TestPlugin::builder("top").deps(&["left", "right"]).build(),
        ])
        .await
        .unwrap();
    let rx = engine.subscribe();

    let result = engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();
    assert_eq!(result.tool_results.len(), 4);

    let started: Vec<String> = rx
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::PluginStarted { plugin, .. } => Some(plugin),
            _ => None,
        })
        .collect();
    let pos = |name: &str| started.iter().position(|p| p == name).unwrap();
    assert_eq!(pos("base"), 0);
    assert!(pos("left") < pos("top"));
    assert!(pos("right") < pos("top"));
    assert_eq!(pos("top"), 3);
}

#[tokio::test]
async fn test_overall_score_reflects_findings() {
    let engine = started_engine(fast_config());
    engine
        .register_plugins(vec![
            TestPlugin::builder("clean").build(),
            TestPlugin::builder("noisy")
                .issue(IssueSeverity::Error, "unused variable `x`")
                .issue(IssueSeverity::Warning, "line too long")
                .build(),
        ])
        .await
        .unwrap();

    let result = engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();
    // clean scores 100, noisy scores 100 - 10 - 3 = 87.
    assert_eq!(result.overall_score, 93.5);
    assert_eq!(result.summary.total_errors, 1);
    assert_eq!(result.summary.total_warnings, 1);
    // Error-severity findings become AI prompts.
    assert_eq!(result.ai_prompts.len(), 1);
    assert_eq!(result.ai_prompts[0].related_tool, "noisy");
}

#[tokio::test]
async fn test_timeout_produces_error_result_not_a_crash() {
    let mut config = fast_config();
    config.tools.insert("sluggish".into(), {
        let mut t = ToolConfig::new("sluggish");
        t.timeout_ms = Some(50);
        t
    });
    let engine = started_engine(config);
    engine
        .register_plugin(
            TestPlugin::builder("sluggish")
                .delay(Duration::from_secs(10))
                .build(),
        )
        .await
        .unwrap();

    let result = engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();
    assert_eq!(result.tool_results.len(), 1);
    let r = &result.tool_results[0];
    assert_eq!(r.metrics.errors_count, 1);
    assert_eq!(r.issues[0].message, "Task execution timeout");
}

// ===========================================================================
// Degradation under sustained failures
// ===========================================================================

#[tokio::test]
async fn test_sustained_failures_raise_degradation_level() {
    let mut config = fast_config();
    config.degradation.minimal.actions.disable_plugins = vec!["optional-check".into()];
    let engine = started_engine(config);
    engine
        .register_plugins(vec![
            TestPlugin::builder("broken-a").failing().build(),
            TestPlugin::builder("broken-b").failing().build(),
            TestPlugin::builder("broken-c").failing().build(),
            TestPlugin::builder("optional-check").build(),
        ])
        .await
        .unwrap();

    engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();

    let snapshot = engine.snapshot().await;
    assert!(snapshot.degradation_level >= DegradationLevel::Minimal);
    assert!(engine.degradation().is_plugin_disabled("optional-check"));

    // A follow-up run skips the muted plugin.
    let second = engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();
    assert!(second
        .tool_results
        .iter()
        .all(|r| r.tool_name != "optional-check"));
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn test_cancelled_run_leaves_engine_usable() {
    let engine = Arc::new(started_engine(fast_config()));
    engine
        .register_plugin(
            TestPlugin::builder("endless")
                .delay(Duration::from_secs(60))
                .build(),
        )
        .await
        .unwrap();
    let rx = engine.subscribe();

    let runner = Arc::clone(&engine);
    let run = tokio::spawn(async move {
        runner
            .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
            .await
    });
    let analysis_id = loop {
        if let Ok(EngineEvent::AnalysisStarted { analysis_id, .. }) = rx.recv_async().await {
            break analysis_id;
        }
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.cancel_analysis(analysis_id).await.unwrap();
    assert!(matches!(
        run.await.unwrap(),
        Err(EngineError::Cancelled(_))
    ));

    // Engine state stays consistent and the next run succeeds.
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.active_analyses, 0);
    assert_eq!(snapshot.scheduler.workers_busy, 0);

    let result = engine
        .execute_analysis(
            "proj",
            "/tmp/proj",
            AnalysisOptions {
                plugins: Some(vec![]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(result.tool_results.len(), 0);
    assert_eq!(result.overall_score, 100.0);
}

// ===========================================================================
// Event stream for external consumers
// ===========================================================================

#[tokio::test]
async fn test_event_stream_serializes_as_tagged_json() {
    let engine = started_engine(fast_config());
    engine
        .register_plugins(vec![
            TestPlugin::builder("good").build(),
            TestPlugin::builder("bad").failing().build(),
        ])
        .await
        .unwrap();
    let rx = engine.subscribe();

    engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();

    let lines: Vec<String> = rx
        .try_iter()
        .map(|e| serde_json::to_string(&e).expect("every event serializes"))
        .collect();
    assert!(lines.iter().any(|l| l.contains("\"event\":\"analysis_started\"")));
    assert!(lines.iter().any(|l| l.contains("\"event\":\"plugin_completed\"")));
    assert!(lines.iter().any(|l| l.contains("\"event\":\"plugin_failed\"")));
    assert!(lines
        .iter()
        .any(|l| l.contains("\"event\":\"analysis_completed\"")));
}

#[tokio::test]
async fn test_shutdown_runs_plugin_cleanup() {
    let engine = started_engine(fast_config());
    let plugin = TestPlugin::builder("tidy").build();
    engine.register_plugin(plugin.clone()).await.unwrap();
    engine.shutdown().await;
    assert_eq!(plugin.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_plugins_run_once_per_analysis() {
    let engine = started_engine(fast_config());
    let plugin = TestPlugin::builder("single").build();
    engine.register_plugin(plugin.clone()).await.unwrap();

    engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();
    engine
        .execute_analysis("proj", "/tmp/proj", AnalysisOptions::default())
        .await
        .unwrap();
    assert_eq!(plugin.executions.load(Ordering::SeqCst), 2);
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Issue severity
// ---------------------------------------------------------------------------

/// Severity of a single reported issue. Ordered: `Info < Warning < Error <
/// Critical`, so `max()` over a result set yields the worst finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IssueSeverity::Info => "info",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Error => "error",
            IssueSeverity::Critical => "critical",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// One finding reported by a checker plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    /// Name of the tool that produced this issue.
    pub tool: String,
    pub severity: IssueSeverity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Rule/check identifier within the tool (e.g. `no-unused-vars`).
    pub rule: Option<String>,
    /// Whether the tool can fix this automatically.
    pub fixable: bool,
}

impl Issue {
    pub fn new(tool: impl Into<String>, severity: IssueSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.into(),
            severity,
            message: message.into(),
            file: None,
            line: None,
            rule: None,
            fixable: false,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn fixable(mut self) -> Self {
        self.fixable = true;
        self
    }
}

// ---------------------------------------------------------------------------
// ToolResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Warning,
}

/// Per-tool aggregate counters. `score` is 0..=100 where 100 means no
/// findings at all.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ToolMetrics {
    pub issues_count: usize,
    pub errors_count: usize,
    pub warnings_count: usize,
    pub info_count: usize,
    pub fixable_count: usize,
    pub score: f64,
}

impl ToolMetrics {
    /// Derive metrics from an issue list. The score starts at 100 and loses
    /// 10 per error, 3 per warning, 1 per info finding, floored at 0.
    pub fn from_issues(issues: &[Issue]) -> Self {
        let errors = issues
            .iter()
            .filter(|i| i.severity >= IssueSeverity::Error)
            .count();
        let warnings = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count();
        let infos = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Info)
            .count();
        let fixable = issues.iter().filter(|i| i.fixable).count();
        let penalty = errors as f64 * 10.0 + warnings as f64 * 3.0 + infos as f64;
        Self {
            issues_count: issues.len(),
            errors_count: errors,
            warnings_count: warnings,
            info_count: infos,
            fixable_count: fixable,
            score: (100.0 - penalty).max(0.0),
        }
    }
}

/// Optional coverage figures some checkers report alongside issues.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub line_percent: f64,
    pub branch_percent: Option<f64>,
}

/// The uniform per-plugin artifact. Every dispatched plugin produces exactly
/// one of these, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub execution_time_ms: u64,
    pub status: ToolStatus,
    pub issues: Vec<Issue>,
    pub metrics: ToolMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageSummary>,
}

impl ToolResult {
    /// A successful result derived from an issue list.
    pub fn success(tool_name: impl Into<String>, execution_time_ms: u64, issues: Vec<Issue>) -> Self {
        let metrics = ToolMetrics::from_issues(&issues);
        let status = if metrics.errors_count > 0 {
            ToolStatus::Error
        } else if metrics.warnings_count > 0 {
            ToolStatus::Warning
        } else {
            ToolStatus::Success
        };
        Self {
            tool_name: tool_name.into(),
            execution_time_ms,
            status,
            issues,
            metrics,
            coverage: None,
        }
    }

    /// A synthetic error-shaped result, used whenever a plugin failed to
    /// produce one itself (panic, timeout, exhausted retries, malformed
    /// output). Downstream aggregation always gets one result per plugin.
    pub fn synthetic_error(
        tool_name: impl Into<String>,
        execution_time_ms: u64,
        message: impl Into<String>,
    ) -> Self {
        let tool_name = tool_name.into();
        let issue = Issue::new(tool_name.clone(), IssueSeverity::Error, message);
        let metrics = ToolMetrics::from_issues(std::slice::from_ref(&issue));
        Self {
            tool_name,
            execution_time_ms,
            status: ToolStatus::Error,
            issues: vec![issue],
            metrics,
            coverage: None,
        }
    }

    /// Shape check performed at the sandbox boundary: a result with an empty
    /// tool name is considered malformed.
    pub fn is_well_formed(&self) -> bool {
        !self.tool_name.is_empty() && self.metrics.issues_count == self.issues.len()
    }
}

// ---------------------------------------------------------------------------
// Plugin metrics
// ---------------------------------------------------------------------------

/// Lifetime counters a plugin maintains across invocations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PluginMetrics {
    pub executions: u64,
    pub failures: u64,
    pub total_execution_time_ms: u64,
}

impl PluginMetrics {
    pub fn average_execution_time_ms(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.total_execution_time_ms as f64 / self.executions as f64
        }
    }

    pub fn record(&mut self, success: bool, execution_time_ms: u64) {
        self.executions += 1;
        if !success {
            self.failures += 1;
        }
        self.total_execution_time_ms += execution_time_ms;
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

/// Outcome of validating a tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis result
// ---------------------------------------------------------------------------

/// Totals across every tool that ran in one analysis.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisSummary {
    pub total_issues: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub total_fixable: usize,
    pub overall_score: f64,
    pub tool_count: usize,
    pub execution_time_ms: u64,
}

/// A follow-up prompt generated for one of the highest-severity issues,
/// intended for an AI assistant downstream of the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiPrompt {
    pub title: String,
    pub body: String,
    pub priority: u8,
    pub related_tool: String,
}

/// The sole artifact handed to reporting/export/persistence collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    /// Mean of per-tool scores, 0..=100.
    pub overall_score: f64,
    pub tool_results: Vec<ToolResult>,
    pub summary: AnalysisSummary,
    pub ai_prompts: Vec<AiPrompt>,
}

impl AnalysisResult {
    /// Aggregate a set of per-tool results into the final report shape.
    pub fn aggregate(
        project_id: impl Into<String>,
        tool_results: Vec<ToolResult>,
        duration_ms: u64,
    ) -> Self {
        let tool_count = tool_results.len();
        let overall_score = if tool_count == 0 {
            100.0
        } else {
            tool_results.iter().map(|r| r.metrics.score).sum::<f64>() / tool_count as f64
        };

        let summary = AnalysisSummary {
            total_issues: tool_results.iter().map(|r| r.metrics.issues_count).sum(),
            total_errors: tool_results.iter().map(|r| r.metrics.errors_count).sum(),
            total_warnings: tool_results.iter().map(|r| r.metrics.warnings_count).sum(),
            total_fixable: tool_results.iter().map(|r| r.metrics.fixable_count).sum(),
            overall_score,
            tool_count,
            execution_time_ms: duration_ms,
        };

        let ai_prompts = build_ai_prompts(&tool_results);

        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            timestamp: Utc::now(),
            duration_ms,
            overall_score,
            tool_results,
            summary,
            ai_prompts,
        }
    }
}

/// Pick the highest-severity issues (at most five) and phrase each as a
/// short actionable prompt.
fn build_ai_prompts(results: &[ToolResult]) -> Vec<AiPrompt> {
    let mut worst: Vec<&Issue> = results
        .iter()
        .flat_map(|r| r.issues.iter())
        .filter(|i| i.severity >= IssueSeverity::Error)
        .collect();
    worst.sort_by(|a, b| b.severity.cmp(&a.severity));
    worst
        .into_iter()
        .take(5)
        .map(|issue| {
            let location = match (&issue.file, issue.line) {
                (Some(f), Some(l)) => format!(" in {}:{}", f, l),
                (Some(f), None) => format!(" in {}", f),
                _ => String::new(),
            };
            AiPrompt {
                title: format!("Fix {} finding from {}", issue.severity, issue.tool),
                body: format!("Resolve the following issue{}: {}", location, issue.message),
                priority: match issue.severity {
                    IssueSeverity::Critical => 100,
                    IssueSeverity::Error => 75,
                    IssueSeverity::Warning => 50,
                    IssueSeverity::Info => 25,
                },
                related_tool: issue.tool.clone(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

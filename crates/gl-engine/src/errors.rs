//! Failure classification, recovery dispatch, and rolling error statistics.
//!
//! Every failure raised anywhere in the pipeline funnels through
//! [`ErrorHandler::handle`] and becomes one [`AnalysisError`] record with a
//! classification, a severity, and a recovery strategy. The handler keeps a
//! capped append-only log plus rolling statistics that the degradation
//! manager consumes as health input.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gl_core::config::ErrorConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Async recovery hook. Returns whether the recovery attempt succeeded.
pub type RecoveryAction =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

const RETRY_BASE_DELAY_MS: u64 = 50;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    System,
    Configuration,
    Plugin,
    Network,
    Timeout,
    Resource,
    Validation,
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::System => "system",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Plugin => "plugin",
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Resource => "resource",
            ErrorClass::Validation => "validation",
            ErrorClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Degrade,
    Skip,
    Abort,
}

/// Ordered match: first pattern group whose needle appears (case-insensitive)
/// in the message wins. Timeout outranks network because timeout messages
/// often also mention connections.
fn classify(message: &str) -> ErrorClass {
    let text = message.to_lowercase();
    let table: &[(ErrorClass, &[&str])] = &[
        (ErrorClass::Timeout, &["timeout", "timed out", "deadline"]),
        (
            ErrorClass::Network,
            &["network", "connection", "dns", "socket", "unreachable"],
        ),
        (
            ErrorClass::Resource,
            &["memory", "resource", "allocation", "throttl", "disk full", "quota"],
        ),
        (
            ErrorClass::Configuration,
            &["config", "missing field", "unknown option", "toml"],
        ),
        (
            ErrorClass::Validation,
            &["validation", "malformed", "schema", "parse error"],
        ),
        (ErrorClass::Plugin, &["plugin", "tool "]),
        (
            ErrorClass::System,
            &["permission denied", "os error", "io error", "system"],
        ),
    ];
    for (class, needles) in table {
        if needles.iter().any(|n| text.contains(n)) {
            return *class;
        }
    }
    ErrorClass::Unknown
}

fn base_severity(class: ErrorClass) -> ErrorSeverity {
    match class {
        ErrorClass::System | ErrorClass::Configuration | ErrorClass::Resource => {
            ErrorSeverity::High
        }
        ErrorClass::Plugin | ErrorClass::Network | ErrorClass::Timeout | ErrorClass::Unknown => {
            ErrorSeverity::Medium
        }
        ErrorClass::Validation => ErrorSeverity::Low,
    }
}

fn choose_strategy(class: ErrorClass, severity: ErrorSeverity) -> RecoveryStrategy {
    if severity == ErrorSeverity::Critical {
        return RecoveryStrategy::Abort;
    }
    match class {
        ErrorClass::Network | ErrorClass::Timeout => RecoveryStrategy::Retry,
        ErrorClass::Plugin => RecoveryStrategy::Fallback,
        ErrorClass::Resource => RecoveryStrategy::Degrade,
        ErrorClass::Validation => RecoveryStrategy::Skip,
        _ if severity >= ErrorSeverity::High => RecoveryStrategy::Abort,
        _ => RecoveryStrategy::Skip,
    }
}

fn suggestions_for(class: ErrorClass) -> Vec<String> {
    let lines: &[&str] = match class {
        ErrorClass::Timeout => &[
            "Increase the tool's timeout_ms in the configuration",
            "Run with a smaller changed-file set",
        ],
        ErrorClass::Network => &["Check connectivity and retry the analysis"],
        ErrorClass::Resource => &[
            "Lower max_workers to reduce concurrent resource pressure",
            "Raise the resource limits if the machine allows it",
        ],
        ErrorClass::Configuration => &["Review the tool's configuration section for invalid values"],
        ErrorClass::Validation => &["Fix the reported input and re-run"],
        ErrorClass::Plugin => &["Disable the failing tool or update it to a compatible version"],
        ErrorClass::System => &["Check file permissions and available disk space"],
        ErrorClass::Unknown => &["Re-run with RUST_LOG=debug for more detail"],
    };
    lines.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// AnalysisError
// ---------------------------------------------------------------------------

/// One classified failure record. Immutable once logged except for the retry
/// bookkeeping updated by [`ErrorHandler::recover`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisError {
    pub id: Uuid,
    pub class: ErrorClass,
    pub severity: ErrorSeverity,
    pub code: String,
    pub message: String,
    pub tool: Option<String>,
    pub phase: Option<String>,
    pub strategy: RecoveryStrategy,
    /// Completed recovery retry attempts.
    pub retry_count: u32,
    pub max_retries: u32,
    pub suggestions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Unclassified input to [`ErrorHandler::handle`].
#[derive(Debug, Clone, Default)]
pub struct RawError {
    pub message: String,
    pub code: Option<String>,
    pub tool: Option<String>,
    pub phase: Option<String>,
    pub response_time_ms: Option<u64>,
}

impl RawError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_response_time(mut self, ms: u64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub should_continue: bool,
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_class: HashMap<ErrorClass, u64>,
    pub by_severity: HashMap<ErrorSeverity, u64>,
    pub by_tool: HashMap<String, u64>,
    pub consecutive_errors: u32,
    /// Error share of the recent outcome window, 0.0..=1.0.
    pub recent_error_rate: f64,
    pub average_response_time_ms: f64,
}

#[derive(Clone, Copy)]
struct Sample {
    is_error: bool,
    response_time_ms: u64,
}

struct HandlerState {
    log: VecDeque<AnalysisError>,
    window: VecDeque<Sample>,
    consecutive_errors: u32,
    total_errors: u64,
    by_class: HashMap<ErrorClass, u64>,
    by_severity: HashMap<ErrorSeverity, u64>,
    by_tool: HashMap<String, u64>,
    severity_rules: Vec<(String, ErrorSeverity)>,
}

impl HandlerState {
    fn window_stats(&self) -> (f64, f64) {
        if self.window.is_empty() {
            return (0.0, 0.0);
        }
        let errors = self.window.iter().filter(|s| s.is_error).count();
        let rate = errors as f64 / self.window.len() as f64;
        let avg = self
            .window
            .iter()
            .map(|s| s.response_time_ms as f64)
            .sum::<f64>()
            / self.window.len() as f64;
        (rate, avg)
    }
}

// ---------------------------------------------------------------------------
// ErrorHandler
// ---------------------------------------------------------------------------

pub struct ErrorHandler {
    config: ErrorConfig,
    state: Mutex<HandlerState>,
    actions_by_code: Mutex<HashMap<String, RecoveryAction>>,
    actions_by_class: Mutex<HashMap<ErrorClass, RecoveryAction>>,
}

impl ErrorHandler {
    pub fn new(config: ErrorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HandlerState {
                log: VecDeque::new(),
                window: VecDeque::new(),
                consecutive_errors: 0,
                total_errors: 0,
                by_class: HashMap::new(),
                by_severity: HashMap::new(),
                by_tool: HashMap::new(),
                severity_rules: Vec::new(),
            }),
            actions_by_code: Mutex::new(HashMap::new()),
            actions_by_class: Mutex::new(HashMap::new()),
        }
    }

    /// Override the derived severity for any message containing `pattern`
    /// (case-insensitive). Rules are checked in registration order.
    pub fn add_severity_rule(&self, pattern: impl Into<String>, severity: ErrorSeverity) {
        let mut state = self.state.lock().expect("error handler lock poisoned");
        state
            .severity_rules
            .push((pattern.into().to_lowercase(), severity));
    }

    pub fn register_action_for_code(&self, code: impl Into<String>, action: RecoveryAction) {
        self.actions_by_code
            .lock()
            .expect("action registry lock poisoned")
            .insert(code.into(), action);
    }

    pub fn register_action_for_class(&self, class: ErrorClass, action: RecoveryAction) {
        self.actions_by_class
            .lock()
            .expect("action registry lock poisoned")
            .insert(class, action);
    }

    /// Classify a raw failure, append it to the capped log, update the
    /// rolling statistics, and return the full record.
    pub fn handle(&self, raw: RawError) -> AnalysisError {
        let class = classify(&raw.message);
        let mut state = self.state.lock().expect("error handler lock poisoned");

        let lowered = raw.message.to_lowercase();
        let severity = state
            .severity_rules
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern.as_str()))
            .map(|(_, s)| *s)
            .unwrap_or_else(|| base_severity(class));
        let strategy = choose_strategy(class, severity);

        let error = AnalysisError {
            id: Uuid::new_v4(),
            class,
            severity,
            code: raw
                .code
                .unwrap_or_else(|| format!("GL-{}", class.to_string().to_uppercase())),
            message: raw.message,
            tool: raw.tool,
            phase: raw.phase,
            strategy,
            retry_count: 0,
            max_retries: 3,
            suggestions: suggestions_for(class),
            timestamp: Utc::now(),
        };

        state.total_errors += 1;
        *state.by_class.entry(class).or_insert(0) += 1;
        *state.by_severity.entry(severity).or_insert(0) += 1;
        if let Some(tool) = &error.tool {
            *state.by_tool.entry(tool.clone()).or_insert(0) += 1;
        }
        state.consecutive_errors += 1;
        state.window.push_back(Sample {
            is_error: true,
            response_time_ms: raw.response_time_ms.unwrap_or(0),
        });
        while state.window.len() > self.config.recent_window {
            state.window.pop_front();
        }
        state.log.push_back(error.clone());
        while state.log.len() > self.config.max_log_size {
            state.log.pop_front();
        }

        warn!(
            class = %class,
            severity = ?severity,
            tool = error.tool.as_deref().unwrap_or("-"),
            "{}",
            error.message
        );
        error
    }

    /// Feed a successful outcome into the rolling window. Resets the
    /// consecutive-error counter.
    pub fn record_success(&self, response_time_ms: u64) {
        let mut state = self.state.lock().expect("error handler lock poisoned");
        state.consecutive_errors = 0;
        state.window.push_back(Sample {
            is_error: false,
            response_time_ms,
        });
        while state.window.len() > self.config.recent_window {
            state.window.pop_front();
        }
    }

    /// Execute the error's recovery strategy.
    ///
    /// Retry sleeps with exponential backoff between attempts and re-runs
    /// the registered action up to the error's own retry budget; fallback
    /// and degrade run their registered action once; skip and abort return
    /// immediately. Actions are looked up by code first, then class.
    pub async fn recover(&self, error: &mut AnalysisError) -> RecoveryOutcome {
        match error.strategy {
            RecoveryStrategy::Skip => RecoveryOutcome {
                recovered: false,
                should_continue: true,
            },
            RecoveryStrategy::Abort => RecoveryOutcome {
                recovered: false,
                should_continue: false,
            },
            RecoveryStrategy::Retry => {
                let Some(action) = self.lookup_action(error) else {
                    return RecoveryOutcome {
                        recovered: false,
                        should_continue: true,
                    };
                };
                while error.retry_count < error.max_retries {
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(error.retry_count);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    error.retry_count += 1;
                    if action().await {
                        debug!(id = %error.id, attempts = error.retry_count, "recovered by retry");
                        return RecoveryOutcome {
                            recovered: true,
                            should_continue: true,
                        };
                    }
                }
                RecoveryOutcome {
                    recovered: false,
                    should_continue: true,
                }
            }
            RecoveryStrategy::Fallback | RecoveryStrategy::Degrade => {
                let recovered = match self.lookup_action(error) {
                    Some(action) => action().await,
                    None => false,
                };
                RecoveryOutcome {
                    recovered,
                    should_continue: true,
                }
            }
        }
    }

    fn lookup_action(&self, error: &AnalysisError) -> Option<RecoveryAction> {
        if let Some(action) = self
            .actions_by_code
            .lock()
            .expect("action registry lock poisoned")
            .get(&error.code)
        {
            return Some(Arc::clone(action));
        }
        self.actions_by_class
            .lock()
            .expect("action registry lock poisoned")
            .get(&error.class)
            .cloned()
    }

    pub fn stats(&self) -> ErrorStats {
        let state = self.state.lock().expect("error handler lock poisoned");
        let (recent_error_rate, average_response_time_ms) = state.window_stats();
        ErrorStats {
            total_errors: state.total_errors,
            by_class: state.by_class.clone(),
            by_severity: state.by_severity.clone(),
            by_tool: state.by_tool.clone(),
            consecutive_errors: state.consecutive_errors,
            recent_error_rate,
            average_response_time_ms,
        }
    }

    pub fn recent_errors(&self, n: usize) -> Vec<AnalysisError> {
        let state = self.state.lock().expect("error handler lock poisoned");
        state.log.iter().rev().take(n).cloned().collect()
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().expect("error handler lock poisoned").log.len()
    }

    /// Degradation trigger input: recent error rate, consecutive failures,
    /// or average response time past the configured thresholds.
    pub fn should_enter_degraded_mode(&self) -> bool {
        let state = self.state.lock().expect("error handler lock poisoned");
        let (rate, avg_ms) = state.window_stats();
        rate >= self.config.degraded_error_rate
            || state.consecutive_errors >= self.config.max_consecutive_errors
            || avg_ms >= self.config.degraded_response_time_ms as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

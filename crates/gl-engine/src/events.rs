use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::degradation::DegradationLevel;
use crate::resources::ResourceKind;

// ---------------------------------------------------------------------------
// EngineEvent — ordered lifecycle notifications
// ---------------------------------------------------------------------------

/// Lifecycle events emitted by the engine and its subsystems. Consumers
/// (CLI output, dashboards, report generators) subscribe via [`EventBus`];
/// nothing feeds back into the engine except `cancel_analysis`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    AnalysisStarted {
        analysis_id: Uuid,
        project_id: String,
        plugin_count: usize,
        timestamp: DateTime<Utc>,
    },
    PluginStarted {
        analysis_id: Uuid,
        plugin: String,
    },
    PluginProgress {
        analysis_id: Uuid,
        plugin: String,
        message: String,
    },
    PluginCompleted {
        analysis_id: Uuid,
        plugin: String,
        execution_time_ms: u64,
        issues: usize,
    },
    PluginFailed {
        analysis_id: Uuid,
        plugin: String,
        error: String,
    },
    AnalysisCompleted {
        analysis_id: Uuid,
        overall_score: f64,
        duration_ms: u64,
    },
    AnalysisFailed {
        analysis_id: Uuid,
        error: String,
    },
    ResourcePressure {
        kind: ResourceKind,
        usage_percent: f64,
        critical: bool,
    },
    DegradationChanged {
        from: DegradationLevel,
        to: DegradationLevel,
    },
    ConfigAdjusted {
        concurrency_factor: f64,
        timeout_factor: f64,
    },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver
/// that will receive, in publish order and at most once, every event
/// published after the subscription was created. The bus is thread-safe and
/// clones cheaply; publishing never blocks (subscribers are unbounded).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish an event to all current subscribers. Disconnected subscribers
    /// are pruned automatically.
    pub fn publish(&self, event: EngineEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Graceful degradation state machine.
//!
//! Five operating levels ordered from `None` to `Critical`. Health updates
//! are compared against the next higher level's triggers only; recovery is
//! pull-based and compares recent health against the current level's success
//! threshold. Transitions always move exactly one level.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gl_core::config::{DegradationConfig, DegradationStrategy, DegradationTriggers};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{EngineEvent, EventBus};

// ---------------------------------------------------------------------------
// Levels & health input
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    None,
    Minimal,
    Moderate,
    Severe,
    Critical,
}

impl DegradationLevel {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::None => Some(Self::Minimal),
            Self::Minimal => Some(Self::Moderate),
            Self::Moderate => Some(Self::Severe),
            Self::Severe => Some(Self::Critical),
            Self::Critical => None,
        }
    }

    pub fn previous(self) -> Option<Self> {
        match self {
            Self::None => None,
            Self::Minimal => Some(Self::None),
            Self::Moderate => Some(Self::Minimal),
            Self::Severe => Some(Self::Moderate),
            Self::Critical => Some(Self::Severe),
        }
    }
}

/// Point-in-time health measurement fed by the engine between plugin groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Error share of recent outcomes, 0.0..=1.0.
    pub error_rate: f64,
    /// Success share of recent outcomes, 0.0..=1.0.
    pub success_rate: f64,
    pub consecutive_errors: u32,
    pub average_response_time_ms: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub active_plugins: usize,
    pub queue_depth: usize,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    pub fn healthy() -> Self {
        Self {
            error_rate: 0.0,
            success_rate: 1.0,
            consecutive_errors: 0,
            average_response_time_ms: 0.0,
            memory_percent: 0.0,
            cpu_percent: 0.0,
            active_plugins: 0,
            queue_depth: 0,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: DegradationLevel,
    pub to: DegradationLevel,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct Inner {
    level: DegradationLevel,
    snapshots: Vec<HealthSnapshot>,
    /// Disabled plugin names attributed to the level that disabled them.
    disabled: HashMap<String, DegradationLevel>,
    last_transition: Option<Instant>,
    transitions: Vec<Transition>,
}

pub struct DegradationManager {
    config: DegradationConfig,
    inner: Mutex<Inner>,
    events: EventBus,
}

impl DegradationManager {
    pub fn new(config: DegradationConfig, events: EventBus) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                level: DegradationLevel::None,
                snapshots: Vec::new(),
                disabled: HashMap::new(),
                last_transition: None,
                transitions: Vec::new(),
            }),
            events,
        }
    }

    fn strategy_for(&self, level: DegradationLevel) -> Option<&DegradationStrategy> {
        match level {
            DegradationLevel::None => None,
            DegradationLevel::Minimal => Some(&self.config.minimal),
            DegradationLevel::Moderate => Some(&self.config.moderate),
            DegradationLevel::Severe => Some(&self.config.severe),
            DegradationLevel::Critical => Some(&self.config.critical),
        }
    }

    /// Record a health snapshot and step up one level if the *next* level's
    /// triggers are met. Returns the new level when a transition happened.
    pub fn record_health(&self, snapshot: HealthSnapshot) -> Option<DegradationLevel> {
        let mut events = Vec::new();
        let stepped = {
            let mut inner = self.inner.lock().expect("degradation lock poisoned");
            let cutoff =
                Utc::now() - chrono::Duration::milliseconds(self.config.monitoring_window_ms as i64);
            inner.snapshots.retain(|s| s.timestamp >= cutoff);
            inner.snapshots.push(snapshot.clone());

            let Some(next) = inner.level.next() else {
                return None;
            };
            let strategy = self.strategy_for(next).expect("non-None level has a strategy");
            if !triggers_met(&strategy.triggers, &snapshot) {
                return None;
            }

            let from = inner.level;
            inner.level = next;
            inner.last_transition = Some(Instant::now());
            inner.transitions.push(Transition {
                from,
                to: next,
                at: Utc::now(),
            });
            for name in &strategy.actions.disable_plugins {
                inner.disabled.entry(name.clone()).or_insert(next);
            }
            warn!(from = ?from, to = ?next, "degradation level raised");
            events.push(EngineEvent::DegradationChanged { from, to: next });
            events.push(EngineEvent::ConfigAdjusted {
                concurrency_factor: strategy.actions.concurrency_factor,
                timeout_factor: strategy.actions.timeout_factor,
            });
            next
        };
        for e in events {
            self.events.publish(e);
        }
        Some(stepped)
    }

    /// Step down one level if the cooldown has elapsed and recent health over
    /// the monitoring window meets the current level's recovery threshold.
    /// Re-enables plugins that were disabled only by levels strictly above
    /// the new level. Returns the new level when a transition happened.
    pub fn attempt_recovery(&self) -> Option<DegradationLevel> {
        let mut events = Vec::new();
        let stepped = {
            let mut inner = self.inner.lock().expect("degradation lock poisoned");
            let current = inner.level;
            let target = current.previous()?;
            let strategy = self
                .strategy_for(current)
                .expect("non-None level has a strategy");

            let cooldown = Duration::from_millis(self.config.cooldown_ms);
            match inner.last_transition {
                Some(at) if at.elapsed() >= cooldown => {}
                _ => return None,
            }

            let cutoff =
                Utc::now() - chrono::Duration::milliseconds(self.config.monitoring_window_ms as i64);
            let recent: Vec<&HealthSnapshot> = inner
                .snapshots
                .iter()
                .filter(|s| s.timestamp >= cutoff)
                .collect();
            if recent.is_empty() {
                return None;
            }
            let success_rate =
                recent.iter().map(|s| s.success_rate).sum::<f64>() / recent.len() as f64;
            if success_rate < strategy.recovery_success_rate {
                return None;
            }

            inner.level = target;
            inner.last_transition = Some(Instant::now());
            inner.transitions.push(Transition {
                from: current,
                to: target,
                at: Utc::now(),
            });
            inner.disabled.retain(|_, disabled_at| *disabled_at <= target);
            info!(from = ?current, to = ?target, "degradation level lowered");
            events.push(EngineEvent::DegradationChanged {
                from: current,
                to: target,
            });
            let (concurrency_factor, timeout_factor) = match self.strategy_for(target) {
                Some(s) => (s.actions.concurrency_factor, s.actions.timeout_factor),
                None => (1.0, 1.0),
            };
            events.push(EngineEvent::ConfigAdjusted {
                concurrency_factor,
                timeout_factor,
            });
            target
        };
        for e in events {
            self.events.publish(e);
        }
        Some(stepped)
    }

    pub fn current_level(&self) -> DegradationLevel {
        self.inner.lock().expect("degradation lock poisoned").level
    }

    pub fn is_plugin_disabled(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("degradation lock poisoned")
            .disabled
            .contains_key(name)
    }

    pub fn disabled_plugins(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("degradation lock poisoned");
        let mut names: Vec<String> = inner.disabled.keys().cloned().collect();
        names.sort();
        names
    }

    /// Concurrency multiplier of the active level (1.0 at `None`).
    pub fn concurrency_factor(&self) -> f64 {
        let level = self.current_level();
        self.strategy_for(level)
            .map(|s| s.actions.concurrency_factor)
            .unwrap_or(1.0)
    }

    /// Timeout multiplier of the active level (1.0 at `None`).
    pub fn timeout_factor(&self) -> f64 {
        let level = self.current_level();
        self.strategy_for(level)
            .map(|s| s.actions.timeout_factor)
            .unwrap_or(1.0)
    }

    pub fn cache_fallback_enabled(&self) -> bool {
        let level = self.current_level();
        self.strategy_for(level)
            .map(|s| s.actions.enable_cache_fallback)
            .unwrap_or(false)
    }

    pub fn history(&self) -> Vec<Transition> {
        self.inner
            .lock()
            .expect("degradation lock poisoned")
            .transitions
            .clone()
    }
}

/// A level triggers when any non-zero threshold is met or exceeded.
fn triggers_met(triggers: &DegradationTriggers, snapshot: &HealthSnapshot) -> bool {
    (triggers.error_rate > 0.0 && snapshot.error_rate >= triggers.error_rate)
        || (triggers.consecutive_errors > 0
            && snapshot.consecutive_errors >= triggers.consecutive_errors)
        || (triggers.memory_percent > 0.0 && snapshot.memory_percent >= triggers.memory_percent)
        || (triggers.cpu_percent > 0.0 && snapshot.cpu_percent >= triggers.cpu_percent)
        || (triggers.response_time_ms > 0
            && snapshot.average_response_time_ms >= triggers.response_time_ms as f64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Tracking and throttling of bounded system resources.
//!
//! The allocation map and the wait queue live behind one mutex and are only
//! mutated by `request`/`release` and the monitor tick, which keeps
//! concurrent allocate/release calls race-free without holding any lock
//! across an await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gl_core::cancel::CancellationToken;
use gl_core::config::ResourceConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource request timed out after {0:?}")]
    Timeout(Duration),
    #[error("cpu allocation denied: throttled")]
    Throttled,
    #[error("unknown allocation: {0}")]
    UnknownAllocation(Uuid),
    #[error("request exceeds the {0:?} limit outright ({1} > {2})")]
    ExceedsLimit(ResourceKind, u64, u64),
    #[error("resource manager is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ResourceError>;

// ---------------------------------------------------------------------------
// Kinds & requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Io,
    Network,
}

pub const ALL_KINDS: [ResourceKind; 4] = [
    ResourceKind::Memory,
    ResourceKind::Cpu,
    ResourceKind::Io,
    ResourceKind::Network,
];

#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub kind: ResourceKind,
    pub amount: u64,
    /// Higher priority requests are satisfied first when queued.
    pub priority: u8,
    /// How long a queued request may wait before being rejected.
    pub timeout: Duration,
}

/// Point-in-time usage snapshot for one resource kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub kind: ResourceKind,
    pub used: u64,
    pub limit: u64,
}

impl ResourceUsage {
    pub fn percent(&self) -> f64 {
        if self.limit == 0 {
            0.0
        } else {
            self.used as f64 / self.limit as f64 * 100.0
        }
    }

    pub fn free(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Pool {
    limit: u64,
    used: u64,
}

struct Waiter {
    id: Uuid,
    request: ResourceRequest,
    enqueued: Instant,
    deadline: Instant,
    grant_tx: oneshot::Sender<Result<Uuid>>,
}

/// Threshold band last signalled per kind, to emit pressure events only on
/// crossings instead of every tick.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Band {
    Normal,
    Warning,
    Critical,
}

struct PoolState {
    pools: HashMap<ResourceKind, Pool>,
    allocations: HashMap<Uuid, (ResourceKind, u64)>,
    queue: Vec<Waiter>,
    throttled: bool,
    bands: HashMap<ResourceKind, Band>,
}

impl PoolState {
    fn fits(&self, kind: ResourceKind, amount: u64) -> bool {
        let pool = &self.pools[&kind];
        pool.used + amount <= pool.limit
    }

    fn allocate(&mut self, kind: ResourceKind, amount: u64) -> Uuid {
        let id = Uuid::new_v4();
        self.pools.get_mut(&kind).expect("pool exists").used += amount;
        self.allocations.insert(id, (kind, amount));
        id
    }

    fn usage(&self, kind: ResourceKind) -> ResourceUsage {
        let pool = &self.pools[&kind];
        ResourceUsage {
            kind,
            used: pool.used,
            limit: pool.limit,
        }
    }
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

pub struct ResourceManager {
    config: ResourceConfig,
    state: Mutex<PoolState>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, events: EventBus) -> Self {
        let mut pools = HashMap::new();
        pools.insert(
            ResourceKind::Memory,
            Pool {
                limit: config.memory_limit_bytes,
                used: 0,
            },
        );
        pools.insert(
            ResourceKind::Cpu,
            Pool {
                limit: config.cpu_limit_percent,
                used: 0,
            },
        );
        pools.insert(
            ResourceKind::Io,
            Pool {
                limit: config.max_io_ops,
                used: 0,
            },
        );
        pools.insert(
            ResourceKind::Network,
            Pool {
                limit: config.max_network_requests,
                used: 0,
            },
        );
        let bands = ALL_KINDS.iter().map(|k| (*k, Band::Normal)).collect();
        Self {
            config,
            state: Mutex::new(PoolState {
                pools,
                allocations: HashMap::new(),
                queue: Vec::new(),
                throttled: false,
                bands,
            }),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the monitor loop: expires queued requests, re-evaluates the
    /// queue, and checks memory/CPU thresholds on a fixed interval.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let tick = Duration::from_millis(this.config.monitor_interval_ms.max(1));
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = interval.tick() => this.monitor_tick().await,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Request an allocation. Grants immediately when capacity is available;
    /// otherwise the request queues (priority, then age) and resolves when a
    /// release or monitor tick frees capacity, or rejects on timeout.
    pub async fn request(&self, request: ResourceRequest) -> Result<Uuid> {
        let timeout = request.timeout;
        let (waiter_id, rx) = {
            let mut state = self.state.lock().await;

            let limit = state.pools[&request.kind].limit;
            if request.amount > limit {
                return Err(ResourceError::ExceedsLimit(request.kind, request.amount, limit));
            }

            let cpu_denied = request.kind == ResourceKind::Cpu && state.throttled;
            if !cpu_denied && state.fits(request.kind, request.amount) {
                let id = state.allocate(request.kind, request.amount);
                debug!(kind = ?request.kind, amount = request.amount, %id, "allocated");
                return Ok(id);
            }

            // Queue, ordered by descending priority then arrival.
            let (grant_tx, grant_rx) = oneshot::channel();
            let waiter = Waiter {
                id: Uuid::new_v4(),
                enqueued: Instant::now(),
                deadline: Instant::now() + timeout,
                request,
                grant_tx,
            };
            let waiter_id = waiter.id;
            let key = |w: &Waiter| (std::cmp::Reverse(w.request.priority), w.enqueued);
            let pos = state.queue.partition_point(|w| key(w) <= key(&waiter));
            state.queue.insert(pos, waiter);
            (waiter_id, grant_rx)
        };

        // Backstop in case the monitor loop is not running: enforce the
        // request's own deadline here as well.
        match tokio::time::timeout(timeout + Duration::from_millis(50), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_sender_dropped)) => Err(ResourceError::Shutdown),
            Err(_elapsed) => {
                // Remove ourselves so the monitor cannot grant to nobody.
                let mut state = self.state.lock().await;
                state.queue.retain(|w| w.id != waiter_id);
                Err(ResourceError::Timeout(timeout))
            }
        }
    }

    /// Release a tracked allocation. Double release is a no-op returning
    /// failure. Immediately retries queued requests (backpressure release).
    pub async fn release(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let (kind, amount) = state
            .allocations
            .remove(&id)
            .ok_or(ResourceError::UnknownAllocation(id))?;
        let pool = state.pools.get_mut(&kind).expect("pool exists");
        pool.used = pool.used.saturating_sub(amount);
        debug!(kind = ?kind, amount, %id, "released");
        self.drain_queue(&mut state);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn used(&self, kind: ResourceKind) -> u64 {
        self.state.lock().await.usage(kind).used
    }

    pub async fn usage(&self, kind: ResourceKind) -> ResourceUsage {
        self.state.lock().await.usage(kind)
    }

    pub async fn usage_percent(&self, kind: ResourceKind) -> f64 {
        self.state.lock().await.usage(kind).percent()
    }

    pub async fn queued_requests(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_throttled(&self) -> bool {
        self.state.lock().await.throttled
    }

    /// One boolean the degradation manager consumes: memory or CPU past the
    /// warning threshold, or CPU throttling active.
    pub async fn is_under_pressure(&self) -> bool {
        let state = self.state.lock().await;
        state.throttled
            || state.usage(ResourceKind::Memory).percent() >= self.config.memory_warning_percent
            || state.usage(ResourceKind::Cpu).percent() >= self.config.cpu_warning_percent
    }

    // -----------------------------------------------------------------------
    // Monitor tick
    // -----------------------------------------------------------------------

    async fn monitor_tick(&self) {
        let mut state = self.state.lock().await;
        self.expire_waiters(&mut state);
        self.drain_queue(&mut state);
        self.check_thresholds(&mut state);
    }

    fn expire_waiters(&self, state: &mut PoolState) {
        let now = Instant::now();
        let mut i = 0;
        while i < state.queue.len() {
            if state.queue[i].deadline <= now {
                let waiter = state.queue.remove(i);
                warn!(kind = ?waiter.request.kind, "queued resource request timed out");
                let _ = waiter
                    .grant_tx
                    .send(Err(ResourceError::Timeout(waiter.request.timeout)));
            } else {
                i += 1;
            }
        }
    }

    /// Grant queued requests, in order, wherever capacity now allows.
    fn drain_queue(&self, state: &mut PoolState) {
        let mut i = 0;
        while i < state.queue.len() {
            let w = &state.queue[i];
            let cpu_denied = w.request.kind == ResourceKind::Cpu && state.throttled;
            if !cpu_denied && state.fits(w.request.kind, w.request.amount) {
                let waiter = state.queue.remove(i);
                let id = state.allocate(waiter.request.kind, waiter.request.amount);
                if let Err(_unreceived) = waiter.grant_tx.send(Ok(id)) {
                    // Requester gave up waiting; roll the grant back.
                    if let Some((kind, amount)) = state.allocations.remove(&id) {
                        let pool = state.pools.get_mut(&kind).expect("pool exists");
                        pool.used = pool.used.saturating_sub(amount);
                    }
                } else {
                    debug!(kind = ?waiter.request.kind, %id, "queued request granted");
                }
            } else {
                i += 1;
            }
        }
    }

    fn check_thresholds(&self, state: &mut PoolState) {
        let checks = [
            (
                ResourceKind::Memory,
                self.config.memory_warning_percent,
                self.config.memory_critical_percent,
            ),
            (
                ResourceKind::Cpu,
                self.config.cpu_warning_percent,
                self.config.cpu_critical_percent,
            ),
        ];

        for (kind, warning, critical) in checks {
            let percent = state.usage(kind).percent();
            let band = if percent >= critical {
                Band::Critical
            } else if percent >= warning {
                Band::Warning
            } else {
                Band::Normal
            };
            let previous = state.bands.insert(kind, band);
            if previous != Some(band) && band != Band::Normal {
                self.events.publish(EngineEvent::ResourcePressure {
                    kind,
                    usage_percent: percent,
                    critical: band == Band::Critical,
                });
            }
        }

        // Hysteresis: throttling engages at the critical threshold and only
        // lifts once usage falls below the recovery threshold.
        let cpu = state.usage(ResourceKind::Cpu).percent();
        if !state.throttled && cpu >= self.config.cpu_critical_percent {
            state.throttled = true;
            info!(cpu, "cpu throttling enabled");
        } else if state.throttled && cpu < self.config.cpu_recovery_percent {
            state.throttled = false;
            info!(cpu, "cpu throttling lifted");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

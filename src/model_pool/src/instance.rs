use crate::model::ModelRuntime;
use crate::model_def::{FamilyDef, ModelFamily};
use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

const LATENCY_WINDOW: usize = 100;

/// Instance lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Not resident; no reservations held.
    Unloaded,
    /// Backend load in progress.
    Loading,
    /// Resident and idle.
    Ready,
    /// Resident with at least one execution in flight.
    Busy,
    /// Tear-down in progress. Never entered while executions are in flight.
    Unloading,
    /// Load error or repeated health-check failure.
    Failed,
}

/// Weak reference to an instance: id plus capability tag, never ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRef {
    /// Pool-assigned instance id.
    pub id: u64,
    /// Family the instance belongs to.
    pub family: ModelFamily,
}

/// Rolling performance record over a bounded window.
#[derive(Debug)]
pub(crate) struct PerfRecord {
    latencies: VecDeque<Duration>,
    total: u64,
    failures: u64,
    last_used: Instant,
    pub health_failures: u32,
}

impl PerfRecord {
    pub fn new() -> Self {
        PerfRecord {
            latencies: VecDeque::new(),
            total: 0,
            failures: 0,
            last_used: Instant::now(),
            health_failures: 0,
        }
    }

    pub fn record(&mut self, latency: Duration, success: bool) {
        self.total += 1;
        if success {
            self.latencies.push_back(latency);
            if self.latencies.len() > LATENCY_WINDOW {
                self.latencies.pop_front();
            }
        } else {
            self.failures += 1;
        }
        self.last_used = Instant::now();
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.total - self.failures) as f64 / self.total as f64
        }
    }

    pub fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            Duration::from_secs(0)
        } else {
            self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}

pub(crate) struct InstanceState {
    pub status: Status,
    pub active: usize,
    pub perf: PerfRecord,
    pub compute: Option<memory_manager::Reservation>,
    pub working: Option<memory_manager::Reservation>,
}

/// One loadable unit of inference capability. Status transitions are
/// serialized by the state lock; execution itself runs outside it.
pub(crate) struct Instance {
    pub id: u64,
    pub family: ModelFamily,
    pub def: FamilyDef,
    pub runtime: Box<dyn ModelRuntime>,
    pub state: Mutex<InstanceState>,
}

impl Instance {
    pub fn new(
        id: u64,
        def: FamilyDef,
        runtime: Box<dyn ModelRuntime>,
        compute: memory_manager::Reservation,
        working: memory_manager::Reservation,
    ) -> Self {
        Instance {
            id,
            family: def.family,
            def,
            runtime,
            state: Mutex::new(InstanceState {
                status: Status::Loading,
                active: 0,
                perf: PerfRecord::new(),
                compute: Some(compute),
                working: Some(working),
            }),
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state.lock().unwrap();
        InstanceSnapshot {
            id: self.id,
            family: self.family,
            status: state.status,
            active: state.active,
            max_concurrent: self.def.max_concurrent,
            success_rate: state.perf.success_rate(),
            average_latency: state.perf.average_latency(),
            idle_for: state.perf.idle_for(),
        }
    }
}

/// Read-only roster entry consumed by the load balancer and status
/// reporting.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    /// Pool-assigned instance id.
    pub id: u64,
    /// Family the instance belongs to.
    pub family: ModelFamily,
    /// Lifecycle state at snapshot time.
    pub status: Status,
    /// Executions currently in flight.
    pub active: usize,
    /// Concurrent executions the instance sustains.
    pub max_concurrent: usize,
    /// Rolling success rate in [0, 1].
    pub success_rate: f64,
    /// Rolling mean latency of successful executions.
    pub average_latency: Duration,
    /// Time since the instance last executed anything.
    pub idle_for: Duration,
}

impl InstanceSnapshot {
    /// Whether the instance can take one more execution right now.
    pub fn has_spare_capacity(&self) -> bool {
        matches!(self.status, Status::Ready | Status::Busy) && self.active < self.max_concurrent
    }
}

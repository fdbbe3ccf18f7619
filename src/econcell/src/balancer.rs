//! Load balancing over the instance roster. Capability match is always the
//! hard pre-filter; the configured strategy breaks the remaining tie, and
//! verification-class tasks fan out to every capable candidate instead.

use model_pool::{InstanceRef, InstanceSnapshot, ModelFamily};
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};
use task_queue::TaskType;

const OUTCOME_WINDOW: usize = 100;

/// Families capable of serving a task type. A closed lookup: adding a
/// family means extending this match.
pub fn capable_families(task_type: TaskType) -> &'static [ModelFamily] {
    match task_type {
        TaskType::HypothesisGeneration | TaskType::DataAnalysis => &[ModelFamily::Reasoning],
        TaskType::PolicyAnalysis | TaskType::Forecasting => {
            &[ModelFamily::Reasoning, ModelFamily::Verification]
        }
        TaskType::Verification => &[ModelFamily::Verification],
        TaskType::DataEnrichment | TaskType::AnomalyDetection => &[ModelFamily::Enrichment],
    }
}

/// Errors during selection.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// No capable instance with spare capacity exists right now.
    NoCapableInstance(TaskType),
}

/// A capable candidate as seen by a strategy: the pool's snapshot plus the
/// balancer's own rolling outcome view of that instance.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Roster entry from the pool.
    pub snapshot: InstanceSnapshot,
    /// Rolling success rate observed by the balancer.
    pub success_rate: f64,
    /// Rolling mean latency of successful executions.
    pub average_latency: Duration,
}

/// Selection strategy over capable candidates, swappable without changing
/// callers.
pub trait Strategy: Send + Sync {
    /// Pick one index from a non-empty candidate slice.
    fn pick(&self, candidates: &[Candidate]) -> usize;

    /// Strategy name, for logs.
    fn name(&self) -> &'static str;
}

/// Prefer the candidate with the fewest executions in flight.
pub struct LeastLoaded;

impl Strategy for LeastLoaded {
    fn pick(&self, candidates: &[Candidate]) -> usize {
        let mut best = 0;
        for (idx, candidate) in candidates.iter().enumerate().skip(1) {
            if candidate.snapshot.active < candidates[best].snapshot.active {
                best = idx;
            }
        }
        best
    }

    fn name(&self) -> &'static str {
        "least_loaded"
    }
}

/// Prefer the highest rolling success rate, breaking ties on lower rolling
/// latency. The default strategy.
pub struct PerformanceWeighted;

impl Strategy for PerformanceWeighted {
    fn pick(&self, candidates: &[Candidate]) -> usize {
        let mut best = 0;
        for (idx, candidate) in candidates.iter().enumerate().skip(1) {
            let current = &candidates[best];
            let better = candidate.success_rate > current.success_rate
                || (candidate.success_rate == current.success_rate
                    && candidate.average_latency < current.average_latency);
            if better {
                best = idx;
            }
        }
        best
    }

    fn name(&self) -> &'static str {
        "performance_weighted"
    }
}

struct RollingOutcomes {
    window: VecDeque<(Duration, bool)>,
}

impl RollingOutcomes {
    fn new() -> Self {
        RollingOutcomes {
            window: VecDeque::new(),
        }
    }

    fn record(&mut self, latency: Duration, success: bool) {
        self.window.push_back((latency, success));
        if self.window.len() > OUTCOME_WINDOW {
            self.window.pop_front();
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|(_, success)| *success).count();
        successes as f64 / self.window.len() as f64
    }

    fn average_latency(&self) -> Duration {
        let successes: Vec<Duration> = self
            .window
            .iter()
            .filter(|(_, success)| *success)
            .map(|(latency, _)| *latency)
            .collect();
        if successes.is_empty() {
            Duration::from_secs(0)
        } else {
            successes.iter().sum::<Duration>() / successes.len() as u32
        }
    }
}

/// LoadBalancer selects instances for tasks and accumulates per-instance
/// outcome feedback for the performance-weighted strategy.
pub struct LoadBalancer {
    strategy: Box<dyn Strategy>,
    quorum: usize,
    metrics: Mutex<HashMap<u64, RollingOutcomes>>,
}

/// Result of a selection.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// One instance executes the task.
    Single(InstanceRef),
    /// Every listed instance executes the task; outputs are reconciled by
    /// consensus.
    FanOut(Vec<InstanceRef>),
}

impl LoadBalancer {
    /// Balancer with the given strategy and the default quorum of 2.
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        log::info!("LoadBalancer using {} strategy", strategy.name());
        LoadBalancer {
            strategy,
            quorum: 2,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Set the minimum fan-out quorum for verification-class tasks.
    pub fn quorum(mut self, quorum: usize) -> Self {
        self.quorum = quorum;
        self
    }

    /// Configured fan-out quorum.
    pub fn quorum_size(&self) -> usize {
        self.quorum
    }

    /// Select instance(s) for a task from the current roster. Capability
    /// filtering is applied first; verification-class tasks select every
    /// capable candidate, others go through the strategy.
    pub fn select_instance(
        &self,
        task_type: TaskType,
        roster: &[InstanceSnapshot],
    ) -> Result<Selection, Error> {
        let families = capable_families(task_type);
        let candidates: Vec<Candidate> = roster
            .iter()
            .filter(|snapshot| families.contains(&snapshot.family) && snapshot.has_spare_capacity())
            .map(|snapshot| self.candidate(snapshot))
            .collect();
        if candidates.is_empty() {
            return Err(Error::NoCapableInstance(task_type));
        }
        if task_type.requires_verification() {
            let refs = candidates
                .iter()
                .map(|candidate| InstanceRef {
                    id: candidate.snapshot.id,
                    family: candidate.snapshot.family,
                })
                .collect();
            Ok(Selection::FanOut(refs))
        } else {
            let idx = self.strategy.pick(&candidates);
            let chosen = &candidates[idx].snapshot;
            log::debug!("Selected instance {} for {:?}", chosen.id, task_type);
            Ok(Selection::Single(InstanceRef {
                id: chosen.id,
                family: chosen.family,
            }))
        }
    }

    /// Feed an execution outcome into the rolling view.
    pub fn record_outcome(&self, instance: u64, latency: Duration, success: bool) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics
            .entry(instance)
            .or_insert_with(RollingOutcomes::new)
            .record(latency, success);
    }

    fn candidate(&self, snapshot: &InstanceSnapshot) -> Candidate {
        let metrics = self.metrics.lock().unwrap();
        let (success_rate, average_latency) = match metrics.get(&snapshot.id) {
            Some(outcomes) => (outcomes.success_rate(), outcomes.average_latency()),
            None => (1.0, Duration::from_secs(0)),
        };
        Candidate {
            snapshot: snapshot.clone(),
            success_rate,
            average_latency,
        }
    }
}

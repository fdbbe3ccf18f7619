//! Coordinator: the single external-facing entry point. Accepts analysis
//! requests, drives the queue -> balancer -> pool pipeline with a fixed
//! worker pool, reconciles fan-out outputs, and reports terminal results.
//! Every submitted request reaches a terminal, observable state.

use crate::balancer::{self, LoadBalancer, PerformanceWeighted, Selection, Strategy};
use crate::config::Config;
use crate::consensus;
use crossbeam::channel;
use memory_manager::{MemoryManager, Tier, TierStatus};
use model_pool::{FamilyInfo, InstanceRef, InstanceSnapshot, ModelFamily, ModelRuntime, PoolHandle};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};
use task_queue::{
    Outcome, Priority, QueueHandle, QueueStats, Status, Task, TaskError, TaskHandle, TaskQueue,
    TaskResult, TaskSpec, TaskType,
};

/// An analysis request from an external collaborator. The payload is
/// opaque structured data; the coordinator never interprets it.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Analysis category.
    pub task_type: TaskType,
    /// Caller-owned payload.
    pub payload: Arc<str>,
    /// Priority band.
    pub priority: Priority,
    /// Deadline relative to submission.
    pub deadline: Option<Duration>,
    /// Retry budget override; the configured default applies otherwise.
    pub max_retries: Option<u32>,
}

impl AnalysisRequest {
    /// A Normal-priority request without a deadline.
    pub fn new(task_type: TaskType, payload: Arc<str>) -> Self {
        AnalysisRequest {
            task_type,
            payload,
            priority: Priority::Normal,
            deadline: None,
            max_retries: None,
        }
    }

    /// Set the priority band.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a deadline relative to submission.
    pub fn deadline_in(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Override the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Handle to a submitted analysis. The result is observable exactly once.
pub struct AnalysisHandle {
    task: TaskHandle,
    submitted_at: Instant,
}

impl AnalysisHandle {
    /// Id of the underlying task.
    pub fn id(&self) -> u64 {
        self.task.id()
    }
}

/// Final report for an analysis request.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    /// Terminal status.
    pub status: Status,
    /// Result or error, with per-task diagnostics in the result envelope.
    pub outcome: Outcome,
    /// Time from submission to the terminal observation.
    pub latency: Duration,
}

/// Operational introspection for monitoring collaborators.
#[derive(Debug, Clone)]
pub struct SystemStatus {
    /// Utilization per memory tier.
    pub tiers: Vec<(Tier, TierStatus)>,
    /// Status and performance record per instance.
    pub instances: Vec<InstanceSnapshot>,
    /// Queue depth and latency metrics.
    pub queue: QueueStats,
}

/// Errors surfaced by the coordinator API.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The queue rejected the submission.
    Rejected(task_queue::Error),
    /// `await_result_timeout` elapsed; the request itself keeps running.
    WaitTimeout,
}

type RuntimeFactory = Box<dyn Fn() -> Box<dyn ModelRuntime> + Send + Sync>;

/// Builder wiring the coordinator from a [`Config`] and one backend
/// factory per family.
pub struct CoordinatorBuilder {
    config: Config,
    strategy: Box<dyn Strategy>,
    runtimes: Vec<(ModelFamily, RuntimeFactory)>,
}

impl CoordinatorBuilder {
    /// Register the backend factory for a family.
    pub fn runtime<F>(mut self, family: ModelFamily, factory: F) -> Self
    where
        F: 'static + Fn() -> Box<dyn ModelRuntime> + Send + Sync,
    {
        self.runtimes.push((family, Box::new(factory)));
        self
    }

    /// Replace the default performance-weighted selection strategy.
    pub fn strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Wire everything up and start the worker pool.
    pub fn start(self) -> Coordinator {
        let config = self.config;
        let memory = MemoryManager::from_tiers(&[
            (Tier::Compute, config.compute_capacity),
            (Tier::Working, config.working_capacity),
            (Tier::Cache, config.cache_capacity),
        ])
        .run();
        let mut factories: HashMap<ModelFamily, RuntimeFactory> =
            self.runtimes.into_iter().collect();
        let mut pool_builder = model_pool::Builder::new()
            .memory(memory.clone())
            .health_check_interval(Duration::from_secs(config.health_check_secs));
        for def in &config.families {
            match factories.remove(&def.family) {
                Some(factory) => {
                    pool_builder = pool_builder
                        .register_family(FamilyInfo::new(def.clone(), move || factory()));
                }
                None => log::warn!("No runtime registered for {:?}, family disabled", def.family),
            }
        }
        let pool = pool_builder.build().run();
        let queue = TaskQueue::new(config.max_queue_depth)
            .retention(Duration::from_secs(config.retention_secs))
            .backoff_base(Duration::from_millis(config.retry_backoff_ms))
            .run();
        let balancer = Arc::new(LoadBalancer::new(self.strategy).quorum(config.consensus_quorum));
        let ctx = WorkerCtx {
            queue: queue.clone(),
            pool: pool.clone(),
            balancer,
            consensus_threshold: config.consensus_threshold,
        };
        let mut workers = vec![];
        for _ in 0..config.workers {
            let ctx = ctx.clone();
            workers.push(thread::spawn(move || worker_loop(ctx)));
        }
        log::info!("Coordinator started with {} workers", config.workers);
        Coordinator {
            queue,
            pool,
            memory,
            default_max_retries: config.max_retries,
            workers: Mutex::new(workers),
        }
    }
}

/// Coordinator facade. See the module docs for the pipeline it drives.
pub struct Coordinator {
    queue: QueueHandle,
    pool: PoolHandle,
    memory: memory_manager::Handle,
    default_max_retries: u32,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Coordinator {
    /// Start building a coordinator from a configuration.
    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            strategy: Box::new(PerformanceWeighted),
            runtimes: vec![],
        }
    }

    /// Accept a request. A verification-class request becomes a single
    /// task flagged for consensus fan-out, not several tasks.
    pub fn submit(&self, request: AnalysisRequest) -> Result<AnalysisHandle, Error> {
        let mut spec = TaskSpec::new(request.task_type, request.payload)
            .priority(request.priority)
            .max_retries(request.max_retries.unwrap_or(self.default_max_retries));
        if let Some(deadline) = request.deadline {
            spec = spec.deadline_in(deadline);
        }
        let task = self.queue.enqueue(spec).map_err(Error::Rejected)?;
        log::debug!("Accepted request as task {}", task.id());
        Ok(AnalysisHandle {
            task,
            submitted_at: Instant::now(),
        })
    }

    /// Block until the request is terminal.
    pub fn await_result(&self, handle: &AnalysisHandle) -> AnalysisReport {
        report(handle, handle.task.wait())
    }

    /// Block until the request is terminal or the timeout elapses.
    pub fn await_result_timeout(
        &self,
        handle: &AnalysisHandle,
        timeout: Duration,
    ) -> Result<AnalysisReport, Error> {
        match handle.task.wait_timeout(timeout) {
            Some(outcome) => Ok(report(handle, outcome)),
            None => Err(Error::WaitTimeout),
        }
    }

    /// Cancel a request; cascades to its outstanding task. In-flight
    /// execution is interrupted best-effort and its result discarded.
    pub fn cancel(&self, handle: &AnalysisHandle) -> bool {
        self.queue.cancel(handle.task.id())
    }

    /// Per-tier memory utilization, instance roster, and queue metrics.
    pub fn system_status(&self) -> SystemStatus {
        let tiers = [Tier::Compute, Tier::Working, Tier::Cache]
            .iter()
            .filter_map(|&tier| self.memory.query(tier).ok().map(|status| (tier, status)))
            .collect();
        SystemStatus {
            tiers,
            instances: self.pool.snapshot(),
            queue: self.queue.stats(),
        }
    }

    /// Stop intake, drain the workers, and shut the pool down.
    pub fn shutdown(&self) {
        log::info!("Shutting down coordinator");
        self.queue.shutdown();
        let workers: Vec<thread::JoinHandle<()>> =
            self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        self.pool.shutdown();
    }
}

fn report(handle: &AnalysisHandle, outcome: Outcome) -> AnalysisReport {
    let status = match &outcome {
        Outcome::Completed(_) => Status::Completed,
        Outcome::Failed(_) => Status::Failed,
        Outcome::Cancelled => Status::Cancelled,
    };
    AnalysisReport {
        status,
        outcome,
        latency: handle.submitted_at.elapsed(),
    }
}

#[derive(Clone)]
struct WorkerCtx {
    queue: QueueHandle,
    pool: PoolHandle,
    balancer: Arc<LoadBalancer>,
    consensus_threshold: f64,
}

/// Worker loop: the only unbounded suspension points are the blocking
/// dequeue and awaiting instance execution. No pool or memory lock is
/// held across either.
fn worker_loop(ctx: WorkerCtx) {
    while let Some(task) = ctx.queue.dequeue_next() {
        process_task(&ctx, task);
    }
    log::debug!("Worker exiting");
}

fn process_task(ctx: &WorkerCtx, task: Task) {
    // a cancellation between claim and start is observed here
    match ctx.queue.start(task.id) {
        Ok(true) => {}
        Ok(false) => {
            log::debug!("Task {} no longer startable, dropped", task.id);
            return;
        }
        Err(_) => return,
    }
    match select_with_retry(ctx, &task) {
        Ok(Selection::Single(instance)) => execute_single(ctx, &task, instance),
        Ok(Selection::FanOut(instances)) => execute_fan_out(ctx, &task, instances),
        Err(error) => {
            let _ = ctx.queue.fail(task.id, error);
        }
    }
}

/// Select instance(s) for a task. On a miss, ask the pool to bring up the
/// required families and retry the selection exactly once.
fn select_with_retry(ctx: &WorkerCtx, task: &Task) -> Result<Selection, TaskError> {
    if let Ok(selection) = ctx
        .balancer
        .select_instance(task.task_type, &ctx.pool.snapshot())
    {
        if selection_sufficient(ctx, &selection) {
            return Ok(selection);
        }
    }
    let mut load_error = None;
    for &family in balancer::capable_families(task.task_type) {
        if let Err(error) = ctx.pool.ensure_ready(family) {
            log::warn!("Could not bring up {:?} for task {}: {:?}", family, task.id, error);
            load_error = Some(error);
        }
        if !task.task_type.requires_verification() {
            break;
        }
    }
    match ctx
        .balancer
        .select_instance(task.task_type, &ctx.pool.snapshot())
    {
        Ok(selection) => {
            if !selection_sufficient(ctx, &selection) {
                log::warn!(
                    "Task {} fans out below the quorum of {}",
                    task.id,
                    ctx.balancer.quorum_size()
                );
            }
            Ok(selection)
        }
        Err(balancer::Error::NoCapableInstance(_)) => Err(match load_error {
            Some(model_pool::Error::CapacityExceeded(_)) => TaskError::CapacityExceeded,
            Some(model_pool::Error::Load { reason, .. }) => TaskError::Load(reason),
            Some(model_pool::Error::ShuttingDown) => TaskError::Shutdown,
            _ => TaskError::NoCapableInstance,
        }),
    }
}

fn selection_sufficient(ctx: &WorkerCtx, selection: &Selection) -> bool {
    match selection {
        Selection::Single(_) => true,
        Selection::FanOut(refs) => refs.len() >= ctx.balancer.quorum_size(),
    }
}

fn execute_single(ctx: &WorkerCtx, task: &Task, instance: InstanceRef) {
    let started = Instant::now();
    let result = ctx.pool.execute(instance, &task.payload);
    let latency = started.elapsed();
    match result {
        Ok(output) => {
            ctx.balancer.record_outcome(instance.id, latency, true);
            let _ = ctx.queue.complete(
                task.id,
                TaskResult::single(instance.id, output.answer, output.confidence),
            );
        }
        Err(error) => {
            ctx.balancer.record_outcome(instance.id, latency, false);
            let _ = ctx.queue.fail(task.id, task_error(error));
        }
    }
}

/// Dispatch the same payload to every selected instance on its own thread,
/// collect the outputs, and reconcile them into a consensus result.
fn execute_fan_out(ctx: &WorkerCtx, task: &Task, instances: Vec<InstanceRef>) {
    let (tx, rx) = channel::unbounded();
    let count = instances.len();
    for instance in instances {
        let pool = ctx.pool.clone();
        let payload = task.payload.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = pool.execute(instance, &payload);
            let _ = tx.send((instance, started.elapsed(), result));
        });
    }
    drop(tx);
    let mut outputs = vec![];
    let mut last_error = None;
    for (instance, latency, result) in rx.iter().take(count) {
        match result {
            Ok(output) => {
                ctx.balancer.record_outcome(instance.id, latency, true);
                outputs.push((instance.id, output));
            }
            Err(error) => {
                ctx.balancer.record_outcome(instance.id, latency, false);
                log::warn!("Fan-out leg {} failed for task {}: {:?}", instance.id, task.id, error);
                last_error = Some(error);
            }
        }
    }
    if outputs.is_empty() {
        let error = last_error.map(task_error).unwrap_or(TaskError::NoCapableInstance);
        let _ = ctx.queue.fail(task.id, error);
        return;
    }
    let consensus = consensus::reconcile(task.id, outputs, ctx.consensus_threshold);
    if consensus.needs_review {
        log::warn!(
            "Task {} agreement {:.2} below threshold, flagged for review",
            task.id,
            consensus.agreement
        );
    }
    let result = TaskResult {
        answer: consensus.resolved_answer.clone(),
        confidence: consensus.confidence,
        instances_used: consensus.outputs.iter().map(|(id, _)| *id).collect(),
        agreement: Some(consensus.agreement),
        needs_review: consensus.needs_review,
    };
    let _ = ctx.queue.complete(task.id, result);
}

fn task_error(error: model_pool::Error) -> TaskError {
    match error {
        model_pool::Error::Execution { reason, .. } => TaskError::Execution(reason),
        model_pool::Error::Saturated(id) => {
            TaskError::Execution(format!("instance {} saturated", id))
        }
        model_pool::Error::StaleInstance(id) => {
            TaskError::Execution(format!("instance {} gone", id))
        }
        model_pool::Error::CapacityExceeded(_) => TaskError::CapacityExceeded,
        model_pool::Error::Load { reason, .. } => TaskError::Load(reason),
        model_pool::Error::UnknownFamily(_) => TaskError::NoCapableInstance,
        model_pool::Error::ShuttingDown => TaskError::Shutdown,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use model_pool::ModelOutput;
    use serial_test::serial;

    struct StaticModel {
        answer: &'static str,
        confidence: f64,
    }

    impl ModelRuntime for StaticModel {
        fn load(&self) -> Result<(), String> {
            Ok(())
        }
        fn execute(&self, _payload: &str) -> Result<ModelOutput, String> {
            Ok(ModelOutput {
                answer: self.answer.to_string(),
                confidence: self.confidence,
            })
        }
        fn ping(&self) -> bool {
            true
        }
        fn unload(&self) {}
    }

    struct BrokenModel;

    impl ModelRuntime for BrokenModel {
        fn load(&self) -> Result<(), String> {
            Ok(())
        }
        fn execute(&self, _payload: &str) -> Result<ModelOutput, String> {
            Err("inference runtime crashed".into())
        }
        fn ping(&self) -> bool {
            true
        }
        fn unload(&self) {}
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.compute_capacity = 64;
        config.working_capacity = 64;
        config.cache_capacity = 16;
        config.workers = 2;
        config.retry_backoff_ms = 10;
        config.consensus_threshold = 0.6;
        config.families = vec![
            model_pool::FamilyDef::new(ModelFamily::Reasoning, 16, 8).max_concurrent(2),
            model_pool::FamilyDef::new(ModelFamily::Verification, 16, 8),
            model_pool::FamilyDef::new(ModelFamily::Enrichment, 8, 4),
        ];
        config
    }

    fn request(task_type: TaskType) -> AnalysisRequest {
        AnalysisRequest::new(task_type, Arc::from("gdp quarterly series"))
    }

    #[serial]
    #[test]
    fn test_submit_to_completion() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "growth slows",
                    confidence: 0.85,
                })
            })
            .start();
        let handle = coordinator.submit(request(TaskType::DataAnalysis)).unwrap();
        let report = coordinator.await_result(&handle);
        assert_eq!(report.status, Status::Completed);
        match report.outcome {
            Outcome::Completed(result) => {
                assert_eq!(result.answer, "growth slows");
                assert_eq!(result.instances_used.len(), 1);
                assert_eq!(result.agreement, None);
                assert!(!result.needs_review);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_consensus_agreement() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "rates hold",
                    confidence: 0.9,
                })
            })
            .runtime(ModelFamily::Verification, || {
                Box::new(StaticModel {
                    answer: "rates hold",
                    confidence: 0.8,
                })
            })
            .start();
        let handle = coordinator
            .submit(request(TaskType::PolicyAnalysis))
            .unwrap();
        let report = coordinator.await_result(&handle);
        assert_eq!(report.status, Status::Completed);
        match report.outcome {
            Outcome::Completed(result) => {
                assert_eq!(result.answer, "rates hold");
                assert_eq!(result.agreement, Some(1.0));
                assert_eq!(result.instances_used.len(), 2);
                assert!(!result.needs_review);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_consensus_disagreement_flags_review() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "rates hold",
                    confidence: 0.9,
                })
            })
            .runtime(ModelFamily::Verification, || {
                Box::new(StaticModel {
                    answer: "rates rise",
                    confidence: 0.8,
                })
            })
            .start();
        let handle = coordinator
            .submit(request(TaskType::PolicyAnalysis))
            .unwrap();
        let report = coordinator.await_result(&handle);
        // disagreement is surfaced as data, not as a failure
        assert_eq!(report.status, Status::Completed);
        match report.outcome {
            Outcome::Completed(result) => {
                assert_eq!(result.agreement, Some(0.5));
                assert!(result.needs_review);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_retries_exhaust_into_failure() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || Box::new(BrokenModel))
            .start();
        let handle = coordinator
            .submit(request(TaskType::DataAnalysis).max_retries(2))
            .unwrap();
        let report = coordinator.await_result(&handle);
        assert_eq!(report.status, Status::Failed);
        assert_eq!(
            report.outcome,
            Outcome::Failed(TaskError::Execution("inference runtime crashed".into()))
        );
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_no_capable_instance() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "x",
                    confidence: 0.5,
                })
            })
            .start();
        // no Enrichment runtime registered
        let handle = coordinator
            .submit(request(TaskType::DataEnrichment))
            .unwrap();
        let report = coordinator.await_result(&handle);
        assert_eq!(report.outcome, Outcome::Failed(TaskError::NoCapableInstance));
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_capacity_exceeded_surfaces() {
        let mut config = test_config();
        config.compute_capacity = 8;
        let coordinator = Coordinator::builder(config)
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "x",
                    confidence: 0.5,
                })
            })
            .start();
        let handle = coordinator.submit(request(TaskType::DataAnalysis)).unwrap();
        let report = coordinator.await_result(&handle);
        assert_eq!(report.outcome, Outcome::Failed(TaskError::CapacityExceeded));
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_expired_deadline_is_terminal_immediately() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "x",
                    confidence: 0.5,
                })
            })
            .start();
        let handle = coordinator
            .submit(request(TaskType::DataAnalysis).deadline_in(Duration::from_secs(0)))
            .unwrap();
        let report = coordinator.await_result(&handle);
        assert_eq!(report.outcome, Outcome::Failed(TaskError::Timeout));
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_cancel_before_any_worker_runs() {
        let mut config = test_config();
        config.workers = 0;
        let coordinator = Coordinator::builder(config)
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "x",
                    confidence: 0.5,
                })
            })
            .start();
        let handle = coordinator.submit(request(TaskType::DataAnalysis)).unwrap();
        assert!(coordinator.cancel(&handle));
        let report = coordinator.await_result(&handle);
        assert_eq!(report.status, Status::Cancelled);
        assert_eq!(report.outcome, Outcome::Cancelled);
        coordinator.shutdown();
    }

    #[serial]
    #[test]
    fn test_system_status_and_shutdown() {
        let coordinator = Coordinator::builder(test_config())
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "steady",
                    confidence: 0.9,
                })
            })
            .start();
        let handle = coordinator.submit(request(TaskType::DataAnalysis)).unwrap();
        coordinator.await_result(&handle);
        let status = coordinator.system_status();
        assert_eq!(status.tiers.len(), 3);
        assert_eq!(status.queue.completed, 1);
        assert_eq!(status.instances.len(), 1);
        let compute = status
            .tiers
            .iter()
            .find(|(tier, _)| *tier == Tier::Compute)
            .unwrap();
        assert_eq!(compute.1.allocated, 16);
        coordinator.shutdown();
        assert!(coordinator.system_status().instances.is_empty());
        assert!(matches!(
            coordinator.submit(request(TaskType::DataAnalysis)),
            Err(Error::Rejected(task_queue::Error::Closed))
        ));
    }

    #[serial]
    #[test]
    fn test_await_result_timeout() {
        let mut config = test_config();
        config.workers = 0;
        let coordinator = Coordinator::builder(config)
            .runtime(ModelFamily::Reasoning, || {
                Box::new(StaticModel {
                    answer: "x",
                    confidence: 0.5,
                })
            })
            .start();
        let handle = coordinator.submit(request(TaskType::DataAnalysis)).unwrap();
        assert_eq!(
            coordinator
                .await_result_timeout(&handle, Duration::from_millis(30))
                .unwrap_err(),
            Error::WaitTimeout
        );
        coordinator.shutdown();
    }
}

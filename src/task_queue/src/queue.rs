//! Priority queue with atomic claiming, retry backoff, and deadline
//! enforcement. All task status transitions happen here, under one lock.

use crate::task::{Outcome, Priority, Status, Task, TaskError, TaskHandle, TaskResult, TaskSpec};
use crossbeam::channel;
use std::{
    cmp,
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

/// Errors during API calls.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// The queue is at capacity; the task was not accepted.
    QueueFull {
        /// Tasks currently tracked in non-terminal states.
        depth: usize,
        /// Configured bound.
        max_depth: usize,
    },
    /// No task with that id is known (never enqueued, or already purged).
    UnknownTask(u64),
    /// The queue is shut down and not accepting work.
    Closed,
}

/// Completion callback, invoked at most once on the terminal transition.
pub type Callback = Box<dyn FnOnce(&Outcome) + Send>;

type Delivery = (Callback, Outcome);

struct TaskRecord {
    task: Task,
    status: Status,
    max_retries: u32,
    enqueued_at: Instant,
    not_before: Instant,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    cancel_requested: bool,
    outcome_tx: channel::Sender<Outcome>,
    outcome: Option<Outcome>,
    callback: Option<Callback>,
}

/// Move a record to a terminal status and stage its notifications. The
/// handle channel is fed here; callbacks run after the queue lock drops.
fn finish(record: &mut TaskRecord, status: Status, outcome: Outcome, deliveries: &mut Vec<Delivery>) {
    record.status = status;
    record.finished_at = Some(Instant::now());
    let _ = record.outcome_tx.send(outcome.clone());
    if let Some(callback) = record.callback.take() {
        deliveries.push((callback, outcome.clone()));
    }
    record.outcome = Some(outcome);
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    wait_total: Duration,
    wait_samples: u64,
    exec_total: Duration,
    exec_samples: u64,
}

struct Inner {
    bands: BTreeMap<Priority, VecDeque<u64>>,
    records: HashMap<u64, TaskRecord>,
    next_id: u64,
    open: bool,
    stats: Counters,
}

/// Queue depth and latency metrics, consumed by the load balancer's
/// performance-weighted strategy and by system status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    /// Queued tasks per priority band.
    pub depth: Vec<(Priority, usize)>,
    /// Tasks currently Assigned or Running.
    pub in_flight: usize,
    /// Accepted submissions since start.
    pub enqueued: u64,
    /// Terminal completions.
    pub completed: u64,
    /// Terminal failures (timeouts included).
    pub failed: u64,
    /// Cancellations.
    pub cancelled: u64,
    /// Deadline expiries among the failures.
    pub timed_out: u64,
    /// Mean time from enqueue to claim.
    pub average_wait: Duration,
    /// Mean time from execution start to terminal status.
    pub average_exec: Duration,
}

struct Shared {
    inner: Mutex<Inner>,
    available: Condvar,
    max_depth: usize,
    retention: Duration,
    backoff_base: Duration,
}

/// TaskQueue configuration. [`run`] starts the deadline sweeper and hands
/// out the cloneable [`QueueHandle`].
///
/// [`run`]: TaskQueue::run
pub struct TaskQueue {
    max_depth: usize,
    sweep_interval: Duration,
    retention: Duration,
    backoff_base: Duration,
}

impl TaskQueue {
    /// Queue bounded at `max_depth` non-terminal tasks.
    pub fn new(max_depth: usize) -> Self {
        TaskQueue {
            max_depth,
            sweep_interval: Duration::from_millis(100),
            retention: Duration::from_secs(3600),
            backoff_base: Duration::from_secs(1),
        }
    }

    /// How often the sweeper checks deadlines and purges old tasks.
    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// How long terminal tasks stay queryable before being purged.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Base unit of the exponential retry backoff.
    pub fn backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    /// Start the deadline sweeper and return the queue handle.
    pub fn run(self) -> QueueHandle {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                bands: BTreeMap::new(),
                records: HashMap::new(),
                next_id: 0,
                open: true,
                stats: Counters::default(),
            }),
            available: Condvar::new(),
            max_depth: self.max_depth,
            retention: self.retention,
            backoff_base: self.backoff_base,
        });
        let sweep_interval = self.sweep_interval;
        {
            let shared = shared.clone();
            thread::spawn(move || loop {
                thread::sleep(sweep_interval);
                if !shared.inner.lock().unwrap().open {
                    break;
                }
                sweep(&shared);
            });
        }
        QueueHandle { shared }
    }
}

fn sweep(shared: &Shared) {
    let mut deliveries = vec![];
    {
        let mut inner = shared.inner.lock().unwrap();
        let now = Instant::now();
        let retention = shared.retention;
        let inner = &mut *inner;
        for record in inner.records.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            if let Some(deadline) = record.task.deadline {
                if deadline <= now {
                    log::warn!("Task {} missed deadline while {:?}", record.task.id, record.status);
                    inner.stats.timed_out += 1;
                    inner.stats.failed += 1;
                    finish(
                        record,
                        Status::Failed,
                        Outcome::Failed(TaskError::Timeout),
                        &mut deliveries,
                    );
                }
            }
        }
        inner.records.retain(|_, record| match record.finished_at {
            Some(finished) => now.duration_since(finished) < retention,
            None => true,
        });
    }
    deliver(deliveries);
}

fn deliver(deliveries: Vec<Delivery>) {
    for (callback, outcome) in deliveries {
        callback(&outcome);
    }
}

/// Cloneable handle for the queue. Safe for concurrent producers and
/// consumers; each `dequeue_next` claims exactly one task.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
}

impl QueueHandle {
    /// Accept a task. A deadline that already elapsed fails the task with
    /// a timeout immediately; it is never queued.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<TaskHandle, Error> {
        let mut deliveries = vec![];
        let result = {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.open {
                return Err(Error::Closed);
            }
            let depth = inner
                .records
                .values()
                .filter(|record| !record.status.is_terminal())
                .count();
            if depth >= self.shared.max_depth {
                return Err(Error::QueueFull {
                    depth,
                    max_depth: self.shared.max_depth,
                });
            }
            let id = inner.next_id;
            inner.next_id += 1;
            let now = Instant::now();
            let (outcome_tx, outcome_rx) = channel::bounded(1);
            let mut record = TaskRecord {
                task: Task {
                    id,
                    task_type: spec.task_type,
                    priority: spec.priority,
                    payload: spec.payload,
                    retry_count: 0,
                    deadline: spec.deadline,
                },
                status: Status::Queued,
                max_retries: spec.max_retries,
                enqueued_at: now,
                not_before: now,
                started_at: None,
                finished_at: None,
                cancel_requested: false,
                outcome_tx,
                outcome: None,
                callback: None,
            };
            inner.stats.enqueued += 1;
            let expired = matches!(spec.deadline, Some(deadline) if deadline <= now);
            if expired {
                log::warn!("Task {} enqueued with an already expired deadline", id);
                inner.stats.timed_out += 1;
                inner.stats.failed += 1;
                finish(
                    &mut record,
                    Status::Failed,
                    Outcome::Failed(TaskError::Timeout),
                    &mut deliveries,
                );
                inner.records.insert(id, record);
            } else {
                log::debug!("Enqueued task {} at {:?}", id, spec.priority);
                inner.records.insert(id, record);
                inner
                    .bands
                    .entry(spec.priority)
                    .or_insert_with(VecDeque::new)
                    .push_back(id);
                self.shared.available.notify_one();
            }
            Ok(TaskHandle::new(id, outcome_rx))
        };
        deliver(deliveries);
        result
    }

    /// Claim the next eligible task, blocking until one is available or the
    /// queue shuts down. Strict priority order, FIFO within a band; tasks
    /// in a retry backoff window are skipped until eligible.
    pub fn dequeue_next(&self) -> Option<Task> {
        let mut deliveries = vec![];
        let claimed = {
            let mut inner = self.shared.inner.lock().unwrap();
            loop {
                if let Some(task) = claim_eligible(&mut *inner, &mut deliveries) {
                    break Some(task);
                }
                if !inner.open {
                    break None;
                }
                let (guard, _) = self
                    .shared
                    .available
                    .wait_timeout(inner, Duration::from_millis(20))
                    .unwrap();
                inner = guard;
            }
        };
        deliver(deliveries);
        claimed
    }

    /// Non-blocking variant of [`dequeue_next`].
    ///
    /// [`dequeue_next`]: QueueHandle::dequeue_next
    pub fn try_dequeue(&self) -> Option<Task> {
        let mut deliveries = vec![];
        let claimed = {
            let mut inner = self.shared.inner.lock().unwrap();
            claim_eligible(&mut *inner, &mut deliveries)
        };
        deliver(deliveries);
        claimed
    }

    /// Mark an Assigned task Running. Returns `Ok(false)` when the task is
    /// no longer startable (cancelled or timed out since the claim) and the
    /// worker should drop it.
    pub fn start(&self, id: u64) -> Result<bool, Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        let record = inner.records.get_mut(&id).ok_or(Error::UnknownTask(id))?;
        if record.status != Status::Assigned || record.cancel_requested {
            return Ok(false);
        }
        record.status = Status::Running;
        record.started_at = Some(Instant::now());
        Ok(true)
    }

    /// Deliver a result for an in-flight task. A pending cancellation wins:
    /// the result is discarded and the outcome is Cancelled.
    pub fn complete(&self, id: u64, result: TaskResult) -> Result<(), Error> {
        let mut deliveries = vec![];
        {
            let mut inner = self.shared.inner.lock().unwrap();
            let inner = &mut *inner;
            let record = inner.records.get_mut(&id).ok_or(Error::UnknownTask(id))?;
            if record.status.is_terminal() {
                log::debug!("Result for task {} arrived after {:?}", id, record.status);
            } else {
                if let Some(started) = record.started_at {
                    inner.stats.exec_total += started.elapsed();
                    inner.stats.exec_samples += 1;
                }
                if record.cancel_requested {
                    inner.stats.cancelled += 1;
                    finish(record, Status::Cancelled, Outcome::Cancelled, &mut deliveries);
                } else {
                    inner.stats.completed += 1;
                    finish(
                        record,
                        Status::Completed,
                        Outcome::Completed(result),
                        &mut deliveries,
                    );
                }
            }
        }
        deliver(deliveries);
        Ok(())
    }

    /// Report a failure. Transient errors are retried at the original
    /// priority with exponential backoff until the budget is exhausted;
    /// structural and timeout errors are terminal immediately.
    pub fn fail(&self, id: u64, error: TaskError) -> Result<(), Error> {
        let mut deliveries = vec![];
        {
            let mut inner = self.shared.inner.lock().unwrap();
            let inner = &mut *inner;
            let record = inner.records.get_mut(&id).ok_or(Error::UnknownTask(id))?;
            if record.status.is_terminal() {
                log::debug!("Failure for task {} arrived after {:?}", id, record.status);
            } else if record.cancel_requested {
                inner.stats.cancelled += 1;
                finish(record, Status::Cancelled, Outcome::Cancelled, &mut deliveries);
            } else if error.is_retryable() && record.task.retry_count < record.max_retries {
                if let Some(started) = record.started_at {
                    inner.stats.exec_total += started.elapsed();
                    inner.stats.exec_samples += 1;
                }
                record.task.retry_count += 1;
                let shift = cmp::min(record.task.retry_count, 6);
                let delay = cmp::min(
                    self.shared.backoff_base * (1u32 << shift),
                    self.shared.backoff_base * 60,
                );
                record.status = Status::Queued;
                record.started_at = None;
                record.not_before = Instant::now() + delay;
                log::warn!(
                    "Task {} retry {}/{} after {:?}: {:?}",
                    id,
                    record.task.retry_count,
                    record.max_retries,
                    delay,
                    error
                );
                let priority = record.task.priority;
                inner
                    .bands
                    .entry(priority)
                    .or_insert_with(VecDeque::new)
                    .push_back(id);
                self.shared.available.notify_one();
            } else {
                log::error!("Task {} failed terminally: {:?}", id, error);
                if error == TaskError::Timeout {
                    inner.stats.timed_out += 1;
                }
                inner.stats.failed += 1;
                finish(record, Status::Failed, Outcome::Failed(error), &mut deliveries);
            }
        }
        deliver(deliveries);
        Ok(())
    }

    /// Cancel a task. Queued and Assigned tasks cancel outright; Running
    /// tasks get a best-effort flag and their result is discarded on
    /// return. Returns false once a task is already terminal.
    pub fn cancel(&self, id: u64) -> bool {
        let mut deliveries = vec![];
        let cancelled = {
            let mut inner = self.shared.inner.lock().unwrap();
            let inner = &mut *inner;
            match inner.records.get_mut(&id) {
                None => false,
                Some(record) => match record.status {
                    Status::Queued | Status::Assigned => {
                        inner.stats.cancelled += 1;
                        finish(record, Status::Cancelled, Outcome::Cancelled, &mut deliveries);
                        true
                    }
                    Status::Running => {
                        log::info!("Cancellation requested for running task {}", id);
                        record.cancel_requested = true;
                        true
                    }
                    _ => false,
                },
            }
        };
        deliver(deliveries);
        cancelled
    }

    /// Whether a cancel request is pending on a Running task.
    pub fn is_cancel_requested(&self, id: u64) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .records
            .get(&id)
            .map(|record| record.cancel_requested && !record.status.is_terminal())
            .unwrap_or(false)
    }

    /// Register a completion callback. Fires at most once; if the task is
    /// already terminal it fires right away with the recorded outcome.
    pub fn on_complete(&self, id: u64, callback: Callback) -> Result<(), Error> {
        let immediate = {
            let mut inner = self.shared.inner.lock().unwrap();
            let record = inner.records.get_mut(&id).ok_or(Error::UnknownTask(id))?;
            match &record.outcome {
                Some(outcome) => Some((callback, outcome.clone())),
                None => {
                    record.callback = Some(callback);
                    None
                }
            }
        };
        if let Some((callback, outcome)) = immediate {
            callback(&outcome);
        }
        Ok(())
    }

    /// Current status of a task, if it is still tracked.
    pub fn status(&self, id: u64) -> Option<Status> {
        let inner = self.shared.inner.lock().unwrap();
        inner.records.get(&id).map(|record| record.status)
    }

    /// Queue metrics snapshot.
    pub fn stats(&self) -> QueueStats {
        let inner = self.shared.inner.lock().unwrap();
        let mut depth: BTreeMap<Priority, usize> = BTreeMap::new();
        let mut in_flight = 0;
        for record in inner.records.values() {
            match record.status {
                Status::Queued => *depth.entry(record.task.priority).or_insert(0) += 1,
                Status::Assigned | Status::Running => in_flight += 1,
                _ => {}
            }
        }
        let stats = &inner.stats;
        let average = |total: Duration, samples: u64| {
            if samples == 0 {
                Duration::from_secs(0)
            } else {
                total / samples as u32
            }
        };
        QueueStats {
            depth: depth.into_iter().collect(),
            in_flight,
            enqueued: stats.enqueued,
            completed: stats.completed,
            failed: stats.failed,
            cancelled: stats.cancelled,
            timed_out: stats.timed_out,
            average_wait: average(stats.wait_total, stats.wait_samples),
            average_exec: average(stats.exec_total, stats.exec_samples),
        }
    }

    /// Stop accepting work, fail everything still Queued, and wake blocked
    /// consumers so they observe the shutdown.
    pub fn shutdown(&self) {
        let mut deliveries = vec![];
        {
            let mut inner = self.shared.inner.lock().unwrap();
            let inner = &mut *inner;
            if !inner.open {
                return;
            }
            inner.open = false;
            for record in inner.records.values_mut() {
                if record.status == Status::Queued {
                    inner.stats.failed += 1;
                    finish(
                        record,
                        Status::Failed,
                        Outcome::Failed(TaskError::Shutdown),
                        &mut deliveries,
                    );
                }
            }
            inner.bands.clear();
            self.shared.available.notify_all();
        }
        deliver(deliveries);
    }
}

fn claim_eligible(inner: &mut Inner, deliveries: &mut Vec<Delivery>) -> Option<Task> {
    let now = Instant::now();
    let inner = &mut *inner;
    for band in inner.bands.values_mut() {
        let mut idx = 0;
        while idx < band.len() {
            let id = band[idx];
            // entries can be stale after cancellation or a deadline sweep
            let record = match inner.records.get_mut(&id) {
                Some(record) => record,
                None => {
                    band.remove(idx);
                    continue;
                }
            };
            if record.status != Status::Queued {
                band.remove(idx);
                continue;
            }
            if let Some(deadline) = record.task.deadline {
                if deadline <= now {
                    inner.stats.timed_out += 1;
                    inner.stats.failed += 1;
                    finish(
                        record,
                        Status::Failed,
                        Outcome::Failed(TaskError::Timeout),
                        deliveries,
                    );
                    band.remove(idx);
                    continue;
                }
            }
            if record.not_before > now {
                idx += 1;
                continue;
            }
            record.status = Status::Assigned;
            inner.stats.wait_total += now - record.enqueued_at;
            inner.stats.wait_samples += 1;
            let task = record.task.clone();
            band.remove(idx);
            return Some(task);
        }
    }
    None
}

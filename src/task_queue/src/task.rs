use crossbeam::channel;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Economic-analysis task categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Generate candidate hypotheses from observed series.
    HypothesisGeneration,
    /// General analysis of structured economic data.
    DataAnalysis,
    /// Cross-check a prior answer.
    Verification,
    /// Assess the impact of a policy change.
    PolicyAnalysis,
    /// Project a series forward.
    Forecasting,
    /// Classify or annotate raw records.
    DataEnrichment,
    /// Flag outliers in a series.
    AnomalyDetection,
}

impl TaskType {
    /// Task types whose answers are cross-checked by several instances
    /// before being returned.
    pub fn requires_verification(self) -> bool {
        matches!(self, TaskType::PolicyAnalysis | TaskType::Forecasting)
    }
}

/// Priority bands, strictly ordered. Within a band tasks are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Immediate processing required.
    Critical,
    /// Ahead of the regular workload.
    High,
    /// Standard priority.
    Normal,
    /// Background processing.
    Low,
    /// Bulk processing.
    Batch,
}

/// Task execution status. Exactly one status at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting in a priority band.
    Queued,
    /// Claimed by a worker, not yet executing.
    Assigned,
    /// Executing against an instance.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before a result was produced.
    Cancelled,
}

impl Status {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

/// Failure taxonomy for task outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Instance execution returned an error. Retried up to the budget.
    Execution(String),
    /// Deadline elapsed. Terminal, never retried.
    Timeout,
    /// No loadable capacity even after a reclamation pass.
    CapacityExceeded,
    /// No instance family can satisfy the task type.
    NoCapableInstance,
    /// A model failed to load while preparing an instance for the task.
    Load(String),
    /// The queue shut down before the task reached a result.
    Shutdown,
}

impl TaskError {
    /// Only single execution failures are transient; everything else is
    /// structural or terminal and surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Execution(_))
    }
}

/// Common result envelope produced by instance execution or consensus.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    /// Resolved answer text.
    pub answer: String,
    /// Confidence reported by the instance, or derived from agreement.
    pub confidence: f64,
    /// Instance ids that contributed to the answer.
    pub instances_used: Vec<u64>,
    /// Agreement score for fan-out tasks.
    pub agreement: Option<f64>,
    /// Set when agreement fell below the review threshold.
    pub needs_review: bool,
}

impl TaskResult {
    /// Envelope for a single-instance answer.
    pub fn single(instance: u64, answer: String, confidence: f64) -> Self {
        TaskResult {
            answer,
            confidence,
            instances_used: vec![instance],
            agreement: None,
            needs_review: false,
        }
    }
}

/// Terminal observation delivered through a [`TaskHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The task produced a result.
    Completed(TaskResult),
    /// The task failed terminally.
    Failed(TaskError),
    /// The task was cancelled before producing a result.
    Cancelled,
}

/// Parameters for a task submission.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Analysis category; drives capability matching downstream.
    pub task_type: TaskType,
    /// Priority band. Ties within a band break FIFO.
    pub priority: Priority,
    /// Opaque payload, owned by the caller. The queue only references it.
    pub payload: Arc<str>,
    /// Retry budget for transient execution failures.
    pub max_retries: u32,
    /// Hard deadline; elapsing it in any non-terminal state is terminal.
    pub deadline: Option<Instant>,
}

impl TaskSpec {
    /// A Normal-priority spec with the default retry budget.
    pub fn new(task_type: TaskType, payload: Arc<str>) -> Self {
        TaskSpec {
            task_type,
            priority: Priority::Normal,
            payload,
            max_retries: 3,
            deadline: None,
        }
    }

    /// Set the priority band.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set a deadline relative to now.
    pub fn deadline_in(mut self, deadline: Duration) -> Self {
        self.deadline = Some(Instant::now() + deadline);
        self
    }
}

/// A claimed work item handed to a worker by `dequeue_next`.
#[derive(Debug, Clone)]
pub struct Task {
    /// Queue-assigned id.
    pub id: u64,
    /// Analysis category.
    pub task_type: TaskType,
    /// Priority band the task was claimed from.
    pub priority: Priority,
    /// Caller-owned payload.
    pub payload: Arc<str>,
    /// Number of retries already consumed.
    pub retry_count: u32,
    /// Hard deadline, if any.
    pub deadline: Option<Instant>,
}

/// The submitter's side of a task. Holds the receiving end of the outcome
/// channel; the terminal outcome is observable exactly once.
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    outcome_rx: channel::Receiver<Outcome>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64, outcome_rx: channel::Receiver<Outcome>) -> Self {
        TaskHandle { id, outcome_rx }
    }

    /// Queue-assigned task id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the terminal outcome.
    pub fn wait(&self) -> Outcome {
        match self.outcome_rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failed(TaskError::Shutdown),
        }
    }

    /// Block until the terminal outcome or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        match self.outcome_rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(channel::RecvTimeoutError::Timeout) => None,
            Err(channel::RecvTimeoutError::Disconnected) => {
                Some(Outcome::Failed(TaskError::Shutdown))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Low < Priority::Batch);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TaskError::Execution("boom".into()).is_retryable());
        assert!(!TaskError::Timeout.is_retryable());
        assert!(!TaskError::CapacityExceeded.is_retryable());
        assert!(!TaskError::NoCapableInstance.is_retryable());
    }

    #[test]
    fn test_verification_flag() {
        assert!(TaskType::PolicyAnalysis.requires_verification());
        assert!(TaskType::Forecasting.requires_verification());
        assert!(!TaskType::DataAnalysis.requires_verification());
    }
}

/// All backend models managed by the pool implement ModelRuntime. The pool
/// drives the lifecycle through it and delegates execution to it. A runtime
/// should be immutable after construction, hence Send + Sync.
pub trait ModelRuntime: Send + Sync {
    /// Bring the model up. Called exactly once per instance, between the
    /// Loading and Ready states.
    fn load(&self) -> Result<(), String>;

    /// Run one payload to an answer envelope. May block for the full
    /// inference duration; the pool holds no lock while this runs.
    fn execute(&self, payload: &str) -> Result<ModelOutput, String>;

    /// Liveness probe for the periodic health sweep.
    fn ping(&self) -> bool;

    /// Tear the model down. Called once the instance has drained.
    fn unload(&self);
}

/// Answer envelope produced by one instance execution. The pool does not
/// interpret it beyond passing it upward.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    /// Answer text.
    pub answer: String,
    /// Backend-reported confidence in [0, 1].
    pub confidence: f64,
}

// for testing
#[allow(dead_code)]
pub(crate) struct FakeModel;

impl ModelRuntime for FakeModel {
    fn load(&self) -> Result<(), String> {
        Ok(())
    }

    fn execute(&self, payload: &str) -> Result<ModelOutput, String> {
        Ok(ModelOutput {
            answer: format!("echo:{}", payload),
            confidence: 0.9,
        })
    }

    fn ping(&self) -> bool {
        true
    }

    fn unload(&self) {}
}

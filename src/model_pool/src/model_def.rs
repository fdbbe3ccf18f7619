use serde::Deserialize;

/// Capability tag grouping instances interchangeable for a class of tasks.
/// A closed set: the balancer's capability match is an exhaustive lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Primary analysis and hypothesis generation.
    Reasoning,
    /// Cross-checking and validation of prior answers.
    Verification,
    /// Classification, annotation, and other lightweight work.
    Enrichment,
}

/// Load parameters for one model family.
#[derive(Debug, Clone, Deserialize)]
pub struct FamilyDef {
    /// Family this definition describes.
    pub family: ModelFamily,
    /// Compute-tier footprint in MB (weights).
    pub compute_memory: u64,
    /// Working-tier footprint in MB (inference workspace).
    pub working_memory: u64,
    /// Concurrent executions one instance sustains.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Unload an instance idle for longer than this many seconds.
    #[serde(default = "default_idle_unload_secs")]
    pub idle_unload_secs: u64,
    /// Consecutive failed health checks tolerated before forced unload.
    #[serde(default = "default_max_health_failures")]
    pub max_health_failures: u32,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_idle_unload_secs() -> u64 {
    600
}

fn default_max_health_failures() -> u32 {
    3
}

impl FamilyDef {
    /// Definition with default concurrency and thresholds.
    pub fn new(family: ModelFamily, compute_memory: u64, working_memory: u64) -> Self {
        FamilyDef {
            family,
            compute_memory,
            working_memory,
            max_concurrent: default_max_concurrent(),
            idle_unload_secs: default_idle_unload_secs(),
            max_health_failures: default_max_health_failures(),
        }
    }

    /// Set the per-instance concurrency.
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the idle-unload threshold in seconds.
    pub fn idle_unload_secs(mut self, idle_unload_secs: u64) -> Self {
        self.idle_unload_secs = idle_unload_secs;
        self
    }

    /// Set the health-check failure tolerance.
    pub fn max_health_failures(mut self, max_health_failures: u32) -> Self {
        self.max_health_failures = max_health_failures;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deserialize_with_defaults() {
        let def: FamilyDef = serde_json::from_str(
            r#"{"family": "reasoning", "compute_memory": 32768, "working_memory": 8192}"#,
        )
        .unwrap();
        assert_eq!(def.family, ModelFamily::Reasoning);
        assert_eq!(def.compute_memory, 32768);
        assert_eq!(def.max_concurrent, 1);
        assert_eq!(def.idle_unload_secs, 600);
        assert_eq!(def.max_health_failures, 3);
    }

    #[test]
    fn test_deserialize_overrides() {
        let def: FamilyDef = serde_json::from_str(
            r#"{
                "family": "enrichment",
                "compute_memory": 8192,
                "working_memory": 4096,
                "max_concurrent": 3,
                "idle_unload_secs": 120,
                "max_health_failures": 1
            }"#,
        )
        .unwrap();
        assert_eq!(def.family, ModelFamily::Enrichment);
        assert_eq!(def.max_concurrent, 3);
        assert_eq!(def.idle_unload_secs, 120);
        assert_eq!(def.max_health_failures, 1);
    }
}

//! Runtime configuration. Tier capacities are initial parameters, never
//! re-partitioned while running.

use model_pool::{FamilyDef, ModelFamily};
use serde::Deserialize;

/// Coordinator configuration, deserializable from a JSON document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Compute-tier capacity in MB.
    #[serde(default = "default_compute_capacity")]
    pub compute_capacity: u64,
    /// Working-tier capacity in MB.
    #[serde(default = "default_working_capacity")]
    pub working_capacity: u64,
    /// Cache-tier capacity in MB.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    /// Size of the worker pool pulling from the task queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Agreement below this flags a consensus result for human review.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Minimum instances a consensus task fans out to.
    #[serde(default = "default_consensus_quorum")]
    pub consensus_quorum: usize,
    /// Interval of the instance health sweep in seconds.
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    /// Bound on non-terminal tasks in the queue.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Default retry budget for transient execution failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base unit of the exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long terminal tasks stay queryable, in seconds.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Model families the pool may load.
    #[serde(default = "default_families")]
    pub families: Vec<FamilyDef>,
}

fn default_compute_capacity() -> u64 {
    61_440
}

fn default_working_capacity() -> u64 {
    163_840
}

fn default_cache_capacity() -> u64 {
    16_384
}

fn default_workers() -> usize {
    4
}

fn default_consensus_threshold() -> f64 {
    0.7
}

fn default_consensus_quorum() -> usize {
    2
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_max_queue_depth() -> usize {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_families() -> Vec<FamilyDef> {
    vec![
        FamilyDef::new(ModelFamily::Reasoning, 32_768, 8_192).max_concurrent(2),
        FamilyDef::new(ModelFamily::Verification, 24_576, 12_288),
        FamilyDef::new(ModelFamily::Enrichment, 8_192, 4_096).max_concurrent(3),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            compute_capacity: default_compute_capacity(),
            working_capacity: default_working_capacity(),
            cache_capacity: default_cache_capacity(),
            workers: default_workers(),
            consensus_threshold: default_consensus_threshold(),
            consensus_quorum: default_consensus_quorum(),
            health_check_secs: default_health_check_secs(),
            max_queue_depth: default_max_queue_depth(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retention_secs: default_retention_secs(),
            families: default_families(),
        }
    }
}

impl Config {
    /// Parse a configuration document.
    pub fn from_json(text: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Load a configuration file.
    pub fn from_file(path: &str) -> Result<Config, String> {
        let text = std::fs::read_to_string(path).map_err(|e| format!("read {}: {}", path, e))?;
        Config::from_json(&text).map_err(|e| format!("parse {}: {}", path, e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.consensus_quorum, 2);
        assert!((config.consensus_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.families.len(), 3);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_json(
            r#"{
                "compute_capacity": 1024,
                "workers": 2,
                "families": [
                    {"family": "reasoning", "compute_memory": 512, "working_memory": 128}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.compute_capacity, 1024);
        assert_eq!(config.workers, 2);
        assert_eq!(config.families.len(), 1);
        assert_eq!(config.families[0].family, ModelFamily::Reasoning);
    }
}

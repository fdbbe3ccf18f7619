//! Reconciliation of fan-out outputs into a single verified answer.

use model_pool::ModelOutput;
use std::collections::HashMap;

/// Immutable record of a multi-instance verification.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    /// Task the outputs belong to.
    pub task_id: u64,
    /// Individual `(instance, output)` pairs, in arrival order.
    pub outputs: Vec<(u64, ModelOutput)>,
    /// Share of outputs agreeing with the resolved answer.
    pub agreement: f64,
    /// Derived confidence in the resolved answer.
    pub confidence: f64,
    /// Majority answer.
    pub resolved_answer: String,
    /// Agreement fell below the review threshold; a human should look.
    pub needs_review: bool,
}

/// Reconcile instance outputs. Outputs agree when their trimmed answer
/// strings are equal; the largest group wins, with summed confidence
/// breaking ties between equal-sized groups. Disagreement is not an error:
/// a low agreement score only sets the review flag.
pub fn reconcile(task_id: u64, outputs: Vec<(u64, ModelOutput)>, threshold: f64) -> ConsensusResult {
    if outputs.is_empty() {
        return ConsensusResult {
            task_id,
            outputs,
            agreement: 0.0,
            confidence: 0.0,
            resolved_answer: String::new(),
            needs_review: true,
        };
    }
    let mut groups: HashMap<&str, (usize, f64)> = HashMap::new();
    for (_, output) in &outputs {
        let entry = groups.entry(output.answer.trim()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += output.confidence;
    }
    let (answer, (count, _)) = groups
        .into_iter()
        .max_by(|(_, (count_a, conf_a)), (_, (count_b, conf_b))| {
            count_a
                .cmp(count_b)
                .then(conf_a.partial_cmp(conf_b).unwrap_or(std::cmp::Ordering::Equal))
        })
        .unwrap();
    let agreement = count as f64 / outputs.len() as f64;
    let needs_review = agreement < threshold;
    let resolved_answer = answer.to_string();
    ConsensusResult {
        task_id,
        outputs,
        agreement,
        confidence: confidence_score(agreement, threshold),
        resolved_answer,
        needs_review,
    }
}

/// Confidence derived from the agreement ratio: results at or above the
/// threshold land in [0.7, 1.0], results below it in [0.1, 0.7).
fn confidence_score(agreement: f64, threshold: f64) -> f64 {
    if agreement >= threshold {
        (0.7 + agreement * 0.3).min(1.0)
    } else {
        (agreement * 0.7).max(0.1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn output(answer: &str, confidence: f64) -> ModelOutput {
        ModelOutput {
            answer: answer.to_string(),
            confidence,
        }
    }

    #[test]
    fn test_majority_resolves() {
        let outputs = vec![
            (0, output("A", 0.9)),
            (1, output("A", 0.8)),
            (2, output("B", 0.95)),
        ];
        let result = reconcile(7, outputs, 2.0 / 3.0);
        assert!((result.agreement - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.resolved_answer, "A");
        assert!(!result.needs_review);
        assert_eq!(result.task_id, 7);
    }

    #[test]
    fn test_disagreement_sets_review_flag() {
        let outputs = vec![
            (0, output("A", 0.9)),
            (1, output("B", 0.8)),
            (2, output("C", 0.7)),
        ];
        let result = reconcile(1, outputs, 0.7);
        assert!(result.needs_review);
        assert!(result.agreement < 0.7);
        assert!(result.confidence < 0.7);
    }

    #[test]
    fn test_tie_breaks_on_summed_confidence() {
        let outputs = vec![
            (0, output("A", 0.4)),
            (1, output("B", 0.9)),
        ];
        let result = reconcile(1, outputs, 0.7);
        assert_eq!(result.resolved_answer, "B");
        assert!(result.needs_review);
    }

    #[test]
    fn test_whitespace_is_ignored_for_agreement() {
        let outputs = vec![(0, output(" A ", 0.9)), (1, output("A", 0.9))];
        let result = reconcile(1, outputs, 0.7);
        assert!((result.agreement - 1.0).abs() < f64::EPSILON);
        assert_eq!(result.resolved_answer, "A");
    }

    #[test]
    fn test_full_agreement_confidence() {
        let outputs = vec![(0, output("A", 0.9)), (1, output("A", 0.9))];
        let result = reconcile(1, outputs, 0.7);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }
}

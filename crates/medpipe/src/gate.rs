//! Confidence gate: is the local evidence good enough on its own?

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Local evidence suffices; skip web retrieval.
    Sufficient,
    /// Too little strong local evidence; trigger web retrieval.
    Insufficient,
}

/// Pure decision rule: sufficient iff at least `min_hits` scores are ≥ `tau`.
/// Deterministic given its inputs, no side effects.
pub fn decide(scores: &[f64], tau: f64, min_hits: usize) -> GateDecision {
    let strong = scores.iter().filter(|s| **s >= tau).count();
    if strong >= min_hits {
        GateDecision::Sufficient
    } else {
        GateDecision::Insufficient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAU: f64 = 0.6;
    const K: usize = 2;

    #[test]
    fn strong_local_results_are_sufficient() {
        // Spec scenario: [0.8, 0.75, 0.3] clears the gate.
        assert_eq!(decide(&[0.8, 0.75, 0.3], TAU, K), GateDecision::Sufficient);
    }

    #[test]
    fn one_weak_result_is_insufficient() {
        // Spec scenario: a single 0.4 hit must trigger web retrieval.
        assert_eq!(decide(&[0.4], TAU, K), GateDecision::Insufficient);
    }

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(decide(&[0.6, 0.6], TAU, K), GateDecision::Sufficient);
        assert_eq!(
            decide(&[0.5999, 0.6], TAU, K),
            GateDecision::Insufficient
        );
    }

    #[test]
    fn exactly_k_minus_one_strong_hits_is_insufficient() {
        assert_eq!(
            decide(&[0.9, 0.59, 0.1], TAU, K),
            GateDecision::Insufficient
        );
    }

    #[test]
    fn empty_scores_are_insufficient_unless_k_is_zero() {
        assert_eq!(decide(&[], TAU, K), GateDecision::Insufficient);
        assert_eq!(decide(&[], TAU, 0), GateDecision::Sufficient);
    }

    #[test]
    fn decision_depends_only_on_count_above_tau() {
        // Ordering and magnitudes below tau are irrelevant.
        assert_eq!(
            decide(&[0.0, 0.61, 0.0, 0.62], TAU, K),
            GateDecision::Sufficient
        );
        assert_eq!(
            decide(&[0.59, 0.59, 0.59, 0.59], TAU, K),
            GateDecision::Insufficient
        );
    }
}

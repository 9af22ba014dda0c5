//! Adaptive choice between the generative mutation strategies.
//!
//! Each strategy keeps a single running estimate of how useful its proposals
//! are. Selection samples from a softmax over those estimates; the selector
//! owns its own random source so that choosing a strategy never moves the
//! mutation [`Generator`](crate::generator::Generator).

use libafl_bolts::Named;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::constants::INITIAL_ESTIMATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStrategy {
    MutateArguments,
    SemanticEquivalent,
    CallChain,
    Simplify,
}

impl MutationStrategy {
    pub const ALL: [MutationStrategy; 4] = [
        MutationStrategy::MutateArguments,
        MutationStrategy::SemanticEquivalent,
        MutationStrategy::CallChain,
        MutationStrategy::Simplify,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Instruction handed to the assistant along with the seed source.
    pub fn prompt(self) -> &'static str {
        match self {
            MutationStrategy::MutateArguments => {
                "Please create a program that mutates the input parameters of the target function call"
            }
            MutationStrategy::SemanticEquivalent => {
                "Please create a semantically equivalent program to the previous generation"
            }
            MutationStrategy::CallChain => {
                "Please create a program that calls other functions from the target library \
                 to form a chain of function calls"
            }
            MutationStrategy::Simplify => {
                "Please create a simplified version of the previous generation"
            }
        }
    }
}

impl Named for MutationStrategy {
    fn name(&self) -> &Cow<'static, str> {
        match self {
            MutationStrategy::MutateArguments => &Cow::Borrowed("MutateArguments"),
            MutationStrategy::SemanticEquivalent => &Cow::Borrowed("SemanticEquivalent"),
            MutationStrategy::CallChain => &Cow::Borrowed("CallChain"),
            MutationStrategy::Simplify => &Cow::Borrowed("Simplify"),
        }
    }
}

/// Reward for one proposal: half for being syntactically valid, half for the
/// normalised coverage it added, clamped to `[0, 1]`.
pub fn reward(has_syntax_error: bool, coverage_gain: f64) -> f64 {
    let valid = if has_syntax_error { 0.0 } else { 1.0 };
    (0.5 * valid + 0.5 * coverage_gain).clamp(0.0, 1.0)
}

pub struct AdaptiveSelector {
    estimates: [f64; 4],
    alpha: f64,
    tau: f64,
    rng: StdRng,
}

impl AdaptiveSelector {
    /// # Arguments
    ///
    /// * `alpha` - Learning rate of the exponential moving average.
    /// * `tau` - Softmax temperature. Small values make selection nearly greedy.
    /// * `seed` - Seed for the selector's own random source.
    pub fn new(alpha: f64, tau: f64, seed: u64) -> Self {
        Self {
            estimates: [INITIAL_ESTIMATE; 4],
            alpha,
            tau,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn estimate(&self, strategy: MutationStrategy) -> f64 {
        self.estimates[strategy.index()]
    }

    pub fn estimates(&self) -> &[f64; 4] {
        &self.estimates
    }

    /// Selection probabilities, computed on estimates shifted by their maximum.
    pub fn probabilities(&self) -> [f64; 4] {
        let tau = self.tau.max(f64::MIN_POSITIVE);
        let max = self
            .estimates
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let weights = self.estimates.map(|e| ((e - max) / tau).exp());
        let total: f64 = weights.iter().sum();
        weights.map(|w| w / total)
    }

    pub fn select(&mut self) -> MutationStrategy {
        let probabilities = self.probabilities();
        let mut point = self.rng.random::<f64>();
        for (strategy, p) in MutationStrategy::ALL.iter().zip(probabilities) {
            if point < p {
                return *strategy;
            }
            point -= p;
        }
        MutationStrategy::ALL[probabilities.len() - 1]
    }

    pub fn update(&mut self, strategy: MutationStrategy, reward: f64) {
        let e = &mut self.estimates[strategy.index()];
        *e = self.alpha * reward + (1.0 - self.alpha) * *e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_is_clamped() {
        assert_eq!(reward(false, 0.0), 0.5);
        assert_eq!(reward(true, 0.0), 0.0);
        assert_eq!(reward(false, 1.0), 1.0);
        assert_eq!(reward(false, 7.0), 1.0);
        assert_eq!(reward(true, -3.0), 0.0);
    }

    #[test]
    fn estimate_converges_to_constant_reward() {
        let mut selector = AdaptiveSelector::new(0.2, 1.0, 1);
        for _ in 0..200 {
            selector.update(MutationStrategy::CallChain, 0.9);
        }
        assert!((selector.estimate(MutationStrategy::CallChain) - 0.9).abs() < 1e-6);
        assert_eq!(selector.estimate(MutationStrategy::Simplify), INITIAL_ESTIMATE);
    }

    #[test]
    fn full_reward_drives_the_estimate_to_one() {
        let mut selector = AdaptiveSelector::new(0.1, 1.0, 1);
        for _ in 0..500 {
            selector.update(MutationStrategy::MutateArguments, 1.0);
        }
        assert!((selector.estimate(MutationStrategy::MutateArguments) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_reward_drives_the_estimate_to_zero() {
        let mut selector = AdaptiveSelector::new(0.1, 1.0, 1);
        for _ in 0..500 {
            selector.update(MutationStrategy::Simplify, 0.0);
        }
        assert!(selector.estimate(MutationStrategy::Simplify).abs() < 1e-9);
    }

    #[test]
    fn low_temperature_picks_the_best_strategy() {
        let mut selector = AdaptiveSelector::new(1.0, 0.001, 7);
        selector.update(MutationStrategy::SemanticEquivalent, 1.0);
        for _ in 0..100 {
            assert_eq!(selector.select(), MutationStrategy::SemanticEquivalent);
        }
    }

    #[test]
    fn equal_estimates_select_everything() {
        let mut selector = AdaptiveSelector::new(0.1, 1.0, 3);
        let mut seen = [0usize; 4];
        for _ in 0..400 {
            seen[selector.select().index()] += 1;
        }
        assert!(seen.iter().all(|&n| n > 50));
    }

    #[test]
    fn probabilities_sum_to_one() {
        let mut selector = AdaptiveSelector::new(0.5, 0.3, 3);
        selector.update(MutationStrategy::MutateArguments, 1.0);
        let total: f64 = selector.probabilities().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn strategies_are_named() {
        assert_eq!(MutationStrategy::CallChain.name(), "CallChain");
    }
}

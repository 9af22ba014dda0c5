//! Collaborators outside the mutation engine: a generative assistant that
//! rewrites seeds, and a coverage probe that scores the rewrites.

use slog::{Logger, debug, info};

use crate::invocation::Invocation;
use crate::replay::ReplayStore;
use crate::selector::{AdaptiveSelector, MutationStrategy, reward};
use crate::session::{SeedReport, SeedSession};
use crate::util::discard_logger;
use crate::worker::WorkerLauncher;

/// A rewritten seed. `invocation` is the call parsed out of `source`, or
/// `None` when the source did not parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub source: String,
    pub invocation: Option<Invocation>,
}

impl Proposal {
    /// Parses and still calls the seed's target.
    pub fn is_valid_for(&self, seed: &Invocation) -> bool {
        matches!(&self.invocation, Some(call) if call.target == seed.target)
    }
}

pub trait Assistant {
    fn propose(&mut self, seed: &Invocation, strategy: MutationStrategy)
    -> anyhow::Result<Proposal>;
}

pub trait CoverageProbe {
    fn covered_units(&self) -> u64;
    fn total_units(&self) -> u64;
}

impl<A: Assistant + ?Sized> Assistant for Box<A> {
    fn propose(
        &mut self,
        seed: &Invocation,
        strategy: MutationStrategy,
    ) -> anyhow::Result<Proposal> {
        (**self).propose(seed, strategy)
    }
}

impl<P: CoverageProbe + ?Sized> CoverageProbe for Box<P> {
    fn covered_units(&self) -> u64 {
        (**self).covered_units()
    }

    fn total_units(&self) -> u64 {
        (**self).total_units()
    }
}

/// Probe for runs without coverage instrumentation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProbe;

impl CoverageProbe for NullProbe {
    fn covered_units(&self) -> u64 {
        0
    }

    fn total_units(&self) -> u64 {
        0
    }
}

/// Newly covered units as a fraction of all units, in `[0, 1]`.
pub fn coverage_gain(before: u64, after: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (after.saturating_sub(before) as f64 / total as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone)]
pub struct RoundReport {
    pub strategy: MutationStrategy,
    pub proposals: usize,
    pub accepted: Option<Invocation>,
    pub reward: f64,
    pub seed_report: Option<SeedReport>,
}

pub struct AdaptiveLoop<A: Assistant, P: CoverageProbe> {
    assistant: A,
    probe: P,
    selector: AdaptiveSelector,
    max_proposal_retries: usize,
    logger: Logger,
}

impl<A: Assistant, P: CoverageProbe> AdaptiveLoop<A, P> {
    pub fn new(
        assistant: A,
        probe: P,
        selector: AdaptiveSelector,
        max_proposal_retries: usize,
    ) -> Self {
        Self {
            assistant,
            probe,
            selector,
            max_proposal_retries: max_proposal_retries.max(1),
            logger: discard_logger(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn selector(&self) -> &AdaptiveSelector {
        &self.selector
    }

    /// One select, propose, fuzz, update step.
    ///
    /// Invalid proposals are retried with the same strategy without touching its
    /// estimate. When every retry fails the strategy is scored as a syntax error.
    pub fn round<L, S>(
        &mut self,
        seed: &Invocation,
        session: &mut SeedSession<'_, L, S>,
    ) -> anyhow::Result<RoundReport>
    where
        L: WorkerLauncher,
        S: ReplayStore,
    {
        let strategy = self.selector.select();
        for proposals in 1..=self.max_proposal_retries {
            let proposal = self.assistant.propose(seed, strategy)?;
            if !proposal.is_valid_for(seed) {
                debug!(self.logger, "proposal rejected";
                    "strategy" => ?strategy, "try" => proposals);
                continue;
            }
            let Some(candidate) = proposal.invocation else {
                continue;
            };

            let before = self.probe.covered_units();
            let seed_report = session.fuzz(&candidate)?;
            let gain = coverage_gain(
                before,
                self.probe.covered_units(),
                self.probe.total_units(),
            );
            let reward = reward(false, gain);
            self.selector.update(strategy, reward);
            info!(self.logger, "proposal fuzzed";
                "strategy" => ?strategy, "gain" => gain, "reward" => reward,
                "source" => &proposal.source);
            return Ok(RoundReport {
                strategy,
                proposals,
                accepted: Some(candidate),
                reward,
                seed_report: Some(seed_report),
            });
        }

        let reward = reward(true, 0.0);
        self.selector.update(strategy, reward);
        Ok(RoundReport {
            strategy,
            proposals: self.max_proposal_retries,
            accepted: None,
            reward,
            seed_report: None,
        })
    }

    pub fn run<L, S>(
        &mut self,
        seed: &Invocation,
        session: &mut SeedSession<'_, L, S>,
        rounds: usize,
    ) -> anyhow::Result<Vec<RoundReport>>
    where
        L: WorkerLauncher,
        S: ReplayStore,
    {
        (0..rounds).map(|_| self.round(seed, session)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::INITIAL_ESTIMATE;
    use crate::generator::Generator;
    use crate::replay::MemoryReplayStore;
    use crate::session::SessionSettings;
    use crate::supervisor::tests::ScriptedLauncher;
    use crate::supervisor::{Supervisor, SupervisorSettings};
    use crate::util::WorkerExit;
    use crate::value::Value;
    use std::cell::Cell;
    use std::time::Duration;

    struct Scripted {
        invalid_first: usize,
        calls: usize,
    }

    impl Assistant for Scripted {
        fn propose(
            &mut self,
            seed: &Invocation,
            _strategy: MutationStrategy,
        ) -> anyhow::Result<Proposal> {
            self.calls += 1;
            let invocation = if self.calls > self.invalid_first {
                Some(Invocation::positional(&seed.target, vec![Value::Int(9), Value::Int(8)]))
            } else {
                None
            };
            Ok(Proposal {
                source: format!("{}(9, 8)", seed.target),
                invocation,
            })
        }
    }

    /// Reports two more covered units every time it is read.
    struct Growing(Cell<u64>);

    impl CoverageProbe for Growing {
        fn covered_units(&self) -> u64 {
            self.0.set(self.0.get() + 2);
            self.0.get()
        }

        fn total_units(&self) -> u64 {
            10
        }
    }

    fn session_parts() -> (Supervisor<ScriptedLauncher>, MemoryReplayStore, Generator) {
        let supervisor = Supervisor::new(
            ScriptedLauncher::exiting(WorkerExit::Code(0)),
            SupervisorSettings {
                poll_interval: Duration::from_millis(1),
                ..SupervisorSettings::default()
            },
        );
        (supervisor, MemoryReplayStore::default(), Generator::new(1))
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            mutants_per_seed: 3,
            max_attempts: 3,
            execution_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn gain_is_normalised() {
        assert_eq!(coverage_gain(10, 15, 100), 0.05);
        assert_eq!(coverage_gain(15, 10, 100), 0.0);
        assert_eq!(coverage_gain(0, 5, 0), 0.0);
    }

    #[test]
    fn invalid_proposals_are_retried_without_update() {
        let (mut supervisor, mut store, mut generator) = session_parts();
        let mut session = SeedSession::new(&mut supervisor, &mut store, &mut generator, settings());
        let seed = Invocation::positional("m.f", vec![Value::Int(1), Value::Int(2)]);
        let mut adaptive = AdaptiveLoop::new(
            Scripted { invalid_first: 2, calls: 0 },
            Growing(Cell::new(0)),
            AdaptiveSelector::new(0.5, 1.0, 1),
            5,
        );
        let report = adaptive.round(&seed, &mut session).unwrap();
        assert_eq!(report.proposals, 3);
        assert_eq!(report.seed_report.unwrap().outcomes.len(), 3);
        // gain 0.2 -> reward 0.6 -> estimate 0.55
        let estimate = adaptive.selector().estimate(report.strategy);
        assert!((estimate - 0.55).abs() < 1e-9);
    }

    #[test]
    fn exhausted_retries_count_as_a_syntax_error() {
        let (mut supervisor, mut store, mut generator) = session_parts();
        let mut session = SeedSession::new(&mut supervisor, &mut store, &mut generator, settings());
        let seed = Invocation::positional("m.f", vec![Value::Int(1)]);
        let mut adaptive = AdaptiveLoop::new(
            Scripted { invalid_first: usize::MAX, calls: 0 },
            NullProbe,
            AdaptiveSelector::new(0.5, 1.0, 1),
            4,
        );
        let report = adaptive.round(&seed, &mut session).unwrap();
        assert!(report.accepted.is_none());
        assert_eq!(report.reward, 0.0);
        assert_eq!(
            adaptive.selector().estimate(report.strategy),
            INITIAL_ESTIMATE / 2.0
        );
    }

    #[test]
    fn proposals_for_other_targets_are_invalid() {
        let seed = Invocation::positional("m.f", vec![]);
        let proposal = Proposal {
            source: "m.g()".into(),
            invocation: Some(Invocation::positional("m.g", vec![])),
        };
        assert!(!proposal.is_valid_for(&seed));
    }
}

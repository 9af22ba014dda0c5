use slog::{Logger, debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::custom::param_mutator::mutate_invocation;
use crate::generator::Generator;
use crate::invocation::Invocation;
use crate::replay::{ReplayError, ReplayRecord, ReplayStore};
use crate::supervisor::{ExecutionOutcome, RetryBudget, Supervisor};
use crate::util::discard_logger;
use crate::worker::WorkerLauncher;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub mutants_per_seed: usize,
    pub max_attempts: u32,
    pub execution_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mutants_per_seed: 1000,
            max_attempts: 3,
            execution_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeedReport {
    pub target: String,
    pub outcomes: Vec<ExecutionOutcome>,
    /// The retry budget ran out before all mutants were tried.
    pub abandoned: bool,
    pub cancelled: bool,
    /// Records the replay store refused. Their executions still count.
    pub store_errors: usize,
}

impl SeedReport {
    pub fn failures(&self) -> impl Iterator<Item = &ExecutionOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

/// The mutate-and-execute loop for one seed.
///
/// Every mutant is derived from the seed's original parameters. The generator
/// state is captured before each mutation and recorded, together with the
/// outcome, under the supervisor's ordinal for that execution.
pub struct SeedSession<'a, L: WorkerLauncher, S: ReplayStore> {
    supervisor: &'a mut Supervisor<L>,
    store: &'a mut S,
    generator: &'a mut Generator,
    settings: SessionSettings,
    cancel: Option<Arc<AtomicBool>>,
    logger: Logger,
}

impl<'a, L: WorkerLauncher, S: ReplayStore> SeedSession<'a, L, S> {
    pub fn new(
        supervisor: &'a mut Supervisor<L>,
        store: &'a mut S,
        generator: &'a mut Generator,
        settings: SessionSettings,
    ) -> Self {
        Self {
            supervisor,
            store,
            generator,
            settings,
            cancel: None,
            logger: discard_logger(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Runs the seed's mutants until they are exhausted, the retry budget is
    /// spent, or the run is cancelled. A seed without arguments runs once,
    /// unmutated.
    ///
    /// Store failures are logged and counted in the report; the loop carries on.
    pub fn fuzz(&mut self, seed: &Invocation) -> Result<SeedReport, ReplayError> {
        let fingerprint = seed.fingerprint()?;
        let no_args = seed.arity() == 0;
        let total = if no_args {
            1
        } else {
            self.settings.mutants_per_seed
        };
        let max_attempts = if no_args { 1 } else { self.settings.max_attempts };
        let mut budget = RetryBudget::new(max_attempts, self.settings.execution_timeout);
        let mut report = SeedReport {
            target: seed.target.clone(),
            ..SeedReport::default()
        };

        info!(self.logger, "fuzzing seed"; "target" => &seed.target, "mutants" => total);
        if let Err(e) = self.store.remember_base(seed, fingerprint) {
            error!(self.logger, "failed to store seed for replay"; "target" => &seed.target, "error" => %e);
            report.store_errors += 1;
        }
        for done in 0..total {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            if budget.is_exhausted() {
                warn!(self.logger, "retry budget spent, abandoning seed";
                    "target" => &seed.target, "executed" => done);
                report.abandoned = true;
                break;
            }

            let snapshot = self.generator.state();
            let candidate = mutate_invocation(self.generator, seed)?;
            let timeout = budget.next_timeout(total - done);
            let outcome = self
                .supervisor
                .run_one(&candidate, timeout, snapshot, budget.used());
            if let Err(e) = self
                .store
                .record(ReplayRecord::from_outcome(seed, fingerprint, &outcome))
            {
                error!(self.logger, "failed to record execution";
                    "ordinal" => outcome.ordinal, "state" => snapshot, "error" => %e);
                report.store_errors += 1;
            }

            if !outcome.is_ok() {
                debug!(self.logger, "execution failed";
                    "ordinal" => outcome.ordinal,
                    "state" => snapshot,
                    "outcome" => ?outcome.kind);
                budget.consume();
            }
            report.outcomes.push(outcome);
        }
        info!(self.logger, "seed finished";
            "target" => &seed.target,
            "executed" => report.outcomes.len(),
            "failures" => report.failures().count(),
            "store_errors" => report.store_errors);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::MemoryReplayStore;
    use crate::supervisor::tests::ScriptedLauncher;
    use crate::supervisor::{OutcomeKind, SupervisorSettings};
    use crate::util::WorkerExit;
    use crate::value::Value;

    fn supervisor(exit: WorkerExit) -> Supervisor<ScriptedLauncher> {
        Supervisor::new(
            ScriptedLauncher::exiting(exit),
            SupervisorSettings {
                poll_interval: Duration::from_millis(1),
                ..SupervisorSettings::default()
            },
        )
    }

    fn settings(mutants: usize) -> SessionSettings {
        SessionSettings {
            mutants_per_seed: mutants,
            max_attempts: 3,
            execution_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn every_mutant_is_recorded() {
        let seed = Invocation::positional("m.f", vec![Value::Int(1), Value::Int(2)]);
        let mut supervisor = supervisor(WorkerExit::Code(0));
        let mut store = MemoryReplayStore::default();
        let mut generator = Generator::new(3);
        let report = SeedSession::new(&mut supervisor, &mut store, &mut generator, settings(25))
            .fuzz(&seed)
            .unwrap();
        assert_eq!(report.outcomes.len(), 25);
        assert!(!report.abandoned);
        let ordinals: Vec<u64> = store.records().iter().map(|r| r.ordinal).collect();
        assert_eq!(ordinals, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn crashing_seed_is_abandoned_after_the_budget() {
        let seed = Invocation::positional("m.f", vec![Value::Int(1), Value::Int(2)]);
        let mut supervisor = supervisor(WorkerExit::Signal(11));
        let mut store = MemoryReplayStore::default();
        let mut generator = Generator::new(3);
        let report = SeedSession::new(&mut supervisor, &mut store, &mut generator, settings(25))
            .fuzz(&seed)
            .unwrap();
        assert!(report.abandoned);
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes.iter().all(|o| o.kind == OutcomeKind::Abnormal(-11)));
        let attempts: Vec<u32> = report.outcomes.iter().map(|o| o.attempt).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
    }

    #[test]
    fn zero_argument_seed_runs_once() {
        let seed = Invocation::positional("m.noargs", vec![]);
        let mut supervisor = supervisor(WorkerExit::Code(0));
        let mut store = MemoryReplayStore::default();
        let mut generator = Generator::new(3);
        let report = SeedSession::new(&mut supervisor, &mut store, &mut generator, settings(25))
            .fuzz(&seed)
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(generator.state(), 3);
    }

    #[test]
    fn cancellation_stops_before_the_next_mutant() {
        let seed = Invocation::positional("m.f", vec![Value::Int(1), Value::Int(2)]);
        let mut supervisor = supervisor(WorkerExit::Code(0));
        let mut store = MemoryReplayStore::default();
        let mut generator = Generator::new(3);
        let cancel = Arc::new(AtomicBool::new(true));
        let report = SeedSession::new(&mut supervisor, &mut store, &mut generator, settings(25))
            .with_cancel_flag(cancel)
            .fuzz(&seed)
            .unwrap();
        assert!(report.cancelled);
        assert!(report.outcomes.is_empty());
    }

    /// A store whose disk is full.
    struct FullStore;

    impl ReplayStore for FullStore {
        fn record(&mut self, _record: ReplayRecord) -> Result<(), ReplayError> {
            Err(ReplayError::Io(std::io::Error::other("no space left on device")))
        }

        fn remember_base(&mut self, _base: &Invocation, _fingerprint: u64) -> Result<(), ReplayError> {
            Err(ReplayError::Io(std::io::Error::other("no space left on device")))
        }
    }

    #[test]
    fn store_failures_do_not_stop_the_seed() {
        let seed = Invocation::positional("m.f", vec![Value::Int(1), Value::Int(2)]);
        let mut supervisor = supervisor(WorkerExit::Code(0));
        let mut generator = Generator::new(3);
        let report = SeedSession::new(&mut supervisor, &mut FullStore, &mut generator, settings(10))
            .fuzz(&seed)
            .unwrap();
        assert_eq!(report.outcomes.len(), 10);
        assert_eq!(report.store_errors, 11);
    }

    #[test]
    fn records_name_the_call_they_came_from() {
        let seed = Invocation::positional("m.f", vec![Value::Int(1), Value::Int(2)]);
        let mut supervisor = supervisor(WorkerExit::Code(0));
        let mut store = MemoryReplayStore::default();
        let mut generator = Generator::new(3);
        SeedSession::new(&mut supervisor, &mut store, &mut generator, settings(5))
            .fuzz(&seed)
            .unwrap();
        let fingerprint = seed.fingerprint().unwrap();
        assert!(store.records().iter().all(|r| r.base_fingerprint == fingerprint));
        assert_eq!(store.base(fingerprint).unwrap(), &seed);
    }
}

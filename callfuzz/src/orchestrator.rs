use anyhow::Context;
use libafl_bolts::current_nanos;
use slog::{Logger, info, warn};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::assistant::{AdaptiveLoop, Assistant, CoverageProbe, NullProbe};
use crate::fuzzer::FuzzerState;
use crate::generator::Generator;
use crate::invocation::{Invocation, InterceptionGate};
use crate::replay::{JsonLinesReplayLog, ReplayError, ReplayReport, ReplayStore, replay};
use crate::selector::AdaptiveSelector;
use crate::session::{SeedReport, SeedSession};
use crate::supervisor::{ExecutionOutcome, Supervisor};
use crate::worker::ProcessLauncher;

/// The campaign-specific parts of a fuzzer. Everything else (mutation,
/// supervision, recording) is driven by [`run`] and [`run_parallel`].
pub trait FuzzerOrchestrator: AsRef<FuzzerState> + AsMut<FuzzerState> {
    /// Called once before any seed is fuzzed.
    fn init(&mut self) {}

    /// The seeds of this campaign. Defaults to the ones registered on the state.
    fn seeds(&self) -> Vec<Invocation> {
        self.as_ref().seeds().to_vec()
    }

    /// Called for every execution that did not end normally.
    fn on_failure(&self, seed: &Invocation, outcome: &ExecutionOutcome) {
        warn!(self.as_ref().logger(), "execution failed";
            "target" => &seed.target,
            "ordinal" => outcome.ordinal,
            "state" => outcome.generator_state,
            "outcome" => ?outcome.kind);
    }

    /// Generative assistant for the adaptive rounds. Without one, seeds are
    /// only fuzzed by argument mutation.
    fn assistant(&self) -> Option<Box<dyn Assistant>> {
        None
    }

    fn coverage_probe(&self) -> Box<dyn CoverageProbe> {
        Box::new(NullProbe)
    }

    fn cleanup(&self) {}
}

#[derive(Debug, Default)]
pub struct CampaignReport {
    pub seeds: Vec<SeedReport>,
    /// Targets skipped as blacklisted or already fuzzed.
    pub skipped: Vec<String>,
    pub cancelled: bool,
}

impl CampaignReport {
    pub fn executions(&self) -> usize {
        self.seeds.iter().map(|s| s.outcomes.len()).sum()
    }

    pub fn failures(&self) -> usize {
        self.seeds.iter().map(|s| s.failures().count()).sum()
    }

    pub fn store_errors(&self) -> usize {
        self.seeds.iter().map(|s| s.store_errors).sum()
    }
}

/// Seeds that pass the blacklist, each target at most once.
fn admitted_seeds<T: FuzzerOrchestrator>(
    orchestrator: &T,
    report: &mut CampaignReport,
) -> anyhow::Result<Vec<Invocation>> {
    let state = orchestrator.as_ref();
    let mut gate = InterceptionGate::new(state.config().blacklist()?);
    let mut seeds = Vec::new();
    for seed in orchestrator.seeds() {
        if gate.admit(&seed) {
            seeds.push(seed);
        } else {
            info!(state.logger(), "skipping seed"; "target" => &seed.target);
            report.skipped.push(seed.target);
        }
    }
    Ok(seeds)
}

fn initial_generator(state: &FuzzerState, offset: u64) -> Generator {
    match state.config().master_seed {
        Some(seed) => Generator::new(seed.wrapping_add(offset)),
        None => Generator::from_wall_clock(),
    }
}

/// Seed of the strategy selector for the seed at `index`. Distinct per seed so
/// that seeds do not all walk the same strategy sequence.
fn selector_seed(master_seed: Option<u64>, index: u64) -> u64 {
    match master_seed {
        Some(seed) => seed.wrapping_add(index),
        None => current_nanos().wrapping_add(index),
    }
}

/// Fuzzes one seed: argument mutation first, then the adaptive assistant
/// rounds if the orchestrator provides an assistant.
fn fuzz_seed<T, S>(
    orchestrator: &T,
    supervisor: &mut Supervisor<ProcessLauncher>,
    store: &mut S,
    generator: &mut Generator,
    seed: &Invocation,
    index: u64,
) -> anyhow::Result<SeedReport>
where
    T: FuzzerOrchestrator,
    S: ReplayStore,
{
    let state = orchestrator.as_ref();
    let config = state.config();
    let logger: Logger = state.logger().new(slog::o!("target" => seed.target.clone()));

    let mut session = SeedSession::new(supervisor, store, generator, config.session_settings())
        .with_cancel_flag(state.cancel_flag())
        .with_logger(logger.clone());
    let mut report = session.fuzz(seed)?;
    for failure in report.failures() {
        orchestrator.on_failure(seed, failure);
    }

    if config.llm_fuzz_per_seed > 0 && !report.cancelled {
        if let Some(assistant) = orchestrator.assistant() {
            let selector = AdaptiveSelector::new(
                config.learning_rate,
                config.temperature,
                selector_seed(config.master_seed, index),
            );
            let mut adaptive = AdaptiveLoop::new(
                assistant,
                orchestrator.coverage_probe(),
                selector,
                config.max_proposal_retries,
            )
            .with_logger(logger);
            for round in adaptive.run(seed, &mut session, config.llm_fuzz_per_seed)? {
                if let Some(seed_report) = round.seed_report {
                    if let Some(candidate) = &round.accepted {
                        for failure in seed_report.failures() {
                            orchestrator.on_failure(candidate, failure);
                        }
                    }
                    report.store_errors += seed_report.store_errors;
                    report.outcomes.extend(seed_report.outcomes);
                }
            }
        }
    }
    Ok(report)
}

/// Runs the campaign on the calling thread, one seed after another.
pub fn run<T: FuzzerOrchestrator>(mut orchestrator: T) -> anyhow::Result<CampaignReport> {
    orchestrator.init();

    let mut report = CampaignReport::default();
    let seeds = admitted_seeds(&orchestrator, &mut report)?;
    let state = orchestrator.as_ref();
    let mut store = JsonLinesReplayLog::open(state.replay_log_path())
        .context("failed to open the replay log")?;
    let mut supervisor = Supervisor::new(state.launcher()?, state.config().supervisor_settings())
        .with_capture_output(state.config().capture_output)
        .with_logger(state.logger().clone());
    let mut generator = initial_generator(state, 0);

    info!(state.logger(), "campaign started";
        "name" => state.name(), "seeds" => seeds.len(), "initial_state" => generator.state());
    for (index, seed) in seeds.iter().enumerate() {
        let seed_report = fuzz_seed(
            &orchestrator,
            &mut supervisor,
            &mut store,
            &mut generator,
            seed,
            index as u64,
        )?;
        let cancelled = seed_report.cancelled;
        report.seeds.push(seed_report);
        if cancelled {
            report.cancelled = true;
            break;
        }
    }
    info!(state.logger(), "campaign finished";
        "executions" => report.executions(),
        "failures" => report.failures(),
        "store_errors" => report.store_errors());

    orchestrator.cleanup();
    Ok(report)
}

/// Runs the campaign with up to `threads` seeds in flight. Each seed gets its
/// own generator and supervisor; the replay log is shared.
pub fn run_parallel<T>(mut orchestrator: T, threads: usize) -> anyhow::Result<CampaignReport>
where
    T: FuzzerOrchestrator + Sync,
{
    orchestrator.init();

    let mut report = CampaignReport::default();
    let seeds = admitted_seeds(&orchestrator, &mut report)?;
    let state = orchestrator.as_ref();
    let store = Mutex::new(
        JsonLinesReplayLog::open(state.replay_log_path())
            .context("failed to open the replay log")?,
    );
    let launcher = state.launcher()?;
    let next = AtomicUsize::new(0);

    let results: Vec<anyhow::Result<Vec<(usize, SeedReport)>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads.max(1))
            .map(|_| {
                scope.spawn(|| -> anyhow::Result<Vec<(usize, SeedReport)>> {
                    let mut done = Vec::new();
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(seed) = seeds.get(index) else {
                            break;
                        };
                        let mut supervisor =
                            Supervisor::new(launcher.clone(), state.config().supervisor_settings())
                                .with_capture_output(state.config().capture_output)
                                .with_logger(state.logger().clone());
                        let mut generator = initial_generator(state, index as u64);
                        let mut shared = &store;
                        let seed_report =
                            fuzz_seed(
                                &orchestrator,
                                &mut supervisor,
                                &mut shared,
                                &mut generator,
                                seed,
                                index as u64,
                            )?;
                        let cancelled = seed_report.cancelled;
                        done.push((index, seed_report));
                        if cancelled {
                            break;
                        }
                    }
                    Ok(done)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("fuzzing thread panicked")))
            })
            .collect()
    });

    let mut finished = Vec::new();
    for result in results {
        finished.extend(result?);
    }
    finished.sort_by_key(|(index, _)| *index);
    report.cancelled = finished.iter().any(|(_, r)| r.cancelled);
    report.seeds = finished.into_iter().map(|(_, r)| r).collect();

    orchestrator.cleanup();
    Ok(report)
}

/// Re-executes the mutant recorded under `ordinal` for `seed`'s target and dumps
/// the reconstructed call next to the replay log.
///
/// Mutants of `seed` are rebuilt from it directly. Mutants of other calls to the
/// same target, such as accepted assistant proposals, are rebuilt from the copy
/// the replay log stored of them.
pub fn replay_one<T: FuzzerOrchestrator>(
    mut orchestrator: T,
    seed: &Invocation,
    ordinal: u64,
) -> anyhow::Result<ReplayReport> {
    orchestrator.init();
    let state = orchestrator.as_ref();
    let records = JsonLinesReplayLog::load(state.replay_log_path())
        .context("failed to read the replay log")?;
    let record = records
        .iter()
        .find(|r| r.target == seed.target && r.ordinal == ordinal)
        .ok_or(ReplayError::UnknownOrdinal(ordinal))?;
    let base = if record.base_fingerprint == seed.fingerprint()? {
        seed.clone()
    } else {
        JsonLinesReplayLog::load_base(state.replay_log_path(), record.base_fingerprint)?
    };

    let mut supervisor = Supervisor::new(state.launcher()?, state.config().supervisor_settings())
        .with_capture_output(state.config().capture_output)
        .with_logger(state.logger().clone());
    let result = replay(
        &mut supervisor,
        &base,
        record,
        state.config().execution_timeout(),
        Some(state.artifacts_dir().as_path()),
    )?;
    println!("Replay result: {:?}", result.outcome.kind);
    orchestrator.cleanup();
    Ok(result)
}

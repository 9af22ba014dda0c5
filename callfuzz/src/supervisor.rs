//! Runs single mutated calls in isolated workers and turns whatever happens to
//! them into an [`ExecutionOutcome`].

use serde::{Deserialize, Serialize};
use slog::{Logger, debug, warn};
use std::time::{Duration, Instant};

use crate::constants::PER_MUTATION_ALLOWANCE_MS;
use crate::invocation::Invocation;
use crate::util::{classify_exit, discard_logger};
use crate::worker::{CancellableWorker, CapturedOutput, WorkerLauncher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    /// Non-zero exit code, or the negated number of the terminating signal.
    Abnormal(i32),
    Timeout,
    SpawnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    WallClock,
    CpuCeiling,
    MemoryCeiling,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub kind: OutcomeKind,
    /// Generator state captured right before the invocation was mutated.
    pub generator_state: u64,
    pub ordinal: u64,
    pub attempt: u32,
    pub elapsed: Duration,
    pub kill_reason: Option<KillReason>,
    pub output: Option<CapturedOutput>,
}

impl ExecutionOutcome {
    pub fn is_ok(&self) -> bool {
        self.kind == OutcomeKind::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Spawning,
    Running,
    Completed,
    TimedOut,
    Killed,
}

/// Polling and runaway limits of a [`Supervisor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    /// Time between the termination request and the unconditional kill.
    pub grace_period: Duration,
    pub cpu_ceiling_percent: Option<f64>,
    pub memory_ceiling_bytes: Option<u64>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            grace_period: Duration::from_millis(200),
            cpu_ceiling_percent: Some(150.0),
            memory_ceiling_bytes: None,
        }
    }
}

/// Per-seed allowance of failed executions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBudget {
    max_attempts: u32,
    used: u32,
    execution_timeout: Duration,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, execution_timeout: Duration) -> Self {
        Self {
            max_attempts,
            used: 0,
            execution_timeout,
        }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max_attempts
    }

    pub fn consume(&mut self) {
        self.used = self.used.saturating_add(1);
    }

    /// Timeout for the next execution: the unused attempts' worth of execution
    /// time, plus a small allowance for every mutation still to run.
    pub fn next_timeout(&self, remaining_mutations: usize) -> Duration {
        let attempts_left = self.max_attempts.saturating_sub(self.used);
        self.execution_timeout * attempts_left
            + Duration::from_millis(PER_MUTATION_ALLOWANCE_MS) * remaining_mutations as u32
    }
}

pub struct Supervisor<L: WorkerLauncher> {
    launcher: L,
    settings: SupervisorSettings,
    state: SupervisorState,
    next_ordinal: u64,
    capture_output: bool,
    logger: Logger,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, settings: SupervisorSettings) -> Self {
        Self {
            launcher,
            settings,
            state: SupervisorState::Idle,
            next_ordinal: 0,
            capture_output: false,
            logger: discard_logger(),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Attach captured worker output to outcomes. The launcher must capture too.
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Ordinal the next execution will be reported under.
    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Executes `invocation` once in a fresh worker and waits for it, at most
    /// `timeout`.
    ///
    /// # Arguments
    ///
    /// * `generator_state` - The generator state the invocation was derived
    ///   from, recorded in the outcome for replay.
    /// * `attempt` - Failed attempts of the current seed so far.
    pub fn run_one(
        &mut self,
        invocation: &Invocation,
        timeout: Duration,
        generator_state: u64,
        attempt: u32,
    ) -> ExecutionOutcome {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let started = Instant::now();

        self.state = SupervisorState::Spawning;
        let (kind, kill_reason, output) = match self.launcher.start(invocation) {
            Ok(mut worker) => {
                self.state = SupervisorState::Running;
                let (kind, kill_reason) = self.watch(&mut worker, started, timeout);
                let output = if self.capture_output {
                    worker.take_output(self.settings.grace_period)
                } else {
                    None
                };
                (kind, kill_reason, output)
            }
            Err(e) => {
                warn!(self.logger, "worker failed to start";
                    "target" => &invocation.target, "error" => %e);
                (OutcomeKind::SpawnFailure, None, None)
            }
        };

        let outcome = ExecutionOutcome {
            kind,
            generator_state,
            ordinal,
            attempt,
            elapsed: started.elapsed(),
            kill_reason,
            output,
        };
        debug!(self.logger, "execution finished";
            "target" => &invocation.target,
            "ordinal" => ordinal,
            "state" => generator_state,
            "outcome" => ?outcome.kind,
            "elapsed_ms" => outcome.elapsed.as_millis() as u64);
        self.state = SupervisorState::Idle;
        outcome
    }

    fn watch(
        &mut self,
        worker: &mut L::Worker,
        started: Instant,
        timeout: Duration,
    ) -> (OutcomeKind, Option<KillReason>) {
        loop {
            match worker.poll_exit() {
                Ok(Some(exit)) => {
                    // The leader is reaped; anything it started goes with it.
                    if let Err(e) = worker.terminate(false) {
                        warn!(self.logger, "failed to kill worker group"; "pid" => worker.id(), "error" => %e);
                    }
                    self.state = SupervisorState::Completed;
                    return (classify_exit(exit), None);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(self.logger, "lost track of worker"; "pid" => worker.id(), "error" => %e);
                    self.kill(worker);
                    self.state = SupervisorState::Killed;
                    return (OutcomeKind::SpawnFailure, None);
                }
            }

            if let Some(reason) = self.runaway(worker) {
                warn!(self.logger, "worker exceeded resource ceiling";
                    "pid" => worker.id(), "reason" => ?reason);
                self.kill(worker);
                self.state = SupervisorState::Killed;
                return (OutcomeKind::Timeout, Some(reason));
            }

            if started.elapsed() >= timeout {
                self.stop(worker);
                self.state = SupervisorState::TimedOut;
                return (OutcomeKind::Timeout, Some(KillReason::WallClock));
            }

            std::thread::sleep(self.settings.poll_interval);
        }
    }

    fn runaway(&self, worker: &mut L::Worker) -> Option<KillReason> {
        let usage = worker.usage()?;
        if let Some(ceiling) = self.settings.cpu_ceiling_percent {
            if usage.cpu_percent > ceiling {
                return Some(KillReason::CpuCeiling);
            }
        }
        match self.settings.memory_ceiling_bytes {
            Some(ceiling) if usage.rss_bytes > ceiling => Some(KillReason::MemoryCeiling),
            _ => None,
        }
    }

    /// Termination request to the whole group, then a kill after the grace period.
    fn stop(&self, worker: &mut L::Worker) {
        if let Err(e) = worker.terminate(true) {
            warn!(self.logger, "failed to signal worker group"; "pid" => worker.id(), "error" => %e);
        }
        let deadline = Instant::now() + self.settings.grace_period;
        while Instant::now() < deadline {
            if !matches!(worker.poll_exit(), Ok(None)) {
                break;
            }
            std::thread::sleep(self.settings.poll_interval);
        }
        // Members of the group may outlive the leader.
        self.kill(worker);
    }

    fn kill(&self, worker: &mut L::Worker) {
        if let Err(e) = worker.terminate(false) {
            warn!(self.logger, "failed to kill worker group"; "pid" => worker.id(), "error" => %e);
        }
        if let Err(e) = worker.wait() {
            warn!(self.logger, "failed to reap worker"; "pid" => worker.id(), "error" => %e);
        }
    }
}

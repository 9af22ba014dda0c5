use slog::Logger;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::config::FuzzConfig;
use crate::invocation::Invocation;
use crate::util::discard_logger;
use crate::worker::ProcessLauncher;

/// Represents the global state for a fuzzing campaign.
///
/// Holds the campaign settings, the seed invocations, how workers are started,
/// and the run-level cancellation flag. The name is used to create the
/// directory that receives replay logs and artifacts.
pub struct FuzzerState {
    name: String,
    config: FuzzConfig,
    seeds: Vec<Invocation>,
    /// How each mutated call is executed. `None` re-executes the current binary
    /// in worker mode.
    launcher: Option<ProcessLauncher>,
    /// Set to stop the campaign between two executions.
    cancel: Arc<AtomicBool>,
    logger: Logger,
}

impl FuzzerState {
    /// Creates a new `FuzzerState`.
    ///
    /// # Arguments
    ///
    /// * `name` - A unique name for the fuzzer, used for artifact directories.
    /// * `config` - Campaign settings.
    /// * `seeds` - Invocations to fuzz, in order.
    pub fn new(name: &str, config: FuzzConfig, seeds: Vec<Invocation>) -> Self {
        Self {
            name: name.to_string(),
            config,
            seeds,
            launcher: None,
            cancel: Arc::new(AtomicBool::new(false)),
            logger: discard_logger(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &FuzzConfig {
        &self.config
    }

    pub fn seeds(&self) -> &[Invocation] {
        &self.seeds
    }

    pub fn add_seed(&mut self, seed: Invocation) {
        self.seeds.push(seed);
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// The launcher for workers.
    ///
    /// # Errors
    ///
    /// Fails if no launcher was configured and the path of the running binary
    /// cannot be determined.
    pub fn launcher(&self) -> std::io::Result<ProcessLauncher> {
        let launcher = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => ProcessLauncher::current_exe()?,
        };
        Ok(launcher.with_capture_output(self.config.capture_output))
    }

    /// `<artifacts_dir>/<name>`
    pub fn artifacts_dir(&self) -> PathBuf {
        self.config.artifacts_dir.join(&self.name)
    }

    pub fn replay_log_path(&self) -> PathBuf {
        self.artifacts_dir().join("replay.jsonl")
    }
}

/// Builder for [`FuzzerState`].
#[derive(Default)]
pub struct FuzzerBuilder {
    name: Option<String>,
    config: Option<FuzzConfig>,
    seeds: Vec<Invocation>,
    launcher: Option<ProcessLauncher>,
    cancel: Option<Arc<AtomicBool>>,
    logger: Option<Logger>,
}

impl FuzzerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_config(mut self, config: FuzzConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_seed(mut self, seed: Invocation) -> Self {
        self.seeds.push(seed);
        self
    }

    pub fn with_seeds<I: IntoIterator<Item = Invocation>>(mut self, seeds: I) -> Self {
        self.seeds.extend(seeds);
        self
    }

    /// Runs workers with an explicit command instead of the current binary.
    pub fn with_launcher(mut self, launcher: ProcessLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// # Panics
    ///
    /// Panics if no name was given.
    pub fn build(self) -> FuzzerState {
        let name = self.name.expect("Fuzzer name is required");
        let mut state = FuzzerState::new(&name, self.config.unwrap_or_default(), self.seeds);
        state.launcher = self.launcher;
        if let Some(cancel) = self.cancel {
            state.cancel = cancel;
        }
        if let Some(logger) = self.logger {
            state.logger = logger;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn builder_collects_seeds_and_paths() {
        let state = FuzzerBuilder::new()
            .name("demo")
            .with_config(FuzzConfig {
                artifacts_dir: PathBuf::from("/tmp/out"),
                ..FuzzConfig::default()
            })
            .with_seed(Invocation::positional("m.f", vec![Value::Int(1)]))
            .with_seeds(vec![Invocation::positional("m.g", vec![])])
            .build();
        assert_eq!(state.seeds().len(), 2);
        assert_eq!(state.replay_log_path(), PathBuf::from("/tmp/out/demo/replay.jsonl"));
    }

    #[test]
    #[should_panic(expected = "Fuzzer name is required")]
    fn builder_requires_a_name() {
        FuzzerBuilder::new().build();
    }
}

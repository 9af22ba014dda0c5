//! Worker-side entry point. A fuzzer binary is its own worker: started with
//! [`RUN_AS_WORKER_FLAG`] it reads one invocation from stdin, calls the
//! registered target and exits.

use std::collections::HashMap;
use std::io::Read;

use crate::constants::{
    RUN_AS_WORKER_FLAG, WORKER_PROTOCOL_ERROR_EXIT_CODE, WORKER_UNKNOWN_TARGET_EXIT_CODE,
};
use crate::invocation::Invocation;

pub type TargetFn = Box<dyn Fn(&Invocation) -> anyhow::Result<()> + Send + Sync>;

/// Maps target identifiers to the code that performs the call.
#[derive(Default)]
pub struct TargetRegistry {
    targets: HashMap<String, TargetFn>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `target`. An `Err` from it is an ordinary rejection of the
    /// arguments; only panics and signals count as faults.
    pub fn register<F>(mut self, name: &str, target: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.targets.insert(name.to_string(), Box::new(target));
        self
    }

    pub fn get(&self, name: &str) -> Option<&TargetFn> {
        self.targets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }
}

/// Dispatches between worker mode and the fuzzer's own `main`.
pub fn worker_main<F>(registry: &TargetRegistry, mut actual_main: F)
where
    F: FnMut(),
{
    if std::env::args().any(|arg| arg == RUN_AS_WORKER_FLAG) {
        let code = run_worker(registry, std::io::stdin().lock());
        std::process::exit(code);
    } else {
        actual_main();
    }
}

/// Decodes one invocation from `input`, runs it, and returns the exit code.
pub fn run_worker<R: Read>(registry: &TargetRegistry, input: R) -> i32 {
    let invocation: Invocation = match serde_cbor::from_reader(input) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("worker: undecodable invocation: {e}");
            return WORKER_PROTOCOL_ERROR_EXIT_CODE;
        }
    };
    let Some(target) = registry.get(&invocation.target) else {
        eprintln!("worker: unknown target `{}`", invocation.target);
        return WORKER_UNKNOWN_TARGET_EXIT_CODE;
    };
    if let Err(e) = target(&invocation) {
        eprintln!("worker: {} rejected its arguments: {e:#}", invocation.target);
    }
    0
}

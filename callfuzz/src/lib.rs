//! A fuzzing core for library functions, driven by their call arguments.
//!
//! Calls intercepted from a running program become seeds. Each seed's arguments
//! are mutated by a deterministic, type-directed engine and every mutant is run
//! in its own worker process under a supervisor that enforces timeouts and
//! resource ceilings. The generator state behind every execution is recorded,
//! so any crash can be rebuilt and replayed exactly.
//!
//! ## Getting Started
//!
//! Implement [`orchestrator::FuzzerOrchestrator`] and route worker start-up
//! through [`shim::worker_main`], so the fuzzer binary doubles as its worker.
//!
//! ```no_run
//! use callfuzz::fuzzer::{FuzzerBuilder, FuzzerState};
//! use callfuzz::invocation::Invocation;
//! use callfuzz::orchestrator::{self, FuzzerOrchestrator};
//! use callfuzz::shim::{TargetRegistry, worker_main};
//! use callfuzz::value::Value;
//!
//! // 1. Define a struct for your fuzzer and derive FuzzerState.
//! // Note: Requires the "derive" feature enabled for callfuzz.
//! #[cfg_attr(feature = "derive", derive(callfuzz::FuzzerState))]
//! struct MyFuzzer(FuzzerState);
//!
//! // Manual implementation if "derive" feature is not used:
//! #[cfg(not(feature = "derive"))]
//! impl AsRef<FuzzerState> for MyFuzzer {
//!     fn as_ref(&self) -> &FuzzerState { &self.0 }
//! }
//! #[cfg(not(feature = "derive"))]
//! impl AsMut<FuzzerState> for MyFuzzer {
//!     fn as_mut(&mut self) -> &mut FuzzerState { &mut self.0 }
//! }
//!
//! // 2. Only the defaults are needed for a plain campaign.
//! impl FuzzerOrchestrator for MyFuzzer {}
//!
//! fn main() {
//!     // 3. Register the functions a worker may call.
//!     let registry = TargetRegistry::new().register("text.repeat", |call| {
//!         if let [Value::Text(s), Value::Int(n)] = call.positional.as_slice() {
//!             let _ = s.repeat((*n).clamp(0, 64) as usize);
//!         }
//!         Ok(())
//!     });
//!
//!     // 4. Set up and run the fuzzer.
//!     worker_main(&registry, || {
//!         let state = FuzzerBuilder::new()
//!             .name("my_fuzzer")
//!             .with_seed(Invocation::positional(
//!                 "text.repeat",
//!                 vec![Value::Text("ab".into()), Value::Int(3)],
//!             ))
//!             .build();
//!         let report = orchestrator::run(MyFuzzer(state)).unwrap();
//!         println!("{} executions", report.executions());
//!     });
//! }
//! ```
//!
//! For a complete fuzzer, see the `demos/` directory in the project repository.
pub mod assistant;
pub mod config;
pub mod fuzzer;
pub mod generator;
pub mod havoc;
pub mod invocation;
pub mod orchestrator;
pub mod replay;
pub mod selector;
pub mod session;
pub mod shim;
pub mod supervisor;
pub mod util;
pub mod value;
pub mod worker;

pub mod constants;

pub mod custom;

// re-export libAFL_bolts
pub use libafl_bolts;

#[cfg(feature = "derive")]
pub use callfuzz_derive::{FuzzerState, Object};

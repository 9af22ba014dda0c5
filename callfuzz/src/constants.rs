//! This module defines constants used throughout the call fuzzer.
//! They cover the deterministic generator, the AFL-style havoc stage,
//! the typed value mutator and the worker protocol.

/// Multiplier of the linear-congruential step used by [`crate::generator::Generator`].
pub const LCG_MULTIPLIER: u64 = 0x5DEE_CE66D;

/// Increment of the linear-congruential step.
pub const LCG_INCREMENT: u64 = 0xB;

/// State used when nothing else seeds a generator.
pub const DEFAULT_GENERATOR_STATE: u64 = 4399;

/// Largest magnitude of an arithmetic nudge.
pub const ARITH_MAX: u64 = 35;

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 19] = [
    -32768, -129, -128, -1, 0, 1, 16, 32, 64, 100, 127, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
];

pub const INTERESTING_32: [i32; 27] = [
    -2147483648,
    -100663046,
    -32769,
    -32768,
    -129,
    -128,
    -1,
    0,
    1,
    16,
    32,
    64,
    100,
    127,
    128,
    255,
    256,
    512,
    1000,
    1024,
    4096,
    32767,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

pub const HAVOC_BLK_SMALL: usize = 32;
pub const HAVOC_BLK_MEDIUM: usize = 128;
pub const HAVOC_BLK_LARGE: usize = 1500;
pub const HAVOC_BLK_XL: usize = 32768;

/// Upper bound on the length of any buffer the havoc stage grows.
pub const MAX_HAVOC_BUFFER_LEN: usize = 1024 * 1024;

/// Number of havoc operators available to fixed-width buffers.
pub const HAVOC_FIXED_OPS: u64 = 9;

/// Number of havoc operators available to variable-length buffers.
pub const HAVOC_VARIABLE_OPS: u64 = 11;

/// Sequences duplicated by the list mutator are truncated to this many elements.
pub const MAX_DUPLICATED_LEN: usize = 100_000;

/// Nesting depth past which values are no longer descended into.
pub const MAX_MUTATION_DEPTH: usize = 20;

/// Chained mutations emitted per position by the deterministic triage mutator.
pub const DETERMINISTIC_MUTATIONS_PER_POSITION: usize = 10;

/// Extra time granted per outstanding mutation when sizing an attempt's timeout.
/// Assumes the median call finishes within 10ms.
pub const PER_MUTATION_ALLOWANCE_MS: u64 = 10;

/// Command line flag which turns a fuzzer binary into a worker.
pub const RUN_AS_WORKER_FLAG: &str = "--callfuzz-worker";

/// Exit code of a worker that could not receive or decode its invocation.
pub const WORKER_PROTOCOL_ERROR_EXIT_CODE: i32 = 120;

/// Exit code of a worker whose invocation names an unknown target.
pub const WORKER_UNKNOWN_TARGET_EXIT_CODE: i32 = 121;

/// Initial value estimate of every mutation strategy.
pub const INITIAL_ESTIMATE: f64 = 0.5;

/// Shortest window over which a worker's CPU share is computed. Clock ticks are
/// too coarse for shorter windows.
pub const CPU_SAMPLE_WINDOW_MS: u64 = 250;

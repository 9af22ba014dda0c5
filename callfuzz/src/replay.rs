//! Recording of executions and exact reconstruction of any mutant from its
//! recorded generator state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::custom::param_mutator::mutate_invocation;
use crate::generator::Generator;
use crate::invocation::{ArityMismatch, Invocation};
use crate::supervisor::{ExecutionOutcome, KillReason, OutcomeKind, Supervisor};
use crate::value::ValueKind;
use crate::worker::WorkerLauncher;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay diverges: record expects {expected}, seed has {found}")]
    Divergence { expected: String, found: String },
    #[error("record is for target `{expected}`, seed calls `{found}`")]
    TargetMismatch { expected: String, found: String },
    #[error("no record with ordinal {0}")]
    UnknownOrdinal(u64),
    #[error("no stored call with fingerprint {0:016x}")]
    UnknownBase(u64),
    #[error(transparent)]
    Arity(#[from] ArityMismatch),
    #[error("replay log I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed replay log entry: {0}")]
    Json(#[from] serde_json::Error),
    #[error("replay artifact encoding failed: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

/// Everything needed to rebuild one execution, given the call it was derived
/// from. That call is identified by `base_fingerprint`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub target: String,
    pub ordinal: u64,
    pub attempt: u32,
    pub generator_state: u64,
    pub outcome: OutcomeKind,
    pub kill_reason: Option<KillReason>,
    pub shape: Vec<ValueKind>,
    pub base_fingerprint: u64,
    pub recorded_at: DateTime<Utc>,
}

impl ReplayRecord {
    pub fn from_outcome(base: &Invocation, base_fingerprint: u64, outcome: &ExecutionOutcome) -> Self {
        Self {
            target: base.target.clone(),
            ordinal: outcome.ordinal,
            attempt: outcome.attempt,
            generator_state: outcome.generator_state,
            outcome: outcome.kind,
            kill_reason: outcome.kill_reason,
            shape: base.shape(),
            base_fingerprint,
            recorded_at: Utc::now(),
        }
    }
}

pub trait ReplayStore {
    fn record(&mut self, record: ReplayRecord) -> Result<(), ReplayError>;

    /// Keeps the call that later records' mutants are derived from, so that
    /// calls not known up front (such as assistant proposals) stay replayable.
    fn remember_base(&mut self, base: &Invocation, fingerprint: u64) -> Result<(), ReplayError>;
}

#[derive(Debug, Default)]
pub struct MemoryReplayStore {
    records: Vec<ReplayRecord>,
    bases: HashMap<u64, Invocation>,
}

impl MemoryReplayStore {
    pub fn records(&self) -> &[ReplayRecord] {
        &self.records
    }

    pub fn get(&self, ordinal: u64) -> Result<&ReplayRecord, ReplayError> {
        self.records
            .iter()
            .find(|r| r.ordinal == ordinal)
            .ok_or(ReplayError::UnknownOrdinal(ordinal))
    }

    pub fn base(&self, fingerprint: u64) -> Result<&Invocation, ReplayError> {
        self.bases
            .get(&fingerprint)
            .ok_or(ReplayError::UnknownBase(fingerprint))
    }
}

impl ReplayStore for MemoryReplayStore {
    fn record(&mut self, record: ReplayRecord) -> Result<(), ReplayError> {
        self.records.push(record);
        Ok(())
    }

    fn remember_base(&mut self, base: &Invocation, fingerprint: u64) -> Result<(), ReplayError> {
        self.bases.entry(fingerprint).or_insert_with(|| base.clone());
        Ok(())
    }
}

/// Lets seeds fuzzed on different threads share one store.
impl<S: ReplayStore> ReplayStore for &Mutex<S> {
    fn record(&mut self, record: ReplayRecord) -> Result<(), ReplayError> {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(record)
    }

    fn remember_base(&mut self, base: &Invocation, fingerprint: u64) -> Result<(), ReplayError> {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remember_base(base, fingerprint)
    }
}

/// Append-only log with one JSON record per line. Base calls are stored next
/// to it as `base_<fingerprint>.cbor`.
#[derive(Debug)]
pub struct JsonLinesReplayLog {
    path: PathBuf,
    file: File,
}

impl JsonLinesReplayLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Vec<ReplayRecord>, ReplayError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Reads back a call stored by [`ReplayStore::remember_base`] on the log at `path`.
    pub fn load_base(path: impl AsRef<Path>, fingerprint: u64) -> Result<Invocation, ReplayError> {
        match File::open(base_path(path.as_ref(), fingerprint)) {
            Ok(file) => Ok(serde_cbor::from_reader(BufReader::new(file))?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ReplayError::UnknownBase(fingerprint))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn base_path(log: &Path, fingerprint: u64) -> PathBuf {
    log.with_file_name(format!("base_{fingerprint:016x}.cbor"))
}

impl ReplayStore for JsonLinesReplayLog {
    fn record(&mut self, record: ReplayRecord) -> Result<(), ReplayError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        Ok(())
    }

    fn remember_base(&mut self, base: &Invocation, fingerprint: u64) -> Result<(), ReplayError> {
        let path = base_path(&self.path, fingerprint);
        if !path.exists() {
            serde_cbor::to_writer(File::create(path)?, base)?;
        }
        Ok(())
    }
}

/// Rebuilds the exact invocation that was executed under `record`.
///
/// `seed` must be exactly the call the record's mutant was derived from: same
/// target, same argument shape, same values. Anything else is reported, never
/// papered over.
pub fn reconstruct(
    seed: &Invocation,
    record: &ReplayRecord,
    generator: &mut Generator,
) -> Result<Invocation, ReplayError> {
    if seed.target != record.target {
        return Err(ReplayError::TargetMismatch {
            expected: record.target.clone(),
            found: seed.target.clone(),
        });
    }
    let shape = seed.shape();
    if shape != record.shape {
        return Err(ReplayError::Divergence {
            expected: format!("shape {:?}", record.shape),
            found: format!("shape {shape:?}"),
        });
    }
    let fingerprint = seed.fingerprint()?;
    if fingerprint != record.base_fingerprint {
        return Err(ReplayError::Divergence {
            expected: format!("call {:016x}", record.base_fingerprint),
            found: format!("call {fingerprint:016x}"),
        });
    }
    generator.set_state(record.generator_state);
    Ok(mutate_invocation(generator, seed)?)
}

pub struct ReplayReport {
    pub invocation: Invocation,
    pub outcome: ExecutionOutcome,
    /// CBOR dump of the reconstructed invocation, when an artifact directory was given.
    pub artifact: Option<PathBuf>,
}

/// Reconstructs the recorded mutant and runs it once more.
pub fn replay<L: WorkerLauncher>(
    supervisor: &mut Supervisor<L>,
    seed: &Invocation,
    record: &ReplayRecord,
    timeout: Duration,
    artifacts_dir: Option<&Path>,
) -> Result<ReplayReport, ReplayError> {
    let mut generator = Generator::default();
    let invocation = reconstruct(seed, record, &mut generator)?;

    let artifact = match artifacts_dir {
        Some(dir) => Some(dump_invocation(dir, &invocation, record.generator_state)?),
        None => None,
    };

    let outcome = supervisor.run_one(&invocation, timeout, record.generator_state, record.attempt);
    Ok(ReplayReport {
        invocation,
        outcome,
        artifact,
    })
}

fn dump_invocation(dir: &Path, invocation: &Invocation, state: u64) -> Result<PathBuf, ReplayError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("replay_{state}.cbor"));
    let file = File::create(&path)?;
    serde_cbor::to_writer(file, invocation)?;
    Ok(path)
}

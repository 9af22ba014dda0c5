//! The process that runs one mutated call, and the capability the supervisor
//! uses to watch and stop it.

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::constants::{CPU_SAMPLE_WINDOW_MS, RUN_AS_WORKER_FLAG};
use crate::invocation::Invocation;
use crate::util::{ProcSample, WorkerExit, clock_ticks_per_second, read_proc_sample};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to encode invocation for the worker: {0}")]
    Encode(#[from] serde_cbor::Error),
    #[error("failed to start worker process: {0}")]
    Spawn(#[from] io::Error),
}

/// Resource usage of a running worker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// CPU time over wall time across the last sampling window, in percent of one core.
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A started worker that can be observed and cancelled.
///
/// Implementations must make `terminate` reach every process the worker
/// spawned, not just the first one.
pub trait CancellableWorker {
    fn id(&self) -> u32;

    /// Non-blocking check for termination. Once it returns `Some`, the worker
    /// has been reaped and keeps returning the same exit.
    fn poll_exit(&mut self) -> io::Result<Option<WorkerExit>>;

    fn is_alive(&mut self) -> bool {
        matches!(self.poll_exit(), Ok(None))
    }

    fn usage(&mut self) -> Option<ResourceUsage>;

    /// Sends a termination request (`graceful`) or an unconditional kill.
    fn terminate(&mut self, graceful: bool) -> io::Result<()>;

    /// Blocks until the worker has exited and been reaped.
    fn wait(&mut self) -> io::Result<WorkerExit>;

    /// Output captured so far. Only meaningful after the worker was reaped.
    /// Waits at most `wait` for the output streams to close.
    fn take_output(&mut self, wait: Duration) -> Option<CapturedOutput>;
}

/// Starts one worker per invocation.
pub trait WorkerLauncher {
    type Worker: CancellableWorker;

    fn start(&self, invocation: &Invocation) -> Result<Self::Worker, SpawnError>;
}

/// Launches workers as child processes, each the leader of a fresh process
/// group. The invocation is sent CBOR-encoded on stdin.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    capture_output: bool,
}

impl ProcessLauncher {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            capture_output: false,
        }
    }

    /// Re-executes the running binary in worker mode.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, [RUN_AS_WORKER_FLAG]))
    }

    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Worker = ProcessWorker;

    fn start(&self, invocation: &Invocation) -> Result<ProcessWorker, SpawnError> {
        let payload = serde_cbor::to_vec(invocation)?;
        let output = || {
            if self.capture_output {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(output())
            .stderr(output())
            .process_group(0)
            .spawn()?;

        if let Some(stdin) = child.stdin.take() {
            std::thread::spawn(move || feed(stdin, &payload));
        }
        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);

        Ok(ProcessWorker {
            child,
            exit: None,
            stdout,
            stderr,
            last_sample: None,
            cpu_percent: 0.0,
            ticks_per_second: clock_ticks_per_second(),
        })
    }
}

// A worker that exits without reading its input closes the pipe early, so
// write errors are dropped here. The worker reports bad input itself.
fn feed(mut stdin: ChildStdin, payload: &[u8]) {
    let _ = stdin.write_all(payload);
}

/// Forwards `stream` in chunks until it closes.
fn collect<R: Read + Send + 'static>(mut stream: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    });
    rx
}

/// Chunks received before the stream closed or `deadline` passed. A process
/// outside the worker's group may hold the pipe open indefinitely.
fn drain_until(chunks: Receiver<Vec<u8>>, deadline: Instant) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match chunks.recv_timeout(left) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected | RecvTimeoutError::Timeout) => break,
        }
    }
    out
}

pub struct ProcessWorker {
    child: Child,
    exit: Option<WorkerExit>,
    stdout: Option<Receiver<Vec<u8>>>,
    stderr: Option<Receiver<Vec<u8>>>,
    last_sample: Option<(ProcSample, Instant)>,
    cpu_percent: f64,
    ticks_per_second: u64,
}

impl CancellableWorker for ProcessWorker {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn poll_exit(&mut self) -> io::Result<Option<WorkerExit>> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait()?.map(WorkerExit::from);
        }
        Ok(self.exit)
    }

    fn usage(&mut self) -> Option<ResourceUsage> {
        let sample = read_proc_sample(self.id())?;
        let now = Instant::now();
        match self.last_sample {
            None => self.last_sample = Some((sample, now)),
            Some((previous, at)) => {
                let wall = now.duration_since(at);
                if wall >= Duration::from_millis(CPU_SAMPLE_WINDOW_MS) {
                    let cpu = sample.cpu_ticks.saturating_sub(previous.cpu_ticks) as f64
                        / self.ticks_per_second as f64;
                    self.cpu_percent = 100.0 * cpu / wall.as_secs_f64();
                    self.last_sample = Some((sample, now));
                }
            }
        }
        Some(ResourceUsage {
            cpu_percent: self.cpu_percent,
            rss_bytes: sample.rss_bytes,
        })
    }

    fn terminate(&mut self, graceful: bool) -> io::Result<()> {
        let signal = if graceful {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        match killpg(Pid::from_raw(self.child.id() as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn wait(&mut self) -> io::Result<WorkerExit> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let exit = WorkerExit::from(self.child.wait()?);
        self.exit = Some(exit);
        Ok(exit)
    }

    fn take_output(&mut self, wait: Duration) -> Option<CapturedOutput> {
        let deadline = Instant::now() + wait;
        let stdout = drain_until(self.stdout.take()?, deadline);
        let stderr = self
            .stderr
            .take()
            .map(|chunks| drain_until(chunks, deadline))
            .unwrap_or_default();
        Some(CapturedOutput { stdout, stderr })
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if self.exit.is_none() {
            let _ = self.terminate(false);
            let _ = self.wait();
        }
    }
}

use nix::unistd::{SysconfVar, sysconf};
use slog::{Drain, Level, LevelFilter, Logger, o};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::constants::WORKER_PROTOCOL_ERROR_EXIT_CODE;
use crate::supervisor::OutcomeKind;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Code(code),
            (None, Some(signo)) => WorkerExit::Signal(signo),
            // Stopped or continued processes are not reported by wait(2) here.
            (None, None) => WorkerExit::Code(-1),
        }
    }
}

/// Maps a worker's termination to the outcome reported for it.
pub fn classify_exit(exit: WorkerExit) -> OutcomeKind {
    match exit {
        WorkerExit::Code(0) => OutcomeKind::Ok,
        WorkerExit::Code(WORKER_PROTOCOL_ERROR_EXIT_CODE) => OutcomeKind::SpawnFailure,
        WorkerExit::Code(code) => OutcomeKind::Abnormal(code),
        WorkerExit::Signal(signo) => OutcomeKind::Abnormal(-signo),
    }
}

/// CPU time and resident memory of one process, read from `/proc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcSample {
    pub cpu_ticks: u64,
    pub rss_bytes: u64,
}

/// Reads `/proc/<pid>/stat` and `/proc/<pid>/statm`. Returns `None` once the
/// process is gone or on systems without procfs.
pub fn read_proc_sample(pid: u32) -> Option<ProcSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let cpu_ticks = parse_cpu_ticks(&stat)?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(ProcSample {
        cpu_ticks,
        rss_bytes: resident_pages.saturating_mul(page_size()),
    })
}

/// utime + stime from a `/proc/<pid>/stat` line. The command name may itself
/// contain spaces and parentheses, so fields are counted from the last `)`.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

fn sysconf_or(var: SysconfVar, fallback: u64) -> u64 {
    match sysconf(var) {
        Ok(Some(value)) if value > 0 => value as u64,
        _ => fallback,
    }
}

pub fn clock_ticks_per_second() -> u64 {
    sysconf_or(SysconfVar::CLK_TCK, 100)
}

pub fn page_size() -> u64 {
    sysconf_or(SysconfVar::PAGE_SIZE, 4096)
}

/// A root logger writing to stderr at the given level, off the calling thread.
pub fn stderr_logger(level: Level) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(LevelFilter::new(drain, level).fuse(), o!())
}

pub fn discard_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exits_are_classified() {
        assert_eq!(classify_exit(WorkerExit::Code(0)), OutcomeKind::Ok);
        assert_eq!(classify_exit(WorkerExit::Code(3)), OutcomeKind::Abnormal(3));
        assert_eq!(classify_exit(WorkerExit::Signal(11)), OutcomeKind::Abnormal(-11));
        assert_eq!(
            classify_exit(WorkerExit::Code(WORKER_PROTOCOL_ERROR_EXIT_CODE)),
            OutcomeKind::SpawnFailure
        );
    }

    #[test]
    fn exit_status_conversion_keeps_signals() {
        assert_eq!(WorkerExit::from(ExitStatus::from_raw(9)), WorkerExit::Signal(9));
        assert_eq!(WorkerExit::from(ExitStatus::from_raw(2 << 8)), WorkerExit::Code(2));
    }

    #[test]
    fn stat_line_with_spaces_in_the_name() {
        let stat = "1234 (my (odd) proc) S 1 1234 1234 0 -1 4194560 100 0 0 0 25 17 0 0 20 0 1 0";
        assert_eq!(parse_cpu_ticks(stat), Some(42));
    }

    #[test]
    fn system_constants_are_positive() {
        assert!(clock_ticks_per_second() > 0);
        assert!(page_size() >= 4096);
    }

    #[test]
    fn stderr_logger_filters_below_its_level() {
        let logger = stderr_logger(Level::Warning);
        assert!(!logger.is_enabled(Level::Info));
        assert!(logger.is_enabled(Level::Error));
        slog::warn!(logger, "logger under test"; "level" => "warning");
    }

    #[test]
    fn own_process_can_be_sampled() {
        let sample = read_proc_sample(std::process::id());
        if std::path::Path::new("/proc/self/stat").exists() {
            assert!(sample.unwrap().rss_bytes > 0);
        }
    }
}

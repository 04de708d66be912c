use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::Serialize;

use crate::utils::{MemoryLimitType, TimeLimitType};

/// Classification of a finished run, orthogonal to answer correctness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
  Accepted,
  TimeLimitExceeded,
  MemoryLimitExceeded,
  RuntimeError,
}

/// How a compiler or checker process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
  Exited(i32),
  /// Killed by the CPU limit, the wall-clock watchdog or a memory fault
  LimitSignal(Signal),
  Signaled(Signal),
}

/// Exit protocol of a special judge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerExit {
  /// Exit code 0
  Accepted,
  /// Exit code 1: the checker rejects the answer and explains why on stdout
  CheckerMismatch,
  Crashed(Signal),
  Abnormal(ExitKind),
}

/// Exit protocol of a compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileExit {
  Success,
  /// The compiler was killed mid-write, its output is not trusted
  LimitExceeded(Signal),
  Failed(ExitKind),
}

impl Verdict {
  pub fn short_name(&self) -> &'static str {
    match self {
      Verdict::Accepted => "AC",
      Verdict::TimeLimitExceeded => "TLE",
      Verdict::MemoryLimitExceeded => "MLE",
      Verdict::RuntimeError => "RE",
    }
  }
}

pub fn is_time_signal(signal: Signal) -> bool {
  matches!(signal, Signal::SIGXCPU | Signal::SIGALRM)
}

pub fn is_limit_signal(signal: Signal) -> bool {
  is_time_signal(signal) || signal == Signal::SIGSEGV
}

/// Verdict of a process that died by `signal`
pub fn classify_signal(signal: Signal, memory: MemoryLimitType, memory_limit: MemoryLimitType) -> Verdict {
  match signal {
    Signal::SIGXCPU | Signal::SIGALRM => Verdict::TimeLimitExceeded,
    Signal::SIGSEGV if memory > memory_limit => Verdict::MemoryLimitExceeded,
    _ => Verdict::RuntimeError,
  }
}

/// Verdict of a process that exited normally, compared against the judged limits
pub fn classify_usage(
  time: TimeLimitType,
  memory: MemoryLimitType,
  time_limit: TimeLimitType,
  memory_limit: MemoryLimitType,
) -> Verdict {
  if time > time_limit {
    Verdict::TimeLimitExceeded
  } else if memory > memory_limit {
    Verdict::MemoryLimitExceeded
  } else {
    Verdict::Accepted
  }
}

impl ExitKind {
  /// `None` for states which are not terminal
  pub fn from_wait(status: WaitStatus) -> Option<ExitKind> {
    match status {
      WaitStatus::Exited(_, code) => Some(ExitKind::Exited(code)),
      WaitStatus::Signaled(_, signal, _) if is_limit_signal(signal) => Some(ExitKind::LimitSignal(signal)),
      WaitStatus::Signaled(_, signal, _) => Some(ExitKind::Signaled(signal)),
      _ => None,
    }
  }
}

impl From<ExitKind> for CheckerExit {
  fn from(kind: ExitKind) -> Self {
    match kind {
      ExitKind::Exited(0) => CheckerExit::Accepted,
      ExitKind::Exited(1) => CheckerExit::CheckerMismatch,
      ExitKind::LimitSignal(signal) => CheckerExit::Crashed(signal),
      kind => CheckerExit::Abnormal(kind),
    }
  }
}

impl From<ExitKind> for CompileExit {
  fn from(kind: ExitKind) -> Self {
    match kind {
      ExitKind::Exited(0) => CompileExit::Success,
      ExitKind::LimitSignal(signal) => CompileExit::LimitExceeded(signal),
      kind => CompileExit::Failed(kind),
    }
  }
}

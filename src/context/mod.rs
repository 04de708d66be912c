use std::ffi::CString;
use std::os::unix::prelude::RawFd;

use log::warn;
use nix::libc::STDOUT_FILENO;
use nix::sys::signal::Signal;
use nix::unistd::{isatty, Uid};
use serde::{Serialize, Serializer};

use crate::syscall::SyscallFilter;
use crate::usage::RunBoxUsage;
use crate::utils::{into_c_string, MemoryLimitType, SyscallId, TimeLimitType};
use crate::verdict::Verdict;
use crate::RunBoxError;

pub use builder::RunBoxBuilder;

mod builder;

/// Execution request: one program, its limits and its sandbox discipline
#[derive(Debug, Clone)]
pub struct RunBoxOption {
  /// Used to identify command
  label: String,
  /// Time limit (unit: ms)
  time_limit: TimeLimitType,
  /// Memory limit (unit: KB)
  memory_limit: MemoryLimitType,
  program: String,
  arguments: Vec<String>,
  runner: Option<Uid>,
  ptrace: Option<SyscallFilter>,
  stdin: Option<RawFd>,
  stdout: Option<RawFd>,
  stderr: Option<RawFd>,
}

/// Request is valid but unsafe for untrusted code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConfigWarning {
  /// No run-as user, the program keeps the caller's identity and may raise its own limits
  NoRunner,
  /// The syscall whitelist allows creating threads or processes, which are not traced
  UntracedSpawn,
}

/// Access rule broken by a traced program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Violation {
  Syscall { id: SyscallId },
  File { path: String, mode: u64 },
}

/// Execution result of the run flow
#[derive(Debug, Clone, Serialize)]
pub struct RunBoxResult {
  verdict: Verdict,
  status: Option<i32>,
  #[serde(serialize_with = "serialize_signal")]
  signal: Option<Signal>,
  time: TimeLimitType,
  time_user: TimeLimitType,
  time_sys: TimeLimitType,
  memory: MemoryLimitType,
  violation: Option<Violation>,
}

/// Final result of the compile and special judge flows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "message", rename_all = "lowercase")]
pub enum FlowOutcome {
  Success,
  Diagnostic(String),
}

/// Print a result for a human on a terminal, or as JSON otherwise
pub trait Report {
  fn report(&self) {
    let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
    if is_tty {
      self.report_human();
    } else {
      self.report_json();
    }
  }

  fn report_human(&self);

  fn report_json(&self);
}

fn serialize_signal<S: Serializer>(signal: &Option<Signal>, serializer: S) -> Result<S::Ok, S::Error> {
  match signal {
    Some(signal) => serializer.serialize_some(&(*signal as i32)),
    None => serializer.serialize_none(),
  }
}

impl RunBoxOption {
  pub fn label(&self) -> &String {
    &self.label
  }

  pub fn time_limit(&self) -> TimeLimitType {
    self.time_limit
  }

  pub fn memory_limit(&self) -> MemoryLimitType {
    self.memory_limit
  }

  pub fn program(&self) -> &String {
    &self.program
  }

  pub fn arguments(&self) -> &Vec<String> {
    &self.arguments
  }

  /// argv passed to exec, the program itself comes first
  pub fn argv(&self) -> Result<Vec<CString>, RunBoxError> {
    let mut argv = vec![into_c_string(&self.program)?];
    for argument in self.arguments.iter() {
      argv.push(into_c_string(argument)?);
    }
    Ok(argv)
  }

  pub fn runner(&self) -> Option<Uid> {
    self.runner
  }

  pub fn ptrace(&self) -> &Option<SyscallFilter> {
    &self.ptrace
  }

  pub fn stdin(&self) -> Option<RawFd> {
    self.stdin
  }

  pub fn stdout(&self) -> Option<RawFd> {
    self.stdout
  }

  pub fn stderr(&self) -> Option<RawFd> {
    self.stderr
  }

  pub fn warnings(&self) -> Vec<ConfigWarning> {
    let mut warnings = vec![];
    if self.runner.is_none() {
      warnings.push(ConfigWarning::NoRunner);
    }
    if self.ptrace.as_ref().map_or(false, |filter| filter.allows_spawning()) {
      warnings.push(ConfigWarning::UntracedSpawn);
    }
    warnings
  }

  pub(crate) fn log_warnings(&self) {
    for warning in self.warnings() {
      match warning {
        ConfigWarning::NoRunner => warn!(
          "Command {} runs without a runner uid, the program may change its own limits",
          self.label
        ),
        ConfigWarning::UntracedSpawn => warn!(
          "Command {} may create threads or processes, they run without syscall tracing",
          self.label
        ),
      }
    }
  }
}

impl RunBoxResult {
  pub(crate) fn new(verdict: Verdict, usage: RunBoxUsage) -> Self {
    RunBoxResult {
      verdict,
      status: None,
      signal: None,
      time: usage.time(),
      time_user: usage.time_user(),
      time_sys: usage.time_sys(),
      memory: usage.memory(),
      violation: None,
    }
  }

  pub(crate) fn with_status(mut self, status: i32) -> Self {
    self.status = Some(status);
    self
  }

  pub(crate) fn with_signal(mut self, signal: Signal) -> Self {
    self.signal = Some(signal);
    self
  }

  pub(crate) fn with_violation(mut self, violation: Violation) -> Self {
    self.violation = Some(violation);
    self
  }

  /// A timed out run never reports less time than its limit
  pub(crate) fn floor_time(mut self, time_limit: TimeLimitType) -> Self {
    if self.verdict == Verdict::TimeLimitExceeded && self.time < time_limit {
      self.time = time_limit;
    }
    self
  }

  pub fn verdict(&self) -> Verdict {
    self.verdict
  }

  pub fn status(&self) -> &Option<i32> {
    &self.status
  }

  pub fn signal(&self) -> &Option<Signal> {
    &self.signal
  }

  pub fn time(&self) -> TimeLimitType {
    self.time
  }

  pub fn time_user(&self) -> TimeLimitType {
    self.time_user
  }

  pub fn time_sys(&self) -> TimeLimitType {
    self.time_sys
  }

  pub fn memory(&self) -> MemoryLimitType {
    self.memory
  }

  pub fn violation(&self) -> &Option<Violation> {
    &self.violation
  }

  pub fn offending_syscall(&self) -> Option<SyscallId> {
    match &self.violation {
      Some(Violation::Syscall { id }) => Some(*id),
      _ => None,
    }
  }

  pub fn offending_file(&self) -> Option<(&str, u64)> {
    match &self.violation {
      Some(Violation::File { path, mode }) => Some((path.as_str(), *mode)),
      _ => None,
    }
  }
}

impl FlowOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, FlowOutcome::Success)
  }

  pub fn diagnostic(&self) -> Option<&str> {
    match self {
      FlowOutcome::Success => None,
      FlowOutcome::Diagnostic(message) => Some(message.as_str()),
    }
  }
}

impl Report for RunBoxResult {
  fn report_human(&self) {
    let verdict = if self.verdict == Verdict::Accepted {
      format!("\x1b[92m{}\x1b[39m", self.verdict.short_name())
    } else {
      format!("\x1b[91m{}\x1b[39m", self.verdict.short_name())
    };
    let status = self.status.map_or_else(
      || "\x1b[91m×\x1b[39m".to_string(),
      |v| format!("\x1b[9{}m{}\x1b[39m", if v == 0 { 2 } else { 1 }, v),
    );
    let signal = self.signal.map_or_else(
      || "\x1b[92m✓\x1b[39m".to_string(),
      |v| format!("\x1b[91m{}\x1b[39m", v),
    );

    println!();
    println!("\x1b[1mVerdict\x1b[22m    {}", verdict);
    println!("\x1b[1mStatus\x1b[22m     {}", status);
    println!("\x1b[1mSignal\x1b[22m     {}", signal);
    println!("\x1b[1mTime\x1b[22m       {} ms", self.time);
    println!("\x1b[1mTime user\x1b[22m  {} ms", self.time_user);
    println!("\x1b[1mTime sys\x1b[22m   {} ms", self.time_sys);
    println!("\x1b[1mMemory\x1b[22m     {} KB", self.memory);
    match &self.violation {
      Some(Violation::Syscall { id }) => println!("\x1b[1mSyscall\x1b[22m    \x1b[91m{}\x1b[39m", id),
      Some(Violation::File { path, mode }) => {
        println!("\x1b[1mFile\x1b[22m       \x1b[91m{}\x1b[39m ({:#o})", path, mode)
      }
      None => {}
    }
    println!();
  }

  fn report_json(&self) {
    let mut value = serde_json::json!({ "ok": true });
    if let (Some(map), Ok(serde_json::Value::Object(result))) = (value.as_object_mut(), serde_json::to_value(self)) {
      map.extend(result);
    }
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
  }
}

impl Report for FlowOutcome {
  fn report_human(&self) {
    match self {
      FlowOutcome::Success => println!("\x1b[92m✓\x1b[39m"),
      FlowOutcome::Diagnostic(message) => {
        println!("\x1b[91m×\x1b[39m");
        println!("{}", message.trim_end());
      }
    }
  }

  fn report_json(&self) {
    let value = serde_json::json!({
      "ok": true,
      "success": self.is_success(),
      "message": self.diagnostic(),
    });
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tle_time_is_floored_to_limit() {
    let usage = RunBoxUsage::new(3, 1, 512);
    let result = RunBoxResult::new(Verdict::TimeLimitExceeded, usage)
      .with_signal(Signal::SIGALRM)
      .floor_time(1000);
    assert_eq!(result.time(), 1000);
    assert_eq!(result.time_user(), 3);

    let result = RunBoxResult::new(Verdict::RuntimeError, usage).floor_time(1000);
    assert_eq!(result.time(), 4);
  }

  #[test]
  fn violation_accessors() {
    let usage = RunBoxUsage::default();
    let result = RunBoxResult::new(Verdict::RuntimeError, usage).with_violation(Violation::Syscall { id: 57 });
    assert_eq!(result.offending_syscall(), Some(57));
    assert_eq!(result.offending_file(), None);

    let result = RunBoxResult::new(Verdict::RuntimeError, usage).with_violation(Violation::File {
      path: "/etc/passwd".to_string(),
      mode: 0,
    });
    assert_eq!(result.offending_syscall(), None);
    assert_eq!(result.offending_file(), Some(("/etc/passwd", 0)));
  }

  #[test]
  fn result_serializes_signal_number() {
    let result = RunBoxResult::new(Verdict::RuntimeError, RunBoxUsage::new(10, 2, 1024)).with_signal(Signal::SIGSEGV);
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["verdict"], "RuntimeError");
    assert_eq!(value["signal"], 11);
    assert_eq!(value["time"], 12);
    assert_eq!(value["violation"], serde_json::Value::Null);
  }
}

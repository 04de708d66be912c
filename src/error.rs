use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

/// Step of the child setup sequence which may fail before the target program runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStage {
  RedirectStdin = 1,
  RedirectStdout,
  RedirectStderr,
  LimitCpu,
  LimitData,
  LimitAddressSpace,
  LimitStack,
  Watchdog,
  SetUid,
  TraceMe,
  Exec,
}

/// Setup failure reported by the child through the private error pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupFailure {
  pub stage: SetupStage,
  pub errno: Errno,
}

pub enum RunBoxError {
  Setup(SetupFailure),
  Fork(String),
  Monitor(String),
  Config(String),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
}

#[allow(unused)]
pub enum RunBoxExit {
  Ok,
  Err(RunBoxError),
}

impl SetupStage {
  pub fn from_u8(value: u8) -> Option<SetupStage> {
    let stage = match value {
      1 => SetupStage::RedirectStdin,
      2 => SetupStage::RedirectStdout,
      3 => SetupStage::RedirectStderr,
      4 => SetupStage::LimitCpu,
      5 => SetupStage::LimitData,
      6 => SetupStage::LimitAddressSpace,
      7 => SetupStage::LimitStack,
      8 => SetupStage::Watchdog,
      9 => SetupStage::SetUid,
      10 => SetupStage::TraceMe,
      11 => SetupStage::Exec,
      _ => return None,
    };
    Some(stage)
  }

  pub fn describe(&self) -> &'static str {
    match self {
      SetupStage::RedirectStdin => "dup2 stdin failure",
      SetupStage::RedirectStdout => "dup2 stdout failure",
      SetupStage::RedirectStderr => "dup2 stderr failure",
      SetupStage::LimitCpu => "set RLIMIT_CPU failure",
      SetupStage::LimitData => "set RLIMIT_DATA failure",
      SetupStage::LimitAddressSpace => "set RLIMIT_AS failure",
      SetupStage::LimitStack => "set RLIMIT_STACK failure",
      SetupStage::Watchdog => "set ITIMER_REAL failure",
      SetupStage::SetUid => "setuid failure",
      SetupStage::TraceMe => "PTRACE_TRACEME failure",
      SetupStage::Exec => "execvp failure",
    }
  }
}

impl Display for SetupFailure {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_fmt(format_args!("{} ({})", self.stage.describe(), self.errno))
  }
}

impl RunBoxError {
  pub fn fork<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Fork(msg.into())
  }

  pub fn monitor<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Monitor(msg.into())
  }

  pub fn config<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Config(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> RunBoxError {
    RunBoxError::Cli(msg.into())
  }

  /// Whether the error happened before the target program could run
  pub fn is_setup(&self) -> bool {
    matches!(self, RunBoxError::Setup(_) | RunBoxError::Fork(_))
  }
}

impl Debug for RunBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for RunBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      RunBoxError::Setup(failure) => f.write_fmt(format_args!("RunBox Setup Error: {}", failure)),
      RunBoxError::Fork(msg) => f.write_fmt(format_args!("RunBox Fork Error: {}", msg)),
      RunBoxError::Monitor(msg) => f.write_fmt(format_args!("RunBox Monitor Error: {}", msg)),
      RunBoxError::Config(msg) => f.write_fmt(format_args!("RunBox Config Error: {}", msg)),
      RunBoxError::Nix(errno) => f.write_fmt(format_args!("RunBox Nix Error: {}", errno)),
      RunBoxError::Fs(msg) => f.write_fmt(format_args!("RunBox File System Error: {}", msg)),
      RunBoxError::Cli(msg) => f.write_fmt(format_args!("RunBox CLI Error: {}", msg)),
      RunBoxError::Logger(err) => f.write_fmt(format_args!("RunBox Logger Error: {}", err)),
    }
  }
}

impl From<SetupFailure> for RunBoxError {
  fn from(failure: SetupFailure) -> Self {
    RunBoxError::Setup(failure)
  }
}

impl From<Errno> for RunBoxError {
  fn from(errno: Errno) -> Self {
    RunBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for RunBoxError {
  fn from(err: std::io::Error) -> Self {
    RunBoxError::Fs(err.to_string())
  }
}

impl From<serde_json::Error> for RunBoxError {
  fn from(err: serde_json::Error) -> Self {
    RunBoxError::Config(err.to_string())
  }
}

impl From<FlexiLoggerError> for RunBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    RunBoxError::Logger(err)
  }
}

impl Error for RunBoxError {}

impl Termination for RunBoxExit {
  fn report(self) -> ExitCode {
    match self {
      RunBoxExit::Ok => ExitCode::SUCCESS.report(),
      RunBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              serde_json::json!({ "ok": false, "type": prefix, "message": message }).to_string()
            }
          }
          None => {
            format!("{}", err)
          }
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn setup_stage_byte_is_stable() {
    for value in 1..=11u8 {
      let stage = SetupStage::from_u8(value).unwrap();
      assert_eq!(stage as u8, value);
    }
    assert_eq!(SetupStage::from_u8(0), None);
    assert_eq!(SetupStage::from_u8(12), None);
  }

  #[test]
  fn setup_error_mentions_stage() {
    let err = RunBoxError::from(SetupFailure {
      stage: SetupStage::RedirectStdout,
      errno: Errno::EBADF,
    });
    assert!(err.is_setup());
    assert!(format!("{}", err).contains("dup2 stdout failure"));
  }
}

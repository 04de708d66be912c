use std::os::unix::prelude::RawFd;

use nix::unistd::Uid;

use crate::syscall::SyscallFilter;
use crate::utils::{MemoryLimitType, TimeLimitType, UidType};
use crate::{RunBoxError, RunBoxOption};

/// Build a RunBox execution request
pub struct RunBoxBuilder {
  option: RunBoxOption,
}

impl RunBoxBuilder {
  /// Create a new command to be run
  pub fn new<PS: Into<String>, AS: Into<String>>(program: PS, arguments: Vec<AS>) -> Self {
    RunBoxBuilder {
      option: RunBoxOption {
        label: "runbox".to_string(),
        time_limit: 1000,
        memory_limit: 262144,
        program: program.into(),
        arguments: arguments.into_iter().map(|a| a.into()).collect(),
        runner: None,
        ptrace: None,
        stdin: None,
        stdout: None,
        stderr: None,
      },
    }
  }

  /// Finish building, the request is checked here
  pub fn build(self) -> Result<RunBoxOption, RunBoxError> {
    let option = self.option;
    if option.program.is_empty() {
      return Err(RunBoxError::config("Command should not be empty"));
    }
    if option.time_limit == 0 {
      return Err(RunBoxError::config("Time limit should be greater than 0"));
    }
    if option.memory_limit == 0 {
      return Err(RunBoxError::config("Memory limit should be greater than 0"));
    }
    Ok(option)
  }

  /// Set label
  pub fn label<LS: Into<String>>(mut self, label: LS) -> Self {
    self.option.label = label.into();
    self
  }

  /// Set time limit (unit: ms)
  pub fn time_limit(mut self, value: TimeLimitType) -> Self {
    self.option.time_limit = value;
    self
  }

  /// Set memory limit (unit: KB)
  pub fn memory_limit(mut self, value: MemoryLimitType) -> Self {
    self.option.memory_limit = value;
    self
  }

  /// Run as uid
  pub fn runner(mut self, uid: UidType) -> Self {
    self.option.runner = Some(Uid::from_raw(uid));
    self
  }

  /// Run as uid or keep the current identity
  pub fn set_runner(mut self, uid: Option<UidType>) -> Self {
    self.option.runner = uid.map(Uid::from_raw);
    self
  }

  /// Set stdin redirection or not
  pub fn set_stdin(mut self, fd: Option<RawFd>) -> Self {
    self.option.stdin = fd;
    self
  }

  /// Set stdin redirection
  pub fn stdin(mut self, fd: RawFd) -> Self {
    self.option.stdin = Some(fd);
    self
  }

  /// Set stdout redirection or not
  pub fn set_stdout(mut self, fd: Option<RawFd>) -> Self {
    self.option.stdout = fd;
    self
  }

  /// Set stdout redirection
  pub fn stdout(mut self, fd: RawFd) -> Self {
    self.option.stdout = Some(fd);
    self
  }

  /// Set stderr redirection or not
  pub fn set_stderr(mut self, fd: Option<RawFd>) -> Self {
    self.option.stderr = fd;
    self
  }

  /// Set stderr redirection
  pub fn stderr(mut self, fd: RawFd) -> Self {
    self.option.stderr = Some(fd);
    self
  }

  /// Enable syscall tracing with a syscall and file whitelist
  pub fn ptrace(mut self, filter: SyscallFilter) -> Self {
    self.option.ptrace = Some(filter);
    self
  }

  /// Set ptrace feature or not
  pub fn set_ptrace(mut self, filter: Option<SyscallFilter>) -> Self {
    self.option.ptrace = filter;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ConfigWarning;

  #[test]
  fn it_should_build_defaults() {
    let option = RunBoxBuilder::new("./main", vec!["1", "2"]).build().unwrap();
    assert_eq!(option.time_limit(), 1000);
    assert_eq!(option.memory_limit(), 262144);
    assert_eq!(option.argv().unwrap().len(), 3);
    assert!(option.ptrace().is_none());
    assert_eq!(option.warnings(), vec![ConfigWarning::NoRunner]);
  }

  #[test]
  fn runner_silences_warning() {
    let option = RunBoxBuilder::new("./main", Vec::<String>::new())
      .runner(65534)
      .build()
      .unwrap();
    assert_eq!(option.runner(), Some(Uid::from_raw(65534)));
    assert!(option.warnings().is_empty());
  }

  #[test]
  fn spawning_whitelist_is_warned() {
    let option = RunBoxBuilder::new("./main", Vec::<String>::new())
      .runner(65534)
      .ptrace(SyscallFilter::new(0..512, Vec::<(String, bool)>::new()))
      .build()
      .unwrap();
    assert_eq!(option.warnings(), vec![ConfigWarning::UntracedSpawn]);

    // clone, fork, vfork, clone3
    let calls = (0..512).filter(|id| ![56, 57, 58, 435].contains(id));
    let option = RunBoxBuilder::new("./main", Vec::<String>::new())
      .runner(65534)
      .ptrace(SyscallFilter::new(calls, Vec::<(String, bool)>::new()))
      .build()
      .unwrap();
    assert!(option.warnings().is_empty());
  }

  #[test]
  fn it_should_reject_bad_requests() {
    assert!(RunBoxBuilder::new("", Vec::<String>::new()).build().is_err());
    assert!(RunBoxBuilder::new("./main", Vec::<String>::new())
      .time_limit(0)
      .build()
      .is_err());
    assert!(RunBoxBuilder::new("./main", Vec::<String>::new())
      .memory_limit(0)
      .build()
      .is_err());
  }

  #[test]
  fn nul_in_argument_is_config_error() {
    let option = RunBoxBuilder::new("./main", vec!["a\0b"]).build().unwrap();
    assert!(matches!(option.argv(), Err(RunBoxError::Config(_))));
  }
}

use std::collections::HashMap;
use std::fs;
use std::os::unix::prelude::RawFd;
use std::path::Path;

use serde::Deserialize;

use crate::syscall::SyscallFilter;
use crate::utils::{MemoryLimitType, SyscallId, TimeLimitType, UidType};
use crate::{RunBoxBuilder, RunBoxError, RunBoxOption};

/// Execution request as a JSON document
///
/// ```json
/// { "args": ["./main"], "timelimit": 1000, "memorylimit": 65536, "fd_in": 0,
///   "runner": 65534, "trace": true, "calls": [0, 1, 60], "files": { "/etc/ld.so.cache": 1 } }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
  /// Program followed by its arguments
  pub args: Vec<String>,
  pub fd_in: Option<RawFd>,
  pub fd_out: Option<RawFd>,
  pub fd_err: Option<RawFd>,
  /// Unit: ms
  pub timelimit: TimeLimitType,
  /// Unit: KB
  pub memorylimit: MemoryLimitType,
  pub runner: Option<UidType>,
  #[serde(default)]
  pub trace: bool,
  pub calls: Option<Vec<SyscallId>>,
  /// 0 denies the path, anything else allows it
  pub files: Option<HashMap<String, i64>>,
}

impl RequestConfig {
  pub fn from_json(text: &str) -> Result<Self, RunBoxError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RunBoxError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
      .map_err(|err| RunBoxError::config(format!("Can not read {}: {}", path.to_string_lossy(), err)))?;
    Self::from_json(&text)
  }

  /// Syscall filter requested by this document, `None` when tracing is off
  pub fn filter(&self) -> Result<Option<SyscallFilter>, RunBoxError> {
    if !self.trace {
      return Ok(None);
    }
    match (&self.calls, &self.files) {
      (Some(calls), Some(files)) => Ok(Some(SyscallFilter::new(
        calls.iter().copied(),
        files.iter().map(|(path, flag)| (path.clone(), *flag != 0)),
      ))),
      (None, _) => Err(RunBoxError::config("Tracing requires the calls whitelist")),
      (_, None) => Err(RunBoxError::config("Tracing requires the files whitelist")),
    }
  }

  pub fn into_builder(self) -> Result<RunBoxBuilder, RunBoxError> {
    let filter = self.filter()?;
    let mut args = self.args.into_iter();
    let program = args
      .next()
      .ok_or_else(|| RunBoxError::config("args should contain the program"))?;

    Ok(
      RunBoxBuilder::new(program, args.collect())
        .time_limit(self.timelimit)
        .memory_limit(self.memorylimit)
        .set_runner(self.runner)
        .set_stdin(self.fd_in)
        .set_stdout(self.fd_out)
        .set_stderr(self.fd_err)
        .set_ptrace(filter),
    )
  }

  pub fn into_option(self) -> Result<RunBoxOption, RunBoxError> {
    self.into_builder()?.build()
  }
}

#[cfg(test)]
mod tests {
  use nix::unistd::Uid;

  use super::*;

  #[test]
  fn it_should_parse_plain_request() {
    let config = RequestConfig::from_json(r#"{ "args": ["./main", "1"], "timelimit": 1000, "memorylimit": 65536 }"#)
      .unwrap();
    assert!(!config.trace);
    let option = config.into_option().unwrap();
    assert_eq!(option.program(), "./main");
    assert_eq!(option.arguments(), &vec!["1".to_string()]);
    assert_eq!(option.time_limit(), 1000);
    assert_eq!(option.memory_limit(), 65536);
    assert_eq!(option.stdin(), None);
    assert!(option.ptrace().is_none());
  }

  #[test]
  fn it_should_parse_traced_request() {
    let config = RequestConfig::from_json(
      r#"{
        "args": ["/bin/echo"], "fd_in": 3, "fd_out": 4, "fd_err": 5,
        "timelimit": 500, "memorylimit": 1024, "runner": 65534,
        "trace": true, "calls": [0, 1, 60], "files": { "/etc/ld.so.cache": 1, "/etc/passwd": 0 }
      }"#,
    )
    .unwrap();
    let option = config.into_option().unwrap();
    assert_eq!((option.stdin(), option.stdout(), option.stderr()), (Some(3), Some(4), Some(5)));
    assert_eq!(option.runner(), Some(Uid::from_raw(65534)));

    let filter = option.ptrace().as_ref().unwrap();
    assert!(filter.is_call_allowed(60));
    assert!(!filter.is_call_allowed(59));
    assert!(filter.is_file_allowed("/etc/ld.so.cache"));
    assert!(!filter.is_file_allowed("/etc/passwd"));
  }

  #[test]
  fn trace_requires_both_whitelists() {
    let config =
      RequestConfig::from_json(r#"{ "args": ["./main"], "timelimit": 1, "memorylimit": 1, "trace": true, "calls": [] }"#)
        .unwrap();
    assert!(matches!(config.into_option(), Err(RunBoxError::Config(_))));

    let config = RequestConfig::from_json(
      r#"{ "args": ["./main"], "timelimit": 1, "memorylimit": 1, "trace": true, "files": {} }"#,
    )
    .unwrap();
    assert!(matches!(config.filter(), Err(RunBoxError::Config(_))));
  }

  #[test]
  fn it_should_reject_broken_documents() {
    assert!(matches!(
      RequestConfig::from_json(r#"{ "args": ["./main"] }"#),
      Err(RunBoxError::Config(_))
    ));
    let config = RequestConfig::from_json(r#"{ "args": [], "timelimit": 1, "memorylimit": 1 }"#).unwrap();
    assert!(config.into_option().is_err());
  }
}

use log::info;

use crate::runbox::{spawn, Redirect};
use crate::trace::trace_loop;
use crate::verdict::{classify_signal, classify_usage, ExitKind};
use crate::{RunBoxError, RunBoxOption, RunBoxResult};

/// Run an untrusted program under its limits and classify how it ended.
///
/// Setup failures of the child (bad descriptor, failed exec, ...) come back as
/// `Err(RunBoxError::Setup)`, never as a verdict.
pub fn run(option: &RunBoxOption) -> Result<RunBoxResult, RunBoxError> {
  option.log_warnings();

  let tracing = option.ptrace().is_some();
  let mut child = spawn(option, Redirect::from_option(option), tracing)?;

  let result = match option.ptrace() {
    Some(filter) => trace_loop(option, filter, &mut child)?,
    None => {
      let (kind, usage) = child.wait_exit()?;
      match kind {
        ExitKind::Exited(status) => {
          info!("Child process #{}. exited with status {}", child.pid(), status);
          let verdict = classify_usage(usage.time(), usage.memory(), option.time_limit(), option.memory_limit());
          RunBoxResult::new(verdict, usage).with_status(status)
        }
        ExitKind::LimitSignal(signal) | ExitKind::Signaled(signal) => {
          info!("Child process #{}. is signaled by {}", child.pid(), signal);
          let verdict = classify_signal(signal, usage.memory(), option.memory_limit());
          RunBoxResult::new(verdict, usage).with_signal(signal)
        }
      }
    }
  };

  let result = result.floor_time(option.time_limit());
  info!(
    "Run {} finished: {} (time = {} ms, memory = {} KB)",
    option.label(),
    result.verdict().short_name(),
    result.time(),
    result.memory()
  );
  Ok(result)
}

pub use compile::{compile, COMPILE_DIAGNOSTIC_LIMIT, COMPILE_LIMIT_MESSAGE};
pub use run::run;
pub use special::{special_judge, SPECIAL_CRASH_MESSAGE, SPECIAL_DIAGNOSTIC_LIMIT};

use crate::verdict::ExitKind;
use crate::{RunBoxError, RunBoxOption};

mod compile;
mod run;
mod special;

/// Compiler and checker are trusted tools, they are never traced
fn reject_ptrace(option: &RunBoxOption, flow: &str) -> Result<(), RunBoxError> {
  if option.ptrace().is_some() {
    return Err(RunBoxError::config(format!(
      "{} of {} does not support syscall tracing",
      flow,
      option.label()
    )));
  }
  Ok(())
}

/// Used when a failed tool printed nothing
fn describe_exit(tool: &str, kind: ExitKind) -> String {
  match kind {
    ExitKind::Exited(code) => format!("{} exited with status {}", tool, code),
    ExitKind::LimitSignal(signal) | ExitKind::Signaled(signal) => format!("{} is killed by {}", tool, signal),
  }
}

use log::info;

use crate::context::FlowOutcome;
use crate::flow::{describe_exit, reject_ptrace};
use crate::runbox::{spawn, Redirect};
use crate::utils::{Capture, RunBoxPipe};
use crate::verdict::CheckerExit;
use crate::{RunBoxError, RunBoxOption};

/// Bytes of checker stdout kept as the diagnostic
pub const SPECIAL_DIAGNOSTIC_LIMIT: usize = 100;

/// Diagnostic of a checker killed by its limits
pub const SPECIAL_CRASH_MESSAGE: &str = "special judge crashed";

/// Run a special judge.
///
/// Exit 0 accepts the answer, exit 1 rejects it with the checker's stdout as the
/// explanation.
pub fn special_judge(option: &RunBoxOption) -> Result<FlowOutcome, RunBoxError> {
  reject_ptrace(option, "Special judge")?;
  option.log_warnings();

  let pipe = RunBoxPipe::capture()?;
  let redirect = Redirect {
    stdout: Some(pipe.write_fd()),
    ..Redirect::from_option(option)
  };
  let mut child = spawn(option, redirect, false)?;
  let capture = Capture::spawn(pipe.read()?.into_file(), SPECIAL_DIAGNOSTIC_LIMIT);

  let (kind, _) = child.wait_exit()?;

  let outcome = match CheckerExit::from(kind) {
    CheckerExit::Accepted => FlowOutcome::Success,
    CheckerExit::CheckerMismatch => FlowOutcome::Diagnostic(capture.finish()?.into_string()),
    CheckerExit::Crashed(signal) => {
      info!("Special judge {} is killed by {}", option.label(), signal);
      FlowOutcome::Diagnostic(SPECIAL_CRASH_MESSAGE.to_string())
    }
    CheckerExit::Abnormal(kind) => {
      let output = capture.finish()?;
      if output.is_empty() {
        FlowOutcome::Diagnostic(describe_exit("Special judge", kind))
      } else {
        FlowOutcome::Diagnostic(output.into_string())
      }
    }
  };

  info!("Special judge {} finished: success = {}", option.label(), outcome.is_success());
  Ok(outcome)
}

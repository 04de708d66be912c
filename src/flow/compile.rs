use log::{debug, info};

use crate::context::FlowOutcome;
use crate::flow::{describe_exit, reject_ptrace};
use crate::runbox::{spawn, Redirect};
use crate::utils::{Capture, RunBoxPipe};
use crate::verdict::CompileExit;
use crate::{RunBoxError, RunBoxOption};

/// Bytes of compiler stderr kept as the diagnostic
pub const COMPILE_DIAGNOSTIC_LIMIT: usize = 1000;

/// Diagnostic of a compiler killed by its limits
pub const COMPILE_LIMIT_MESSAGE: &str = "compile-time error";

/// Run a compiler, its stderr is captured as the diagnostic
pub fn compile(option: &RunBoxOption) -> Result<FlowOutcome, RunBoxError> {
  reject_ptrace(option, "Compile")?;
  option.log_warnings();

  let pipe = RunBoxPipe::capture()?;
  let redirect = Redirect {
    stderr: Some(pipe.write_fd()),
    ..Redirect::from_option(option)
  };
  let mut child = spawn(option, redirect, false)?;
  let capture = Capture::spawn(pipe.read()?.into_file(), COMPILE_DIAGNOSTIC_LIMIT);

  let (kind, usage) = child.wait_exit()?;
  debug!("Compiler {} used {} ms, {} KB", option.label(), usage.time(), usage.memory());

  let outcome = match CompileExit::from(kind) {
    CompileExit::Success => FlowOutcome::Success,
    // 被杀死时输出不完整，也可能还有子进程占着管道
    CompileExit::LimitExceeded(signal) => {
      info!("Compiler {} is killed by {}", option.label(), signal);
      FlowOutcome::Diagnostic(COMPILE_LIMIT_MESSAGE.to_string())
    }
    CompileExit::Failed(kind) => {
      let output = capture.finish()?;
      if output.is_empty() {
        FlowOutcome::Diagnostic(describe_exit("Compiler", kind))
      } else {
        FlowOutcome::Diagnostic(output.into_string())
      }
    }
  };

  info!("Compile {} finished: success = {}", option.label(), outcome.is_success());
  Ok(outcome)
}

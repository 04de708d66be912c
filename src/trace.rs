use log::{debug, info};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::context::Violation;
use crate::runbox::ChildProcess;
use crate::syscall::{entered_compat_table, Access, AccessChecker, PtraceTracee, SyscallFilter, SyscallRegisters};
use crate::usage::RunBoxUsage;
use crate::verdict::{classify_signal, classify_usage, Verdict};
use crate::{RunBoxError, RunBoxOption, RunBoxResult};

/// Where the traced child is in its syscall cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceState {
  /// Stopped by nothing yet, expecting the trap raised by exec
  WaitingForTrap,
  /// Running user code, next syscall stop is an entry
  Running,
  /// Inside an allowed syscall, next syscall stop is its exit
  InSyscall,
}

fn monitor_error(pid: Pid, action: &str, errno: Errno) -> RunBoxError {
  RunBoxError::monitor(format!("{} #{} fails: {}", action, pid, errno))
}

/// Resume until the next syscall stop; a vanished child is reported by the next wait
fn resume(pid: Pid) -> Result<(), RunBoxError> {
  match ptrace::syscall(pid, None) {
    Ok(()) | Err(Errno::ESRCH) => Ok(()),
    Err(errno) => Err(monitor_error(pid, "PTRACE_SYSCALL", errno)),
  }
}

fn violated(option: &RunBoxOption, usage: RunBoxUsage, violation: Violation) -> RunBoxResult {
  debug!("Run {} is killed by the access controller: {:?}", option.label(), violation);
  RunBoxResult::new(Verdict::RuntimeError, usage)
    .with_signal(Signal::SIGKILL)
    .with_violation(violation)
}

/// Drive a child launched with `PTRACE_TRACEME` until it terminates.
///
/// Every syscall entry is checked against `filter`; the first denied one kills
/// the child and the run is reported as a runtime error with the violation.
/// Only the launched process is traced: threads and children it creates are
/// not followed, so a strict whitelist leaves out `clone`, `fork` and `vfork`.
pub(crate) fn trace_loop(
  option: &RunBoxOption,
  filter: &SyscallFilter,
  child: &mut ChildProcess,
) -> Result<RunBoxResult, RunBoxError> {
  let pid = child.pid();
  let tracee = PtraceTracee::new(pid);
  let mut checker = AccessChecker::new(filter);
  let mut state = TraceState::WaitingForTrap;

  loop {
    let (status, usage) = child.wait()?;

    match status {
      WaitStatus::Exited(pid, status) => {
        info!("Child process #{}. exited with status {}", pid, status);
        let verdict = classify_usage(usage.time(), usage.memory(), option.time_limit(), option.memory_limit());
        return Ok(RunBoxResult::new(verdict, usage).with_status(status));
      }
      WaitStatus::Signaled(pid, signal, _) => {
        info!("Child process #{}. is signaled by {}", pid, signal);
        let verdict = classify_signal(signal, usage.memory(), option.memory_limit());
        return Ok(RunBoxResult::new(verdict, usage).with_signal(signal));
      }
      // exec 之后的第一个 SIGTRAP
      WaitStatus::Stopped(pid, Signal::SIGTRAP) if state == TraceState::WaitingForTrap => {
        debug!("Child process #{}. is trapped after exec", pid);
        let options = Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXEC | Options::PTRACE_O_EXITKILL;
        ptrace::setoptions(pid, options).map_err(|errno| monitor_error(pid, "PTRACE_SETOPTIONS", errno))?;
        state = TraceState::Running;
      }
      // 其它信号：超时、段错误等，直接结束
      WaitStatus::Stopped(pid, signal) => {
        info!("Child process #{}. is stopped by {}", pid, signal);
        let usage = child.kill()?;
        let verdict = classify_signal(signal, usage.memory(), option.memory_limit());
        return Ok(RunBoxResult::new(verdict, usage).with_signal(signal));
      }
      WaitStatus::PtraceSyscall(pid) => {
        if state == TraceState::InSyscall {
          state = TraceState::Running;
        } else {
          state = TraceState::InSyscall;

          let mut regs = match ptrace::getregs(pid) {
            Ok(regs) => SyscallRegisters::from(&regs),
            Err(Errno::ESRCH) => continue,
            Err(errno) => return Err(monitor_error(pid, "PTRACE_GETREGS", errno)),
          };
          if entered_compat_table(pid) == Some(true) {
            regs.compat = true;
          }

          match checker.check(&tracee, &regs)? {
            Access::Allowed => {}
            Access::DisallowedCall(id) => {
              info!("Child process #{}. is stopped for forbidden syscall (id = {})", pid, id);
              let usage = child.kill()?;
              return Ok(violated(option, usage, Violation::Syscall { id }));
            }
            Access::DisallowedFile { path, mode } => {
              info!(
                "Child process #{}. is stopped for forbidden file {} (last file = {:?})",
                pid,
                path,
                checker.last_file()
              );
              let usage = child.kill()?;
              return Ok(violated(option, usage, Violation::File { path, mode }));
            }
          }
        }
      }
      WaitStatus::PtraceEvent(pid, _, event) => {
        debug!("Child process #{}. reports ptrace event {}", pid, event);
      }
      WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
    }

    resume(pid)?;
  }
}

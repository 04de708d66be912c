use std::mem::MaybeUninit;
use std::os::unix::prelude::RawFd;
use std::ptr;

use log::{debug, error, info};
use nix::errno::Errno;
use nix::libc::{self, c_char, c_int};
use nix::sched::{clone, CloneFlags};
use nix::sys::ptrace;
use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{dup2, Pid};

use crate::error::SetupStage;
use crate::limit::LimitPlan;
use crate::usage::RunBoxUsage;
use crate::utils::pipe::write_failure;
use crate::utils::RunBoxPipe;
use crate::verdict::ExitKind;
use crate::{RunBoxError, RunBoxOption};

/// 子进程在 exec 之前使用的栈
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Targets of the child's standard streams, `None` keeps the inherited one
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Redirect {
  pub stdin: Option<RawFd>,
  pub stdout: Option<RawFd>,
  pub stderr: Option<RawFd>,
}

/// Everything the child needs, prepared before clone so the child never allocates
struct ChildSetup<'a> {
  argv: &'a [*const c_char],
  redirect: Redirect,
  limits: LimitPlan,
  runner: Option<libc::uid_t>,
  trace: bool,
  error_fd: RawFd,
}

/// A launched child; killed and reaped on drop unless it was already reaped
pub(crate) struct ChildProcess {
  pid: Pid,
  reaped: bool,
}

impl Redirect {
  pub fn from_option(option: &RunBoxOption) -> Self {
    Redirect {
      stdin: option.stdin(),
      stdout: option.stdout(),
      stderr: option.stderr(),
    }
  }
}

/// Report a setup failure through the private pipe and leave
fn abort_setup(fd: RawFd, stage: SetupStage, errno: Errno) -> ! {
  write_failure(fd, stage, errno);
  unsafe { libc::_exit(1) }
}

/// Child side, strictly ordered: redirect, limit, drop privilege, trace, exec
fn child_main(setup: &ChildSetup) -> isize {
  // Rust 运行时忽略了 SIGPIPE，恢复默认行为
  unsafe {
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
  }
  let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

  // 重定向输入输出
  let streams = [
    (setup.redirect.stdin, libc::STDIN_FILENO, SetupStage::RedirectStdin),
    (setup.redirect.stdout, libc::STDOUT_FILENO, SetupStage::RedirectStdout),
    (setup.redirect.stderr, libc::STDERR_FILENO, SetupStage::RedirectStderr),
  ];
  for (fd, target, stage) in streams {
    if let Some(fd) = fd {
      if let Err(errno) = dup2(fd, target) {
        abort_setup(setup.error_fd, stage, errno);
      }
    }
  }

  // setrlimit + setitimer
  if let Err((stage, errno)) = setup.limits.apply() {
    abort_setup(setup.error_fd, stage, errno);
  }

  // 修改运行用户；只影响当前任务，不走 glibc 的多线程广播
  if let Some(uid) = setup.runner {
    let result = unsafe { libc::syscall(libc::SYS_setuid, uid) };
    if result == -1 {
      abort_setup(setup.error_fd, SetupStage::SetUid, Errno::last());
    }
  }

  // 启动 ptrace 追踪
  if setup.trace {
    if let Err(errno) = ptrace::traceme() {
      abort_setup(setup.error_fd, SetupStage::TraceMe, errno);
    }
  }

  unsafe {
    libc::execvp(setup.argv[0], setup.argv.as_ptr());
  }
  abort_setup(setup.error_fd, SetupStage::Exec, Errno::last())
}

/// Launch the command of `option`.
///
/// The parent stays suspended until the child has exec'd or exited, so the
/// setup error pipe can be read without blocking right after clone returns.
pub(crate) fn spawn(option: &RunBoxOption, redirect: Redirect, trace: bool) -> Result<ChildProcess, RunBoxError> {
  let argv = option.argv()?;
  let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
  argv_ptrs.push(ptr::null());

  let pipe = RunBoxPipe::new()?;
  let setup = ChildSetup {
    argv: &argv_ptrs,
    redirect,
    limits: LimitPlan::new(option.time_limit(), option.memory_limit()),
    runner: option.runner().map(|uid| uid.as_raw()),
    trace,
    error_fd: pipe.write_fd(),
  };
  debug!("Limits of {}: {:?}", option.label(), setup.limits);

  let mut stack = vec![0u8; CHILD_STACK_SIZE];
  let child_cb: Box<dyn FnMut() -> isize + '_> = Box::new(|| child_main(&setup));
  let flags = CloneFlags::CLONE_VM | CloneFlags::CLONE_VFORK;
  let pid = unsafe { clone(child_cb, &mut stack, flags, Some(libc::SIGCHLD)) }
    .map_err(|errno| RunBoxError::fork(format!("clone fails: {}", errno)))?;
  let mut child = ChildProcess { pid, reaped: false };

  let pipe = pipe.read()?;
  if let Some(failure) = pipe.read_failure()? {
    error!("Child process #{} setup fails: {}", pid, failure);
    child.wait()?;
    return Err(failure.into());
  }

  info!("Start running {} (pid = {})", option.label(), pid);
  Ok(child)
}

/// `wait4` on one child, restarting on EINTR
fn wait4(pid: Pid) -> Result<(WaitStatus, RunBoxUsage), RunBoxError> {
  loop {
    let mut status: c_int = 0;
    let mut usage = MaybeUninit::<libc::rusage>::zeroed();
    let result = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, usage.as_mut_ptr()) };
    match Errno::result(result) {
      Ok(_) => {
        let status = WaitStatus::from_raw(pid, status)?;
        let usage = unsafe { usage.assume_init() };
        return Ok((status, RunBoxUsage::from(usage)));
      }
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(RunBoxError::monitor(format!("wait4 #{} fails: {}", pid, errno))),
    }
  }
}

impl ChildProcess {
  pub fn pid(&self) -> Pid {
    self.pid
  }

  /// Wait for the next state change
  pub fn wait(&mut self) -> Result<(WaitStatus, RunBoxUsage), RunBoxError> {
    let (status, usage) = wait4(self.pid)?;
    if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
      self.reaped = true;
    }
    Ok((status, usage))
  }

  /// Wait until the child terminates
  pub fn wait_exit(&mut self) -> Result<(ExitKind, RunBoxUsage), RunBoxError> {
    loop {
      let (status, usage) = self.wait()?;
      if let Some(kind) = ExitKind::from_wait(status) {
        return Ok((kind, usage));
      }
      debug!("Child process #{} changed state: {:?}", self.pid, status);
    }
  }

  /// Kill and reap the child, returning its final usage
  pub fn kill(&mut self) -> Result<RunBoxUsage, RunBoxError> {
    match signal::kill(self.pid, Signal::SIGKILL) {
      Ok(()) | Err(Errno::ESRCH) => {}
      Err(errno) => return Err(RunBoxError::monitor(format!("kill #{} fails: {}", self.pid, errno))),
    }
    loop {
      let (status, usage) = self.wait()?;
      if self.reaped {
        debug!("Child process #{} is killed: {:?}", self.pid, status);
        return Ok(usage);
      }
    }
  }
}

impl Drop for ChildProcess {
  fn drop(&mut self) {
    if !self.reaped {
      error!("Kill child process #{} left running", self.pid);
      let _ = self.kill();
    }
  }
}

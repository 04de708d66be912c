use std::fs::File;
use std::mem;
use std::os::unix::prelude::{FromRawFd, RawFd};

use nix::{
  errno::Errno,
  fcntl::OFlag,
  libc::{self, c_void},
  unistd::{self, close, pipe2},
};

use crate::error::{RunBoxError, SetupFailure, SetupStage};

/// Size of one setup failure record: 1 stage byte + 4 errno bytes
const RECORD_SIZE: usize = 5;

/// Both ends of a pipe, owned until one side is chosen
pub struct RunBoxPipe(RawFd, RawFd);

pub struct RunBoxReadPipe(RawFd);

impl RunBoxPipe {
  /// 子进程启动失败时使用的私有管道，父进程非阻塞读取
  pub fn new() -> Result<Self, RunBoxError> {
    Self::with_flags(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
  }

  /// Blocking pipe used to capture the output stream of a compiler or checker
  pub fn capture() -> Result<Self, RunBoxError> {
    Self::with_flags(OFlag::O_CLOEXEC)
  }

  /// Pipe creation is part of the launch, its failure is a setup error
  fn with_flags(flags: OFlag) -> Result<Self, RunBoxError> {
    let (read_fd, write_fd) = pipe2(flags).map_err(|errno| RunBoxError::fork(format!("pipe2 fails: {}", errno)))?;
    Ok(RunBoxPipe(read_fd, write_fd))
  }

  pub fn write_fd(&self) -> RawFd {
    self.1
  }

  /// Keep the read end, close the write end
  pub fn read(self) -> Result<RunBoxReadPipe, RunBoxError> {
    let (read_fd, write_fd) = (self.0, self.1);
    mem::forget(self);
    if let Err(errno) = close(write_fd) {
      let _ = close(read_fd);
      return Err(errno.into());
    }
    Ok(RunBoxReadPipe(read_fd))
  }
}

impl Drop for RunBoxPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
    let _ = close(self.1);
  }
}

impl RunBoxReadPipe {
  /// Read a setup failure record, `None` means the child reached exec
  pub fn read_failure(&self) -> Result<Option<SetupFailure>, RunBoxError> {
    let mut buf = [0u8; RECORD_SIZE];
    match unistd::read(self.0, &mut buf) {
      Ok(0) | Err(Errno::EAGAIN) => Ok(None),
      Ok(size) => decode_failure(&buf[..size])
        .map(Some)
        .ok_or_else(|| RunBoxError::monitor("Malformed setup failure record")),
      Err(errno) => Err(errno.into()),
    }
  }

  pub fn into_file(self) -> File {
    let fd = self.0;
    mem::forget(self);
    unsafe { File::from_raw_fd(fd) }
  }
}

impl Drop for RunBoxReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

/// Write a setup failure record from the child, without allocating
pub(crate) fn write_failure(fd: RawFd, stage: SetupStage, errno: Errno) {
  let code = (errno as i32).to_ne_bytes();
  let record = [stage as u8, code[0], code[1], code[2], code[3]];
  unsafe {
    libc::write(fd, record.as_ptr() as *const c_void, record.len());
  }
}

pub(crate) fn decode_failure(bytes: &[u8]) -> Option<SetupFailure> {
  if bytes.len() != RECORD_SIZE {
    return None;
  }
  let stage = SetupStage::from_u8(bytes[0])?;
  let code = i32::from_ne_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
  Some(SetupFailure {
    stage,
    errno: Errno::from_i32(code),
  })
}

use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::Record;
use nix::libc::uid_t;

pub use buffer::{BoundedBuffer, Capture};
pub use pipe::{RunBoxPipe, RunBoxReadPipe};

use crate::RunBoxError;

pub mod buffer;
pub mod pipe;

/// Unit: ms
pub type TimeLimitType = u64;

/// Unit: KB
pub type MemoryLimitType = u64;

pub type UidType = uid_t;

pub type SyscallId = u64;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from conf.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string(string: &str) -> Result<CString, RunBoxError> {
  CString::new(string)
    .map_err(|_| RunBoxError::config(format!("Argument {:?} contains a NUL byte", string)))
}

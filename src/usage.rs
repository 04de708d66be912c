use nix::libc::{rusage, timeval};

use crate::utils::{MemoryLimitType, TimeLimitType};

/// Resource usage of one reaped (or stopped) child, as reported by `wait4`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunBoxUsage {
  time_user: TimeLimitType,
  time_sys: TimeLimitType,
  memory: MemoryLimitType,
}

fn milliseconds(time: &timeval) -> TimeLimitType {
  let ms = time.tv_sec as i64 * 1000 + time.tv_usec as i64 / 1000;
  ms.max(0) as TimeLimitType
}

impl RunBoxUsage {
  pub fn new(time_user: TimeLimitType, time_sys: TimeLimitType, memory: MemoryLimitType) -> Self {
    RunBoxUsage {
      time_user,
      time_sys,
      memory,
    }
  }

  /// user + sys, unit: ms
  pub fn time(&self) -> TimeLimitType {
    self.time_user + self.time_sys
  }

  pub fn time_user(&self) -> TimeLimitType {
    self.time_user
  }

  pub fn time_sys(&self) -> TimeLimitType {
    self.time_sys
  }

  /// Peak resident set size, unit: KB
  pub fn memory(&self) -> MemoryLimitType {
    self.memory
  }
}

impl From<rusage> for RunBoxUsage {
  fn from(usage: rusage) -> Self {
    // Linux 下 ru_maxrss 的单位已经是 KB
    RunBoxUsage {
      time_user: milliseconds(&usage.ru_utime),
      time_sys: milliseconds(&usage.ru_stime),
      memory: usage.ru_maxrss.max(0) as MemoryLimitType,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::mem::MaybeUninit;

  use super::*;

  #[test]
  fn it_should_convert_rusage() {
    let mut usage: rusage = unsafe { MaybeUninit::zeroed().assume_init() };
    usage.ru_utime.tv_sec = 1;
    usage.ru_utime.tv_usec = 250_999;
    usage.ru_stime.tv_usec = 30_000;
    usage.ru_maxrss = 2048;

    let usage = RunBoxUsage::from(usage);
    assert_eq!(usage.time_user(), 1250);
    assert_eq!(usage.time_sys(), 30);
    assert_eq!(usage.time(), 1280);
    assert_eq!(usage.memory(), 2048);
  }
}

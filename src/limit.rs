use std::ptr;

use nix::errno::Errno;
use nix::libc::{self, itimerval, rlim_t, timeval};
use nix::sys::resource::{setrlimit, Resource};

use crate::error::SetupStage;
use crate::utils::{MemoryLimitType, TimeLimitType};

const MB: rlim_t = 1024 * 1024;

/// 栈空间固定 256 MB，不随请求变化
const STACK_SIZE: rlim_t = 256 * MB;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RLimitPair {
  pub soft: rlim_t,
  pub hard: rlim_t,
}

/// Limits applied to the child right before exec.
///
/// The OS ceilings are looser than the judged limits: the verdict is still
/// computed against the configured time and memory limit after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPlan {
  cpu: RLimitPair,
  data: RLimitPair,
  address_space: RLimitPair,
  stack: RLimitPair,
  watchdog: i64,
}

impl RLimitPair {
  fn padded(soft: rlim_t, padding: rlim_t) -> Self {
    RLimitPair {
      soft,
      hard: soft.saturating_add(padding),
    }
  }
}

impl LimitPlan {
  /// time_limit: ms, memory_limit: KB
  pub fn new(time_limit: TimeLimitType, memory_limit: MemoryLimitType) -> Self {
    // CPU 时间向上取整到秒，余数超过 800ms 再多给一秒
    let mut cpu = time_limit / 1000 + u64::from(time_limit % 1000 != 0);
    if time_limit % 1000 > 800 {
      cpu += 1;
    }

    let memory = memory_limit.saturating_mul(1024);

    LimitPlan {
      cpu: RLimitPair::padded(cpu, 1),
      data: RLimitPair::padded(memory, MB),
      address_space: RLimitPair::padded(memory.saturating_mul(2), MB),
      stack: RLimitPair::padded(STACK_SIZE, MB),
      watchdog: (time_limit / 1000 + 2) as i64,
    }
  }

  /// Unit: seconds
  pub fn cpu(&self) -> RLimitPair {
    self.cpu
  }

  /// Unit: bytes
  pub fn data(&self) -> RLimitPair {
    self.data
  }

  /// Unit: bytes
  pub fn address_space(&self) -> RLimitPair {
    self.address_space
  }

  /// Unit: bytes
  pub fn stack(&self) -> RLimitPair {
    self.stack
  }

  /// Interval of the repeating real-time timer, unit: seconds
  pub fn watchdog(&self) -> i64 {
    self.watchdog
  }

  /// Apply every limit to the calling process.
  ///
  /// Runs in the child between clone and exec, so it must not allocate.
  pub(crate) fn apply(&self) -> Result<(), (SetupStage, Errno)> {
    let limits = [
      (Resource::RLIMIT_CPU, self.cpu, SetupStage::LimitCpu),
      (Resource::RLIMIT_DATA, self.data, SetupStage::LimitData),
      (Resource::RLIMIT_AS, self.address_space, SetupStage::LimitAddressSpace),
      (Resource::RLIMIT_STACK, self.stack, SetupStage::LimitStack),
    ];
    for (resource, pair, stage) in limits {
      setrlimit(resource, pair.soft, pair.hard).map_err(|errno| (stage, errno))?;
    }

    // 设置实际运行时间限制，防止 sleep 或阻塞 IO 卡评测
    let interval = timeval {
      tv_sec: self.watchdog as libc::time_t,
      tv_usec: 0,
    };
    let timer = itimerval {
      it_interval: interval,
      it_value: interval,
    };
    let result = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };
    Errno::result(result).map_err(|errno| (SetupStage::Watchdog, errno))?;

    Ok(())
  }
}

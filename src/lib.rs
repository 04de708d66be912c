pub use check::{compare, compare_files};
pub use config::RequestConfig;
pub use context::{ConfigWarning, FlowOutcome, Report, RunBoxBuilder, RunBoxOption, RunBoxResult, Violation};
pub use error::{RunBoxError, RunBoxExit, SetupFailure, SetupStage};
pub use flow::{
  compile, run, special_judge, COMPILE_DIAGNOSTIC_LIMIT, COMPILE_LIMIT_MESSAGE, SPECIAL_CRASH_MESSAGE,
  SPECIAL_DIAGNOSTIC_LIMIT,
};
pub use limit::LimitPlan;
pub use syscall::{Access, AccessChecker, SyscallFilter};
pub use usage::RunBoxUsage;
pub use verdict::Verdict;

mod check;
mod config;
mod context;
mod error;
mod flow;
pub mod limit;
mod runbox;
pub mod syscall;
mod trace;
mod usage;
pub mod utils;
pub mod verdict;

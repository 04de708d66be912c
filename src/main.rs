use std::env;
use std::fs::{File, OpenOptions};
use std::os::unix::prelude::AsRawFd;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::info;

use runbox::utils::{default_format, MemoryLimitType, SyscallId, TimeLimitType, UidType};
use runbox::{
  compare_files, compile, run, special_judge, Report, RequestConfig, RunBoxBuilder, RunBoxError, RunBoxExit,
  RunBoxOption, SyscallFilter,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short, long, default_value_t = 1000, help = "Time limit (unit: ms)")]
  time: TimeLimitType,

  #[arg(short, long, default_value_t = 262144, help = "Memory limit (unit: KB)")]
  memory: MemoryLimitType,

  #[arg(short, long, help = "Run as this uid")]
  runner: Option<UidType>,

  #[arg(long, help = "Redirect stdin from this file")]
  stdin: Option<PathBuf>,

  #[arg(long, help = "Redirect stdout to this file")]
  stdout: Option<PathBuf>,

  #[arg(long, help = "Redirect stderr to this file")]
  stderr: Option<PathBuf>,

  #[arg(long, help = "Read the execution request from a JSON document")]
  config: Option<PathBuf>,

  #[arg(long, default_value_t = false)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run user program")]
  Run {
    #[arg(help = "Program")]
    program: Option<String>,

    #[arg(help = "Arguments", trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,

    #[arg(long, default_value_t = false, help = "Trace syscalls with the whitelists below")]
    trace: bool,

    #[arg(long, value_delimiter = ',', help = "Allowed syscall numbers")]
    calls: Option<Vec<SyscallId>>,

    #[arg(long, value_delimiter = ',', help = "Allowed file paths")]
    files: Option<Vec<String>>,
  },

  #[command(about = "Compile user code")]
  Compile {
    #[arg(help = "Compiler")]
    compiler: Option<String>,

    #[arg(help = "Arguments", trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
  },

  #[command(about = "Run special judge")]
  Special {
    #[arg(help = "Checker")]
    checker: Option<String>,

    #[arg(help = "Arguments", trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
  },

  #[command(about = "Compare two files byte by byte")]
  Check {
    #[arg(help = "Expected output")]
    expected: PathBuf,

    #[arg(help = "Actual output")]
    actual: PathBuf,
  },
}

/// Files opened for redirection, kept open until the child finished
struct Streams {
  stdin: Option<File>,
  stdout: Option<File>,
  stderr: Option<File>,
}

impl Streams {
  fn open(cli: &Cli) -> Result<Self, RunBoxError> {
    let create = |path: &PathBuf| {
      OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| RunBoxError::cli(format!("Can not open {}: {}", path.to_string_lossy(), err)))
    };
    let stdin = match &cli.stdin {
      Some(path) => Some(
        File::open(path).map_err(|err| RunBoxError::cli(format!("Can not open {}: {}", path.to_string_lossy(), err)))?,
      ),
      None => None,
    };
    Ok(Streams {
      stdin,
      stdout: cli.stdout.as_ref().map(create).transpose()?,
      stderr: cli.stderr.as_ref().map(create).transpose()?,
    })
  }

  fn apply(&self, builder: RunBoxBuilder) -> RunBoxBuilder {
    let mut builder = builder;
    if let Some(file) = &self.stdin {
      builder = builder.stdin(file.as_raw_fd());
    }
    if let Some(file) = &self.stdout {
      builder = builder.stdout(file.as_raw_fd());
    }
    if let Some(file) = &self.stderr {
      builder = builder.stderr(file.as_raw_fd());
    }
    builder
  }
}

impl Cli {
  /// Build the request from `--config` or from the command line
  fn resolve(
    &self,
    streams: &Streams,
    program: &Option<String>,
    arguments: &[String],
    filter: Option<SyscallFilter>,
  ) -> Result<RunBoxOption, RunBoxError> {
    let builder = match &self.config {
      Some(path) => {
        info!("Read execution request from {}", path.to_string_lossy());
        RequestConfig::from_file(path)?.into_builder()?
      }
      None => {
        let program = program
          .clone()
          .ok_or_else(|| RunBoxError::cli("Program should be given without --config"))?;
        RunBoxBuilder::new(program, arguments.to_vec())
          .time_limit(self.time)
          .memory_limit(self.memory)
          .set_runner(self.runner)
          .set_ptrace(filter)
      }
    };
    streams.apply(builder).build()
  }
}

fn trace_filter(
  trace: bool,
  calls: &Option<Vec<SyscallId>>,
  files: &Option<Vec<String>>,
) -> Result<Option<SyscallFilter>, RunBoxError> {
  if !trace {
    return Ok(None);
  }
  match (calls, files) {
    (Some(calls), Some(files)) => Ok(Some(SyscallFilter::new(
      calls.iter().copied(),
      files.iter().map(|path| (path.clone(), true)),
    ))),
    _ => Err(RunBoxError::cli("--trace requires both --calls and --files")),
  }
}

fn start() -> Result<(), RunBoxError> {
  let cli = Cli::parse();

  let _logger = Logger::try_with_str(if cli.verbose { "runbox=debug" } else { "runbox=info" })?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("runbox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .print_message()
    .start()?;

  info!("Start running runbox");

  match &cli.command {
    Commands::Run {
      program,
      arguments,
      trace,
      calls,
      files,
    } => {
      let filter = trace_filter(*trace, calls, files)?;
      let streams = Streams::open(&cli)?;
      let option = cli.resolve(&streams, program, arguments, filter)?;
      run(&option)?.report();
    }
    Commands::Compile { compiler, arguments } => {
      let streams = Streams::open(&cli)?;
      let option = cli.resolve(&streams, compiler, arguments, None)?;
      compile(&option)?.report();
    }
    Commands::Special { checker, arguments } => {
      let streams = Streams::open(&cli)?;
      let option = cli.resolve(&streams, checker, arguments, None)?;
      special_judge(&option)?.report();
    }
    Commands::Check { expected, actual } => {
      let same = compare_files(expected, actual)?;
      info!("Compare {} with {}: {}", expected.to_string_lossy(), actual.to_string_lossy(), same);
      println!("{}", serde_json::json!({ "ok": true, "same": same }));
    }
  }

  info!("Running runbox finished");

  Ok(())
}

fn main() -> RunBoxExit {
  match start() {
    Ok(_) => RunBoxExit::Ok,
    Err(err) => RunBoxExit::Err(err),
  }
}

use std::collections::{HashMap, HashSet};
use std::fs::read_link;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::debug;
use nix::errno::Errno;
use nix::libc::{
  self, user_regs_struct, SYS_clone, SYS_clone3, SYS_creat, SYS_execve, SYS_execveat, SYS_fork, SYS_open, SYS_openat,
  SYS_openat2, SYS_vfork,
};
use nix::sys::ptrace;
use nix::unistd::Pid;
use path_absolutize::Absolutize;

use crate::utils::SyscallId;
use crate::RunBoxError;

/// Longest path read from the tracee
const PATH_MAX: usize = 4096;

/// Code segment selector of 32-bit user code
const USER32_CS: u64 = 0x23;

const PTRACE_GET_SYSCALL_INFO: libc::c_uint = 0x420e;

const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

/// Syscalls creating a process or thread the trace loop does not follow
const SPAWN_SYSCALLS: [libc::c_long; 4] = [SYS_clone, SYS_clone3, SYS_fork, SYS_vfork];

/// Where the path, directory fd and open flags of a file syscall live
#[derive(Debug, Clone, Copy)]
struct FileArgs {
  dirfd: Option<usize>,
  path: usize,
  flags: FlagsArg,
}

#[derive(Debug, Clone, Copy)]
enum FlagsArg {
  Register(usize),
  Fixed(u64),
  /// `flags` is the first field of the `struct open_how` pointed to by this register
  OpenHow(usize),
}

lazy_static! {
  /// 需要检查文件路径的系统调用
  static ref FILE_SYSCALLS: HashMap<SyscallId, FileArgs> = {
    let mut map = HashMap::new();
    map.insert(
      SYS_open as SyscallId,
      FileArgs { dirfd: None, path: 0, flags: FlagsArg::Register(1) },
    );
    map.insert(
      SYS_openat as SyscallId,
      FileArgs { dirfd: Some(0), path: 1, flags: FlagsArg::Register(2) },
    );
    map.insert(
      SYS_creat as SyscallId,
      FileArgs {
        dirfd: None,
        path: 0,
        flags: FlagsArg::Fixed((libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC) as u64),
      },
    );
    map.insert(
      SYS_openat2 as SyscallId,
      FileArgs { dirfd: Some(0), path: 1, flags: FlagsArg::OpenHow(2) },
    );
    map.insert(
      SYS_execve as SyscallId,
      FileArgs { dirfd: None, path: 0, flags: FlagsArg::Fixed(libc::O_RDONLY as u64) },
    );
    map.insert(
      SYS_execveat as SyscallId,
      FileArgs { dirfd: Some(0), path: 1, flags: FlagsArg::Register(4) },
    );
    map
  };
}

/// Syscall whitelist and file whitelist of one traced run
#[derive(Debug, Clone, Default)]
pub struct SyscallFilter {
  calls: HashSet<SyscallId>,
  files: HashMap<String, bool>,
}

/// Decision of the access controller for one syscall entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
  Allowed,
  DisallowedCall(SyscallId),
  DisallowedFile { path: String, mode: u64 },
}

/// Syscall number and argument registers at a syscall-entry stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallRegisters {
  pub id: SyscallId,
  pub args: [u64; 6],
  /// Entered through the i386 table (`int $0x80`), `id` is not an x86_64 number
  pub compat: bool,
}

/// Memory and filesystem view of a stopped tracee
pub trait Tracee {
  /// Read a NUL-terminated string at `addr`
  fn read_string(&self, addr: u64) -> Result<Option<String>, RunBoxError>;

  /// Read one machine word at `addr`
  fn read_word(&self, addr: u64) -> Result<Option<u64>, RunBoxError>;

  fn cwd(&self) -> Option<PathBuf>;

  fn fd_path(&self, fd: i32) -> Option<PathBuf>;
}

/// Tracee backed by `PTRACE_PEEKDATA` and `/proc`
pub struct PtraceTracee(Pid);

/// Access check state confined to one trace loop
pub struct AccessChecker<'a> {
  filter: &'a SyscallFilter,
  last_file: Option<String>,
}

impl SyscallFilter {
  pub fn new<C, F, P>(calls: C, files: F) -> Self
  where
    C: IntoIterator<Item = SyscallId>,
    F: IntoIterator<Item = (P, bool)>,
    P: Into<String>,
  {
    SyscallFilter {
      calls: calls.into_iter().collect(),
      files: files.into_iter().map(|(path, allow)| (path.into(), allow)).collect(),
    }
  }

  pub fn allow_call(&mut self, id: SyscallId) -> &mut Self {
    self.calls.insert(id);
    self
  }

  pub fn forbid_call(&mut self, id: SyscallId) -> &mut Self {
    self.calls.remove(&id);
    self
  }

  pub fn allow_file<PS: Into<String>>(&mut self, path: PS) -> &mut Self {
    self.files.insert(path.into(), true);
    self
  }

  pub fn forbid_file<PS: Into<String>>(&mut self, path: PS) -> &mut Self {
    self.files.insert(path.into(), false);
    self
  }

  pub fn is_call_allowed(&self, id: SyscallId) -> bool {
    self.calls.contains(&id)
  }

  pub fn is_file_allowed(&self, path: &str) -> bool {
    self.files.get(path).copied().unwrap_or(false)
  }

  pub fn calls(&self) -> &HashSet<SyscallId> {
    &self.calls
  }

  pub fn files(&self) -> &HashMap<String, bool> {
    &self.files
  }

  /// Whether the whitelist lets the program create threads or processes
  pub fn allows_spawning(&self) -> bool {
    SPAWN_SYSCALLS.iter().any(|id| self.is_call_allowed(*id as SyscallId))
  }
}

impl From<&user_regs_struct> for SyscallRegisters {
  fn from(regs: &user_regs_struct) -> Self {
    SyscallRegisters {
      id: regs.orig_rax,
      args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
      compat: regs.cs == USER32_CS,
    }
  }
}

/// Ask the kernel which syscall table the stopped tracee entered.
///
/// `int $0x80` from 64-bit code keeps the 64-bit code segment, only the audit
/// arch tells it apart. `None` when the kernel is older than 5.3.
pub(crate) fn entered_compat_table(pid: Pid) -> Option<bool> {
  let mut info = [0u8; 88];
  let size = unsafe { libc::ptrace(PTRACE_GET_SYSCALL_INFO, pid.as_raw(), info.len(), info.as_mut_ptr()) };
  if size < 8 {
    return None;
  }
  let arch = u32::from_ne_bytes([info[4], info[5], info[6], info[7]]);
  Some(arch != AUDIT_ARCH_X86_64)
}

impl PtraceTracee {
  pub fn new(pid: Pid) -> Self {
    PtraceTracee(pid)
  }
}

impl Tracee for PtraceTracee {
  fn read_string(&self, mut addr: u64) -> Result<Option<String>, RunBoxError> {
    // 按字对齐读取
    const ALIGNMENT: u64 = 0x7;
    let mut buf = Vec::<u8>::with_capacity(256);
    let mut offset = (addr & ALIGNMENT) as usize;
    addr &= !ALIGNMENT;
    while buf.len() < PATH_MAX {
      match ptrace::read(self.0, addr as ptrace::AddressType) {
        Ok(word) => {
          let bytes = word.to_ne_bytes();
          let bytes = &bytes[offset..];
          match bytes.iter().position(|b| *b == 0) {
            Some(end) => {
              buf.extend_from_slice(&bytes[..end]);
              return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
            }
            None => buf.extend_from_slice(bytes),
          }
          offset = 0;
          addr += 8;
        }
        Err(Errno::ESRCH) => {
          return Err(RunBoxError::monitor(format!("Process #{} vanished while reading memory", self.0)));
        }
        Err(_) => return Ok(None),
      }
    }
    Ok(None)
  }

  fn read_word(&self, addr: u64) -> Result<Option<u64>, RunBoxError> {
    match ptrace::read(self.0, addr as ptrace::AddressType) {
      Ok(word) => Ok(Some(word as u64)),
      Err(Errno::ESRCH) => Err(RunBoxError::monitor(format!("Process #{} vanished while reading memory", self.0))),
      Err(_) => Ok(None),
    }
  }

  fn cwd(&self) -> Option<PathBuf> {
    read_link(format!("/proc/{}/cwd", self.0)).ok()
  }

  fn fd_path(&self, fd: i32) -> Option<PathBuf> {
    read_link(format!("/proc/{}/fd/{}", self.0, fd)).ok()
  }
}

impl<'a> AccessChecker<'a> {
  pub fn new(filter: &'a SyscallFilter) -> Self {
    AccessChecker {
      filter,
      last_file: None,
    }
  }

  /// The path resolved by the latest file-accessing syscall
  pub fn last_file(&self) -> Option<&str> {
    self.last_file.as_deref()
  }

  /// Check one syscall entry
  pub fn check<T: Tracee>(&mut self, tracee: &T, regs: &SyscallRegisters) -> Result<Access, RunBoxError> {
    // i386 编号与 x86_64 不同，白名单无法判断，一律拒绝
    if regs.compat {
      debug!("Forbidden i386 syscall (id = {})", regs.id);
      return Ok(Access::DisallowedCall(regs.id));
    }
    if !self.filter.is_call_allowed(regs.id) {
      return Ok(Access::DisallowedCall(regs.id));
    }

    let args = match FILE_SYSCALLS.get(&regs.id) {
      Some(args) => *args,
      None => return Ok(Access::Allowed),
    };

    let addr = regs.args[args.path];
    let path = tracee
      .read_string(addr)?
      .unwrap_or_else(|| format!("<unreadable 0x{:x}>", addr));
    let mode = match args.flags {
      FlagsArg::Register(index) => regs.args[index],
      FlagsArg::Fixed(flags) => flags,
      FlagsArg::OpenHow(index) => tracee.read_word(regs.args[index])?.unwrap_or(0),
    };
    self.last_file = Some(path.clone());

    if self.is_path_allowed(tracee, &args, regs, &path) {
      Ok(Access::Allowed)
    } else {
      debug!("Forbidden file access {} (mode = {:#o})", path, mode);
      Ok(Access::DisallowedFile { path, mode })
    }
  }

  fn is_path_allowed<T: Tracee>(&self, tracee: &T, args: &FileArgs, regs: &SyscallRegisters, path: &str) -> bool {
    if self.filter.is_file_allowed(path) {
      return true;
    }
    let raw = Path::new(path);
    if path.is_empty() || raw.is_absolute() {
      return false;
    }

    // 相对路径：相对于 cwd 或 dirfd 指向的目录
    let dirfd = args.dirfd.map(|index| regs.args[index] as i32);
    let base = match dirfd {
      Some(fd) if fd != libc::AT_FDCWD => tracee.fd_path(fd),
      _ => tracee.cwd(),
    };
    let absolute = base.and_then(|base| raw.absolutize_from(base.as_path()).ok().map(|p| p.into_owned()));
    match absolute {
      Some(absolute) => absolute
        .to_str()
        .map(|absolute| self.filter.is_file_allowed(absolute))
        .unwrap_or(false),
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct FakeTracee {
    strings: HashMap<u64, String>,
    words: HashMap<u64, u64>,
    cwd: PathBuf,
  }

  impl Tracee for FakeTracee {
    fn read_string(&self, addr: u64) -> Result<Option<String>, RunBoxError> {
      Ok(self.strings.get(&addr).cloned())
    }

    fn read_word(&self, addr: u64) -> Result<Option<u64>, RunBoxError> {
      Ok(self.words.get(&addr).copied())
    }

    fn cwd(&self) -> Option<PathBuf> {
      Some(self.cwd.clone())
    }

    fn fd_path(&self, fd: i32) -> Option<PathBuf> {
      if fd == 7 {
        Some(PathBuf::from("/data"))
      } else {
        None
      }
    }
  }

  fn tracee() -> FakeTracee {
    let mut strings = HashMap::new();
    strings.insert(0x1000, "/etc/ld.so.cache".to_string());
    strings.insert(0x2000, "/etc/passwd".to_string());
    strings.insert(0x3000, "input.txt".to_string());
    strings.insert(0x4000, "/bin/sh".to_string());
    let mut words = HashMap::new();
    // struct open_how { flags = O_RDWR, .. }
    words.insert(0x5000, libc::O_RDWR as u64);
    FakeTracee {
      strings,
      words,
      cwd: PathBuf::from("/work"),
    }
  }

  fn regs(id: libc::c_long, args: [u64; 6]) -> SyscallRegisters {
    SyscallRegisters {
      id: id as SyscallId,
      args,
      compat: false,
    }
  }

  fn filter() -> SyscallFilter {
    SyscallFilter::new(
      vec![libc::SYS_read as SyscallId, SYS_open as SyscallId, SYS_openat as SyscallId],
      vec![("/etc/ld.so.cache", true), ("/etc/passwd", false), ("/work/input.txt", true)],
    )
  }

  #[test]
  fn it_should_forbid_unlisted_call() {
    let filter = filter();
    let mut checker = AccessChecker::new(&filter);
    let access = checker.check(&tracee(), &regs(libc::SYS_write, [0; 6])).unwrap();
    assert_eq!(access, Access::DisallowedCall(libc::SYS_write as SyscallId));
    assert_eq!(checker.last_file(), None);
  }

  #[test]
  fn it_should_allow_listed_call() {
    let filter = filter();
    let mut checker = AccessChecker::new(&filter);
    let access = checker.check(&tracee(), &regs(libc::SYS_read, [0; 6])).unwrap();
    assert_eq!(access, Access::Allowed);
  }

  #[test]
  fn it_should_check_open_path() {
    let filter = filter();
    let mut checker = AccessChecker::new(&filter);
    let access = checker.check(&tracee(), &regs(SYS_open, [0x1000, 0, 0, 0, 0, 0])).unwrap();
    assert_eq!(access, Access::Allowed);
    assert_eq!(checker.last_file(), Some("/etc/ld.so.cache"));

    let access = checker
      .check(&tracee(), &regs(SYS_open, [0x2000, libc::O_RDONLY as u64, 0, 0, 0, 0]))
      .unwrap();
    assert_eq!(
      access,
      Access::DisallowedFile {
        path: "/etc/passwd".to_string(),
        mode: libc::O_RDONLY as u64
      }
    );
    assert_eq!(checker.last_file(), Some("/etc/passwd"));
  }

  #[test]
  fn it_should_resolve_relative_openat() {
    let filter = filter();
    let mut checker = AccessChecker::new(&filter);
    let at_cwd = libc::AT_FDCWD as i64 as u64;
    let access = checker.check(&tracee(), &regs(SYS_openat, [at_cwd, 0x3000, 0, 0, 0, 0])).unwrap();
    assert_eq!(access, Access::Allowed);

    // 相对于 /data 解析，不在白名单内
    let access = checker.check(&tracee(), &regs(SYS_openat, [7, 0x3000, 2, 0, 0, 0])).unwrap();
    assert_eq!(
      access,
      Access::DisallowedFile {
        path: "input.txt".to_string(),
        mode: 2
      }
    );
  }

  #[test]
  fn openat2_reads_flags_from_open_how() {
    let filter = SyscallFilter::new(0..512, vec![("/etc/ld.so.cache", true)]);
    let mut checker = AccessChecker::new(&filter);
    let at_cwd = libc::AT_FDCWD as i64 as u64;
    let access = checker
      .check(&tracee(), &regs(SYS_openat2, [at_cwd, 0x2000, 0x5000, 24, 0, 0]))
      .unwrap();
    assert_eq!(
      access,
      Access::DisallowedFile {
        path: "/etc/passwd".to_string(),
        mode: libc::O_RDWR as u64
      }
    );

    let access = checker
      .check(&tracee(), &regs(SYS_openat2, [at_cwd, 0x1000, 0x5000, 24, 0, 0]))
      .unwrap();
    assert_eq!(access, Access::Allowed);
  }

  #[test]
  fn exec_paths_are_checked() {
    let filter = SyscallFilter::new(0..512, vec![("/etc/ld.so.cache", true)]);
    let mut checker = AccessChecker::new(&filter);
    let access = checker.check(&tracee(), &regs(SYS_execve, [0x4000, 0, 0, 0, 0, 0])).unwrap();
    assert!(matches!(access, Access::DisallowedFile { path, .. } if path == "/bin/sh"));

    let at_cwd = libc::AT_FDCWD as i64 as u64;
    let access = checker
      .check(&tracee(), &regs(SYS_execveat, [at_cwd, 0x4000, 0, 0, 0, 0]))
      .unwrap();
    assert!(matches!(access, Access::DisallowedFile { path, .. } if path == "/bin/sh"));
  }

  #[test]
  fn i386_syscall_is_forbidden() {
    let filter = SyscallFilter::new(0..512, vec![("/etc/ld.so.cache", true)]);
    let mut checker = AccessChecker::new(&filter);
    // i386 open 与 x86_64 fstat 同号
    let mut open = regs(5, [0x2000, 0, 0, 0, 0, 0]);
    open.compat = true;
    assert_eq!(checker.check(&tracee(), &open).unwrap(), Access::DisallowedCall(5));
    assert_eq!(checker.last_file(), None);
  }

  #[test]
  fn compat_is_read_from_code_segment() {
    let mut raw: user_regs_struct = unsafe { std::mem::zeroed() };
    raw.orig_rax = 5;
    raw.cs = 0x33;
    assert!(!SyscallRegisters::from(&raw).compat);
    raw.cs = 0x23;
    assert!(SyscallRegisters::from(&raw).compat);
  }

  #[test]
  fn spawning_calls_are_detected() {
    assert!(SyscallFilter::new(0..512, Vec::<(String, bool)>::new()).allows_spawning());
    let calls = (0..512).filter(|id| !SPAWN_SYSCALLS.contains(&(*id as libc::c_long)));
    assert!(!SyscallFilter::new(calls, Vec::<(String, bool)>::new()).allows_spawning());
  }

  #[test]
  fn unreadable_path_is_forbidden() {
    let filter = filter();
    let mut checker = AccessChecker::new(&filter);
    let access = checker.check(&tracee(), &regs(SYS_open, [0x9000, 0, 0, 0, 0, 0])).unwrap();
    assert!(matches!(access, Access::DisallowedFile { .. }));
  }

  #[test]
  fn filter_builders_toggle_entries() {
    let mut filter = SyscallFilter::default();
    filter.allow_call(1).allow_file("/tmp/a");
    assert!(filter.is_call_allowed(1));
    assert!(filter.is_file_allowed("/tmp/a"));
    filter.forbid_call(1).forbid_file("/tmp/a");
    assert!(!filter.is_call_allowed(1));
    assert!(!filter.is_file_allowed("/tmp/a"));
    assert!(!filter.is_file_allowed("/tmp/b"));
  }
}

//! Process launch with namespace, landlock and rlimit isolation.
//!
//! Every governed command is started through [`Sandbox::spawn`]. The launch
//! forks twice:
//!
//! 1. The **supervisor** (first child) moves into its own process group,
//!    wires stdio to the capture pipes, and unshares the user, PID, network,
//!    IPC and UTS namespaces. It then forks the command and waits for it,
//!    relaying its exit status.
//! 2. The **command** (second child) is PID 1 of the fresh PID namespace and
//!    dies with its supervisor (`PR_SET_PDEATHSIG`). When it dies the kernel
//!    kills everything left in the namespace, so no descendant survives the
//!    governed call.
//!
//! Before `execve` the command applies, in order: rlimits, the sandbox
//! identity (dedicated uid or user namespace mapping), capability drop and
//! a landlock ruleset:
//!
//! - **Filesystem**: read/execute on the runtime image and base paths,
//!   read/write on the scratch directory and a few device nodes, nothing else
//! - **Network**: TCP bind and connect denied (ABI V4, 6.7+), on top of the
//!   empty network namespace
//! - **Signals / abstract unix sockets**: scoped to the sandbox (ABI V6, 6.12+)
//!
//! ## Degradation
//!
//! Layers the kernel does not offer are skipped unless `require_sandbox` is
//! set, in which case the missing layer is a [`SetupError`]. Without a PID
//! namespace the supervisor becomes a child subreaper so orphans stay in the
//! tree the governor watches.
//!
//! ## Setup errors
//!
//! Failures between `fork` and `execve` are written to a CLOEXEC status pipe
//! as a stage code plus errno. EOF on the pipe means `execve` succeeded.

use crate::prelude::RwArc;

use super::Sluice;

use std::ffi::CString;
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::PathBuf;
use std::sync::{atomic, Arc};
use std::time::Duration;

use anyhow::Result;
use indexmap::IndexMap;
use landlock::{self, Access as _, RulesetAttr as _, RulesetCreatedAttr as _};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;

/// Device nodes every sandbox may open read/write
const DEVICE_PATHS: &[&str] = &["/dev/null", "/dev/zero", "/dev/urandom"];

/// Namespaces unshared for every command (the user namespace is handled separately)
const NAMESPACE_FLAGS: libc::c_int = libc::CLONE_NEWPID
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWUTS;

/// Identity the command runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Dedicated host uid/gid, used when the server runs as root
    Dedicated { uid: u32, gid: u32 },
    /// Unprivileged user namespace mapping a random inside uid onto the server's uid
    UserNamespace,
}

/// Kernel-enforced per-process limits applied before `execve`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLimits {
    pub cpu_time_secs: u64,
    /// RLIMIT_DATA, skipped when `None`
    pub data_bytes: Option<u64>,
    pub file_size_bytes: u64,
    pub stack_bytes: u64,
    pub open_files: u64,
    /// RLIMIT_NPROC, only meaningful for a dedicated uid
    pub processes: Option<u64>,
    pub nice: i32,
}

/// Phase of the child setup that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SetupStage {
    UserNamespace = 1,
    Namespaces = 2,
    Fork = 3,
    Workdir = 4,
    Identity = 5,
    Landlock = 6,
    Exec = 7,
}

impl SetupStage {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => Self::UserNamespace,
            2 => Self::Namespaces,
            3 => Self::Fork,
            4 => Self::Workdir,
            5 => Self::Identity,
            6 => Self::Landlock,
            7 => Self::Exec,
            _ => return None,
        })
    }
}

fn errno_text(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}

#[derive(Debug, Error)]
#[error("sandbox setup failed at {stage:?}: {}", errno_text(.errno))]
pub struct SetupError {
    pub stage: SetupStage,
    pub errno: i32,
}

/// Resource usage statistics from wait4
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResourceUsage {
    /// User CPU time in microseconds
    pub ru_utime: i64,
    /// System CPU time in microseconds
    pub ru_stime: i64,
    /// Maximum resident set size in kilobytes
    pub ru_maxrss: i64,
}

impl ResourceUsage {
    /// User plus system CPU time
    pub fn cpu_time(&self) -> Duration {
        Duration::from_micros((self.ru_utime.max(0) + self.ru_stime.max(0)) as u64)
    }
}

/// How the supervisor ended
#[derive(Debug, Clone, Default)]
pub struct ProcessExit {
    /// Exit code, `128 + signal` for signal deaths, `None` if it could not be waited on
    pub exit_code: Option<i32>,
    pub rusage: ResourceUsage,
}

/// Configuration for spawning a sandboxed process
#[derive(Debug, Clone)]
pub struct Sandbox {
    /// Absolute path of the executable
    pub program: PathBuf,
    /// Full argv, argv[0] included
    pub args: Vec<String>,
    /// Environment variables (ordered)
    pub env: IndexMap<String, String>,
    /// Process standard input
    pub stdin: Vec<u8>,
    /// Working directory (the scratch directory)
    pub workdir: PathBuf,
    pub identity: Identity,
    pub limits: ProcessLimits,
    /// Paths granted read and execute access
    pub read_only_paths: Vec<PathBuf>,
    /// Directories granted full access
    pub writable_paths: Vec<PathBuf>,
    /// Capacity of each of the stdout/stderr buffers
    pub output_limit: usize,
    /// Require full sandbox isolation (fail if unavailable)
    pub require_sandbox: bool,
}

pub struct SandboxHandle {
    /// Supervisor pid, which is also the process group id
    pub pid: i32,
    /// Resolves when the supervisor has been reaped
    pub exit: JoinHandle<ProcessExit>,
    /// Fired when either output stream overflows
    pub overflow: Arc<Notify>,
    stdout_buffer: RwArc<Sluice>,
    stderr_buffer: RwArc<Sluice>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

/// Parent ends of a freshly forked supervisor's pipes
struct Launched {
    pid: i32,
    stdout: std::fs::File,
    stderr: std::fs::File,
    status: std::fs::File,
    stdin: Option<std::fs::File>,
}

/// Send `signal` to every member of process group `pgid`
pub fn kill_group(pgid: i32, signal: libc::c_int) {
    if pgid > 1 {
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

/// Spawn a task to read from an AsyncFd into a Sluice buffer.
///
/// Past the capacity it keeps draining and discarding, so a writer being
/// killed never blocks on a full pipe.
fn spawn_pipe_reader(
    async_fd: AsyncFd<std::fs::File>,
    buffer: RwArc<Sluice>,
    overflow: Arc<Notify>,
    overflowed: Arc<atomic::AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(g) => g,
                Err(_) => break,
            };

            match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
                Ok(Ok(0)) => break, // EOF
                Ok(Ok(n)) => {
                    if overflowed.load(atomic::Ordering::Relaxed) {
                        continue;
                    }
                    let mut buffer_guard = buffer.write().await;
                    if let Err(e) = buffer_guard.append(&buf[..n]) {
                        tracing::debug!(error = %e, "output buffer full");
                        overflowed.store(true, atomic::Ordering::Relaxed);
                        overflow.notify_one();
                    }
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(Err(_)) => break,
                Err(_would_block) => continue,
            }
        }
    })
}

/// Helper function to write data to a proc file
/// Returns true on success, false on failure
unsafe fn write_proc_file(path: &[u8], data: &[u8]) -> bool {
    unsafe {
        let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return false;
        }
        let written = libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
        libc::close(fd);
        written == data.len() as isize
    }
}

/// Report a setup failure to the parent and exit
unsafe fn fail_setup(status_fd: i32, stage: SetupStage, errno: i32, exit_code: i32) -> ! {
    unsafe {
        let mut msg = [0u8; 8];
        msg[..4].copy_from_slice(&(stage as u32).to_le_bytes());
        msg[4..].copy_from_slice(&errno.to_le_bytes());
        libc::write(status_fd, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(exit_code)
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Close every descriptor from `first` upwards
unsafe fn close_from(first: u32) {
    unsafe {
        if libc::syscall(libc::SYS_close_range, first, u32::MAX, 0) != 0 {
            for fd in first..4096 {
                libc::close(fd as i32);
            }
        }
    }
}

fn pipe_cloexec() -> Result<[i32; 2]> {
    let mut fds: [i32; 2] = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(anyhow::anyhow!("Failed to create pipe: {}", std::io::Error::last_os_error()));
    }
    Ok(fds)
}

fn cstring(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| anyhow::anyhow!("{} contains a NUL byte", what))
}

/// Build and enforce the landlock ruleset for the calling process
fn restrict_filesystem(
    read_only: &[PathBuf],
    writable: &[PathBuf],
) -> Result<landlock::RestrictionStatus> {
    // Use highest ABI for maximum features:
    // - V4 (6.7+): TCP network controls
    // - V6 (6.12+): Scope restrictions (signal, abstract Unix socket)
    let abi = landlock::ABI::V6;

    let ruleset = landlock::Ruleset::default()
        .handle_access(landlock::AccessFs::from_all(abi))?
        .handle_access(landlock::AccessNet::BindTcp)?
        .handle_access(landlock::AccessNet::ConnectTcp)?
        .scope(landlock::Scope::Signal)?
        .scope(landlock::Scope::AbstractUnixSocket)?;

    let mut created = ruleset.create()?;

    for path in read_only {
        if let Ok(fd) = landlock::PathFd::new(path) {
            created = created.add_rule(landlock::PathBeneath::new(fd, landlock::AccessFs::from_read(abi)))?;
        }
    }
    for path in writable {
        if let Ok(fd) = landlock::PathFd::new(path) {
            created = created.add_rule(landlock::PathBeneath::new(fd, landlock::AccessFs::from_all(abi)))?;
        }
    }
    for device in DEVICE_PATHS {
        if let Ok(fd) = landlock::PathFd::new(device) {
            created = created.add_rule(landlock::PathBeneath::new(
                fd,
                landlock::AccessFs::ReadFile | landlock::AccessFs::WriteFile,
            ))?;
        }
    }

    Ok(created.restrict_self()?)
}

impl Sandbox {
    /// Read the setup status pipe to EOF; a message means the child never reached exec
    fn read_setup_status(status_file: &mut std::fs::File) -> Option<SetupError> {
        let mut msg = Vec::with_capacity(8);
        if status_file.read_to_end(&mut msg).is_err() || msg.len() < 8 {
            return None;
        }
        let code = u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]);
        let errno = i32::from_le_bytes([msg[4], msg[5], msg[6], msg[7]]);
        SetupStage::from_code(code).map(|stage| SetupError { stage, errno })
    }

    /// Block until `pid` exits, kill what is left of its group, then reap it.
    ///
    /// The group is signalled while `pid` is still an unreaped zombie, so the
    /// id cannot have been recycled for an unrelated group.
    fn wait_blocking(pid: i32) -> ProcessExit {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        while unsafe { libc::waitid(libc::P_PID, pid as libc::id_t, &mut info, libc::WEXITED | libc::WNOWAIT) } != 0 {
            if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
                break;
            }
        }
        kill_group(pid, libc::SIGKILL);

        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        loop {
            let result = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
            if result >= 0 {
                break;
            }
            if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
                return ProcessExit::default();
            }
        }

        let exit_code = if libc::WIFEXITED(status) {
            Some(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Some(128 + libc::WTERMSIG(status))
        } else {
            None
        };

        ProcessExit {
            exit_code,
            rusage: ResourceUsage {
                ru_utime: rusage.ru_utime.tv_sec * 1_000_000 + rusage.ru_utime.tv_usec,
                ru_stime: rusage.ru_stime.tv_sec * 1_000_000 + rusage.ru_stime.tv_usec,
                ru_maxrss: rusage.ru_maxrss,
            },
        }
    }

    /// Fork the supervisor and command, returning the parent pipe ends.
    ///
    /// Synchronous: the raw argv/envp pointer arrays live only in this frame.
    fn launch(&self) -> Result<Launched> {
        // Everything the children need is prepared before fork so they only
        // issue syscalls (landlock setup aside)
        let program = CString::new(self.program.as_os_str().as_bytes())
            .map_err(|_| anyhow::anyhow!("program path contains a NUL byte"))?;
        let workdir = CString::new(self.workdir.as_os_str().as_bytes())
            .map_err(|_| anyhow::anyhow!("workdir contains a NUL byte"))?;
        let args_cstring = self.args.iter()
            .map(|s| cstring(s, "argument"))
            .collect::<Result<Vec<_>>>()?;
        let env_cstring = self.env.iter()
            .map(|(k, v)| {
                if k.contains('=') {
                    anyhow::bail!("environment key {:?} contains '='", k);
                }
                cstring(&format!("{}={}", k, v), "environment entry")
            })
            .collect::<Result<Vec<_>>>()?;

        let mut args_ptrs: Vec<*const libc::c_char> = args_cstring.iter().map(|s| s.as_ptr()).collect();
        args_ptrs.push(std::ptr::null());
        let mut env_ptrs: Vec<*const libc::c_char> = env_cstring.iter().map(|s| s.as_ptr()).collect();
        env_ptrs.push(std::ptr::null());

        // Random inside ids, kept under INT32_MAX for programs that treat uid_t as signed
        let (uid_map, gid_map) = {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let inside_uid: u32 = rng.gen_range(0x10000..0x7FFFFFFF);
            let inside_gid: u32 = rng.gen_range(0x10000..0x7FFFFFFF);
            let outside_uid = unsafe { libc::getuid() };
            let outside_gid = unsafe { libc::getgid() };
            (
                format!("{} {} 1\n", inside_uid, outside_uid).into_bytes(),
                format!("{} {} 1\n", inside_gid, outside_gid).into_bytes(),
            )
        };

        let limits = &self.limits;
        let mut rlimits: Vec<(libc::__rlimit_resource_t, u64, u64)> = vec![
            // Soft limit raises SIGXCPU, hard limit a second later SIGKILL
            (libc::RLIMIT_CPU, limits.cpu_time_secs, limits.cpu_time_secs + 1),
            (libc::RLIMIT_FSIZE, limits.file_size_bytes, limits.file_size_bytes),
            (libc::RLIMIT_STACK, limits.stack_bytes, limits.stack_bytes),
            (libc::RLIMIT_NOFILE, limits.open_files, limits.open_files),
            (libc::RLIMIT_CORE, 0, 0),
            (libc::RLIMIT_MSGQUEUE, 0, 0),
        ];
        if let Some(data) = limits.data_bytes {
            rlimits.push((libc::RLIMIT_DATA, data, data));
        }
        if let (Some(nproc), Identity::Dedicated { .. }) = (limits.processes, self.identity) {
            rlimits.push((libc::RLIMIT_NPROC, nproc, nproc));
        }

        let stdout_fds = pipe_cloexec()?;
        let stderr_fds = pipe_cloexec()?;
        let status_fds = pipe_cloexec()?;
        let stdin_fds = if self.stdin.is_empty() { None } else { Some(pipe_cloexec()?) };

        let pid = unsafe { libc::fork() };

        if pid < 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                for fd in stdout_fds.iter().chain(&stderr_fds).chain(&status_fds).chain(stdin_fds.iter().flatten()) {
                    libc::close(*fd);
                }
            }
            return Err(anyhow::anyhow!("Fork failed: {}", err));
        }

        if pid == 0 {
            // SUPERVISOR PROCESS
            unsafe {
                libc::setpgid(0, 0);

                // stdio: dup2 clears CLOEXEC on the targets
                match stdin_fds {
                    Some(fds) => {
                        libc::dup2(fds[0], libc::STDIN_FILENO);
                    }
                    None => {
                        let null_fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY);
                        if null_fd >= 0 {
                            libc::dup2(null_fd, libc::STDIN_FILENO);
                        }
                    }
                }
                libc::dup2(stdout_fds[1], libc::STDOUT_FILENO);
                libc::dup2(stderr_fds[1], libc::STDERR_FILENO);

                // Keep the status pipe on fd 3, drop everything else inherited
                // (including other sandboxes' pipes from concurrent spawns)
                libc::dup2(status_fds[1], 3);
                libc::fcntl(3, libc::F_SETFD, libc::FD_CLOEXEC);
                close_from(4);
                let status_fd = 3;

                // Undo the server's signal dispositions (Rust ignores SIGPIPE)
                let mut empty: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut empty);
                libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
                for signal in 1..32 {
                    if signal != libc::SIGKILL && signal != libc::SIGSTOP {
                        libc::signal(signal, libc::SIG_DFL);
                    }
                }

                let isolated = match self.identity {
                    Identity::UserNamespace => {
                        if libc::unshare(libc::CLONE_NEWUSER) != 0 {
                            if self.require_sandbox {
                                fail_setup(status_fd, SetupStage::UserNamespace, last_errno(), 126);
                            }
                            false
                        } else {
                            // Disable setgroups (required for unprivileged gid mapping)
                            write_proc_file(b"/proc/self/setgroups\0", b"deny\n");
                            let mapped = write_proc_file(b"/proc/self/uid_map\0", &uid_map)
                                && write_proc_file(b"/proc/self/gid_map\0", &gid_map);
                            if !mapped && self.require_sandbox {
                                fail_setup(status_fd, SetupStage::UserNamespace, last_errno(), 126);
                            }
                            libc::unshare(NAMESPACE_FLAGS) == 0
                        }
                    }
                    Identity::Dedicated { .. } => libc::unshare(NAMESPACE_FLAGS) == 0,
                };

                if !isolated {
                    if self.require_sandbox {
                        fail_setup(status_fd, SetupStage::Namespaces, last_errno(), 126);
                    }
                    // Orphans get reparented here instead of escaping the tree
                    libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
                }

                let supervisor = libc::getpid();
                let child = libc::fork();
                if child < 0 {
                    fail_setup(status_fd, SetupStage::Fork, last_errno(), 126);
                }

                if child == 0 {
                    // COMMAND PROCESS
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0);
                    // In a new PID namespace the parent is outside it and getppid() is 0
                    if !isolated && libc::getppid() != supervisor {
                        libc::_exit(126);
                    }

                    if libc::chdir(workdir.as_ptr()) != 0 {
                        fail_setup(status_fd, SetupStage::Workdir, last_errno(), 126);
                    }

                    libc::setpriority(libc::PRIO_PROCESS, 0, self.limits.nice);
                    for &(resource, soft, hard) in &rlimits {
                        let limit = libc::rlimit { rlim_cur: soft, rlim_max: hard };
                        libc::setrlimit(resource, &limit);
                    }

                    // Never exec as root: identity failures are always fatal
                    if let Identity::Dedicated { uid, gid } = self.identity {
                        if libc::setgroups(0, std::ptr::null()) != 0
                            || libc::setgid(gid) != 0
                            || libc::setuid(uid) != 0
                        {
                            fail_setup(status_fd, SetupStage::Identity, last_errno(), 126);
                        }
                    }

                    // Drop all capabilities (best-effort, may fail without user namespace)
                    let _ = caps::clear(None, caps::CapSet::Effective);
                    let _ = caps::clear(None, caps::CapSet::Permitted);
                    let _ = caps::clear(None, caps::CapSet::Inheritable);

                    match restrict_filesystem(&self.read_only_paths, &self.writable_paths) {
                        Ok(status) => {
                            if self.require_sandbox && status.ruleset == landlock::RulesetStatus::NotEnforced {
                                fail_setup(status_fd, SetupStage::Landlock, libc::ENOSYS, 126);
                            }
                        }
                        Err(_) => {
                            if self.require_sandbox {
                                fail_setup(status_fd, SetupStage::Landlock, last_errno(), 126);
                            }
                        }
                    }

                    libc::execve(program.as_ptr(), args_ptrs.as_ptr(), env_ptrs.as_ptr());
                    fail_setup(status_fd, SetupStage::Exec, last_errno(), 127);
                }

                // Only the command keeps the status pipe and the stdio pipes
                libc::close(status_fd);
                libc::close(libc::STDIN_FILENO);
                libc::close(libc::STDOUT_FILENO);
                libc::close(libc::STDERR_FILENO);

                let mut status: libc::c_int = 0;
                while libc::waitpid(child, &mut status, 0) < 0 {
                    if last_errno() != libc::EINTR {
                        libc::_exit(126);
                    }
                }
                // Reap anything reparented onto us
                while libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) > 0 {}

                if libc::WIFEXITED(status) {
                    libc::_exit(libc::WEXITSTATUS(status));
                }
                libc::_exit(128 + libc::WTERMSIG(status));
            }
        }

        // PARENT PROCESS
        // Mirror the child's setpgid so signalling the group never races its startup
        unsafe {
            libc::setpgid(pid, pid);
            libc::close(stdout_fds[1]);
            libc::close(stderr_fds[1]);
            libc::close(status_fds[1]);
            if let Some(fds) = stdin_fds {
                libc::close(fds[0]);
            }
        }

        Ok(Launched {
            pid,
            stdout: unsafe { std::fs::File::from_raw_fd(stdout_fds[0]) },
            stderr: unsafe { std::fs::File::from_raw_fd(stderr_fds[0]) },
            status: unsafe { std::fs::File::from_raw_fd(status_fds[0]) },
            stdin: stdin_fds.map(|fds| unsafe { std::fs::File::from_raw_fd(fds[1]) }),
        })
    }

    /// Fork the supervisor and command, returning once `execve` succeeded
    pub async fn spawn(self) -> Result<SandboxHandle> {
        let Launched {
            pid,
            stdout: stdout_file,
            stderr: stderr_file,
            status: mut status_file,
            stdin: stdin_writer,
        } = self.launch()?;

        let setup = tokio::task::spawn_blocking(move || Self::read_setup_status(&mut status_file))
            .await
            .unwrap_or(None);
        if let Some(err) = setup {
            let _ = tokio::task::spawn_blocking(move || Self::wait_blocking(pid)).await;
            return Err(err.into());
        }

        // Set non-blocking (use as_raw_fd() since File now owns the fd)
        for file in [&stdout_file, &stderr_file] {
            unsafe {
                let flags = libc::fcntl(file.as_raw_fd(), libc::F_GETFL);
                libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        if let Some(mut writer) = stdin_writer {
            let stdin_data = self.stdin;
            tokio::task::spawn_blocking(move || {
                use std::io::Write;
                // EPIPE just means the command stopped reading
                let _ = writer.write_all(&stdin_data);
            });
        }

        let overflow = Arc::new(Notify::new());
        let stdout_buffer = Arc::new(RwLock::new(Sluice::new(self.output_limit)));
        let stderr_buffer = Arc::new(RwLock::new(Sluice::new(self.output_limit)));

        let stdout_task = spawn_pipe_reader(
            AsyncFd::new(stdout_file)?,
            stdout_buffer.clone(),
            overflow.clone(),
            Arc::new(atomic::AtomicBool::new(false)),
        );
        let stderr_task = spawn_pipe_reader(
            AsyncFd::new(stderr_file)?,
            stderr_buffer.clone(),
            overflow.clone(),
            Arc::new(atomic::AtomicBool::new(false)),
        );

        let exit = tokio::task::spawn_blocking(move || Self::wait_blocking(pid));

        Ok(SandboxHandle {
            pid,
            exit,
            overflow,
            stdout_buffer,
            stderr_buffer,
            stdout_task,
            stderr_task,
        })
    }
}

impl SandboxHandle {
    /// Wait for the pipe readers to reach EOF, giving up after `linger`.
    ///
    /// A reader still blocked after that is held open by a process that
    /// escaped the group; it is aborted and whatever was captured is kept.
    pub async fn collect_output(self, linger: Duration) -> (Sluice, Sluice) {
        for task in [self.stdout_task, self.stderr_task] {
            let abort = task.abort_handle();
            if tokio::time::timeout(linger, task).await.is_err() {
                abort.abort();
            }
        }

        let stdout = self.stdout_buffer.read().await.clone();
        let stderr = self.stderr_buffer.read().await.clone();
        (stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_stage_codes_round_trip() {
        for stage in [
            SetupStage::UserNamespace,
            SetupStage::Namespaces,
            SetupStage::Fork,
            SetupStage::Workdir,
            SetupStage::Identity,
            SetupStage::Landlock,
            SetupStage::Exec,
        ] {
            assert_eq!(SetupStage::from_code(stage as u32), Some(stage));
        }
        assert_eq!(SetupStage::from_code(0), None);
    }

    #[test]
    fn test_setup_error_message_names_stage() {
        let err = SetupError { stage: SetupStage::Exec, errno: libc::ENOENT };
        let msg = err.to_string();
        assert!(msg.contains("Exec"), "{msg}");
    }

    #[test]
    fn test_cpu_time_sums_user_and_system() {
        let usage = ResourceUsage { ru_utime: 1_500_000, ru_stime: 250_000, ru_maxrss: 0 };
        assert_eq!(usage.cpu_time(), Duration::from_millis(1750));
        assert_eq!(ResourceUsage::default().cpu_time(), Duration::ZERO);
    }

    fn true_sandbox(args: &[&str]) -> Sandbox {
        Sandbox {
            program: PathBuf::from("/bin/true"),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: IndexMap::new(),
            stdin: Vec::new(),
            workdir: std::env::temp_dir(),
            identity: Identity::UserNamespace,
            limits: ProcessLimits {
                cpu_time_secs: 1,
                data_bytes: None,
                file_size_bytes: 1 << 20,
                stack_bytes: 8 << 20,
                open_files: 64,
                processes: None,
                nice: 0,
            },
            read_only_paths: ["/usr", "/bin", "/lib", "/lib64"].iter().map(PathBuf::from).collect(),
            writable_paths: Vec::new(),
            output_limit: 1024,
            require_sandbox: false,
        }
    }

    #[tokio::test]
    async fn test_spawn_rejects_nul_in_arguments() {
        assert!(true_sandbox(&["tr\0ue"]).spawn().await.is_err());
    }

    #[test]
    fn test_spawn_future_is_send() {
        // Governors drive spawn from multi-threaded runtimes
        fn assert_send<T: Send>(_: &T) {}
        let future = true_sandbox(&["true"]).spawn();
        assert_send(&future);
    }

    #[tokio::test]
    async fn test_spawn_runs_on_a_worker_thread() {
        let handle = tokio::spawn(true_sandbox(&["true"]).spawn()).await.unwrap().unwrap();
        let exit = handle.exit.await.unwrap();
        assert_eq!(exit.exit_code, Some(0));
    }
}

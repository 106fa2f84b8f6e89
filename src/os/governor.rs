//! Bounded execution of one command inside a sandbox instance.
//!
//! [`ProcessGovernor::run_bounded`] starts the command through
//! [`Sandbox`](super::Sandbox) and watches it until it exits, enforcing
//! concurrently:
//!
//! - the wall-clock deadline
//! - the memory ceiling (summed RSS of the process tree, polled from `/proc`)
//! - the process/thread ceiling
//! - the per-stream output cap
//!
//! The first breach wins. The process group gets SIGTERM, then SIGKILL once
//! the grace window passes. Breaches are reported in [`BoundedOutput`],
//! never as errors.

use super::procfs;
use super::provision::SandboxInstance;
use super::sandbox::{kill_group, ProcessLimits, Sandbox};

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Headroom added to RLIMIT_DATA on top of the memory ceiling, so the RSS
/// watchdog normally trips first and reports `oom`
const DATA_HEADROOM_MB: u64 = 64;
const FILE_SIZE_LIMIT: u64 = 64 * 1024 * 1024;
const STACK_LIMIT: u64 = 64 * 1024 * 1024;
const OPEN_FILES_LIMIT: u64 = 256;
/// Exit status of a command killed by RLIMIT_CPU's soft limit
const SIGXCPU_EXIT: i32 = 128 + libc::SIGXCPU;

/// Kind of limit a governed command ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum Breach {
    Timeout,
    Oom,
    OutputOverflow,
    ProcessLimit,
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Breach::Timeout => "timeout",
            Breach::Oom => "oom",
            Breach::OutputOverflow => "output-overflow",
            Breach::ProcessLimit => "process-limit",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLimits {
    pub wall_time: Duration,
    pub memory_mb: u64,
    /// Ceiling on threads across the whole process tree
    pub max_processes: u64,
    /// Cap on each of stdout and stderr
    pub output_limit_bytes: usize,
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    /// Apply RLIMIT_DATA (off for runtimes that reserve large mappings)
    pub enforce_data_rlimit: bool,
    pub nice: i32,
}

/// One command to run
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Program name: searched on the configured path, `./` is relative to the scratch dir
    pub program: String,
    pub args: Vec<String>,
    pub env: IndexMap<String, String>,
    pub stdin: Vec<u8>,
    /// Extra read-only host paths the command needs (its runtime image)
    pub read_only_paths: Vec<PathBuf>,
    pub limits: RunLimits,
}

/// What came out of a governed command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundedOutput {
    pub stdout: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr: Vec<u8>,
    pub stderr_truncated: bool,
    /// Raw exit status (`128 + signal` for signal deaths)
    pub exit_code: Option<i32>,
    pub breach: Option<Breach>,
    pub elapsed: Duration,
    pub peak_memory_kb: Option<u64>,
}

#[async_trait]
pub trait Governor: Send + Sync {
    /// Run `spec` inside `instance` and wait for it under its limits.
    ///
    /// Errors are reserved for failures to start the command at all.
    async fn run_bounded(&self, instance: &SandboxInstance, spec: RunSpec) -> anyhow::Result<BoundedOutput>;
}

/// Diagnostics name files relative to the scratch dir, never by its host path
fn strip_workdir(bytes: Vec<u8>, dir: &Path) -> Vec<u8> {
    let prefix = format!("{}/", dir.display()).into_bytes();
    if prefix.len() < 2 || !bytes.windows(prefix.len()).any(|w| w == prefix.as_slice()) {
        return bytes;
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes.as_slice();
    while let Some(at) = rest.windows(prefix.len()).position(|w| w == prefix.as_slice()) {
        out.extend_from_slice(&rest[..at]);
        rest = &rest[at + prefix.len()..];
    }
    out.extend_from_slice(rest);
    out
}

/// Resolve a program name the way the governor will execute it
pub fn resolve_program(program: &str, search_path: &[PathBuf], workdir: &Path) -> Option<PathBuf> {
    if let Some(local) = program.strip_prefix("./") {
        return Some(workdir.join(local));
    }
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_absolute().then_some(path);
    }
    search_path.iter()
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Decide the breach from how the command ended when the watchdog saw none
pub fn classify_exit(
    breach: Option<Breach>,
    exit_code: Option<i32>,
    peak_memory_kb: u64,
    memory_limit_kb: u64,
) -> Option<Breach> {
    if breach.is_some() {
        return breach;
    }
    match exit_code {
        Some(SIGXCPU_EXIT) => Some(Breach::Timeout),
        Some(code) if code != 0 && peak_memory_kb >= memory_limit_kb => Some(Breach::Oom),
        _ => None,
    }
}

/// First-breach bookkeeping for the monitor loop
struct Escalation {
    pgid: i32,
    grace: Duration,
    breach: Option<Breach>,
    kill_at: Option<Instant>,
}

impl Escalation {
    fn trip(&mut self, breach: Breach) {
        if self.breach.is_some() {
            return;
        }
        tracing::debug!(%breach, pgid = self.pgid, "limit breached, terminating");
        self.breach = Some(breach);
        kill_group(self.pgid, libc::SIGTERM);
        self.kill_at = Some(Instant::now() + self.grace);
    }

    fn force_kill(&mut self) {
        kill_group(self.pgid, libc::SIGKILL);
        self.kill_at = None;
    }
}

/// Governor backed by real processes on this host
pub struct ProcessGovernor {
    search_path: Vec<PathBuf>,
    base_read_only_paths: Vec<PathBuf>,
    require_sandbox: bool,
}

impl ProcessGovernor {
    pub fn new(search_path: Vec<PathBuf>, base_read_only_paths: Vec<PathBuf>, require_sandbox: bool) -> Self {
        Self { search_path, base_read_only_paths, require_sandbox }
    }

    fn environment(&self, instance: &SandboxInstance, extra: IndexMap<String, String>) -> IndexMap<String, String> {
        let path = self.search_path.iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let home = instance.dir.display().to_string();

        let mut env = IndexMap::new();
        env.insert("PATH".to_string(), path);
        env.insert("HOME".to_string(), home.clone());
        env.insert("TMPDIR".to_string(), home);
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        env.extend(extra);
        env
    }
}

#[async_trait]
impl Governor for ProcessGovernor {
    async fn run_bounded(&self, instance: &SandboxInstance, spec: RunSpec) -> anyhow::Result<BoundedOutput> {
        let program = resolve_program(&spec.program, &self.search_path, &instance.dir)
            .ok_or_else(|| anyhow::anyhow!("program not found: {}", spec.program))?;

        // Stage limits never exceed the instance ceilings
        let mut limits = spec.limits;
        limits.memory_mb = limits.memory_mb.min(instance.limits.memory_mb);
        limits.max_processes = limits.max_processes.min(instance.limits.max_processes);

        let mut read_only_paths = self.base_read_only_paths.clone();
        read_only_paths.extend(spec.read_only_paths);
        read_only_paths.push(program.clone());

        let mut argv = Vec::with_capacity(spec.args.len() + 1);
        argv.push(spec.program.clone());
        argv.extend(spec.args);

        let sandbox = Sandbox {
            program,
            args: argv,
            env: self.environment(instance, spec.env),
            stdin: spec.stdin,
            workdir: instance.dir.clone(),
            identity: instance.identity,
            limits: ProcessLimits {
                cpu_time_secs: limits.wall_time.as_secs() + 1,
                data_bytes: limits.enforce_data_rlimit
                    .then(|| (limits.memory_mb + DATA_HEADROOM_MB) * 1024 * 1024),
                file_size_bytes: FILE_SIZE_LIMIT,
                stack_bytes: STACK_LIMIT,
                open_files: OPEN_FILES_LIMIT,
                processes: Some(limits.max_processes),
                nice: limits.nice,
            },
            read_only_paths,
            writable_paths: vec![instance.dir.clone()],
            output_limit: limits.output_limit_bytes,
            require_sandbox: self.require_sandbox,
        };

        let started = Instant::now();
        let mut handle = sandbox.spawn().await?;
        let pgid = handle.pid;
        tracing::debug!(instance = %instance.id, pid = pgid, program = %spec.program, "command started");

        let memory_limit_kb = limits.memory_mb * 1024;
        let page_kb = procfs::page_kb();
        let deadline = started + limits.wall_time;
        let overflow = handle.overflow.clone();

        let mut escalation = Escalation { pgid, grace: limits.kill_grace, breach: None, kill_at: None };
        let mut peak_kb: u64 = 0;
        let mut ticker = tokio::time::interval(limits.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let exit = loop {
            let tripped = escalation.breach.is_some();
            let kill_at = escalation.kill_at;

            tokio::select! {
                result = &mut handle.exit => {
                    break result.unwrap_or_default();
                }
                _ = tokio::time::sleep_until(deadline), if !tripped => {
                    escalation.trip(Breach::Timeout);
                }
                _ = overflow.notified(), if !tripped => {
                    escalation.trip(Breach::OutputOverflow);
                }
                _ = tokio::time::sleep_until(kill_at.unwrap_or(deadline)), if kill_at.is_some() => {
                    escalation.force_kill();
                }
                _ = ticker.tick() => {
                    let usage = tokio::task::spawn_blocking(move || {
                        let procs = procfs::snapshot();
                        procfs::tree_usage(pgid, pgid, &procs, page_kb)
                    })
                    .await
                    .unwrap_or_default();

                    peak_kb = peak_kb.max(usage.rss_kb);
                    if usage.rss_kb > memory_limit_kb {
                        escalation.trip(Breach::Oom);
                    } else if usage.threads > limits.max_processes {
                        escalation.trip(Breach::ProcessLimit);
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        let (stdout, stderr) = handle.collect_output(limits.kill_grace).await;

        peak_kb = peak_kb.max(exit.rusage.ru_maxrss.max(0) as u64);
        let breach = classify_exit(escalation.breach, exit.exit_code, peak_kb, memory_limit_kb);

        tracing::debug!(
            instance = %instance.id,
            exit_code = ?exit.exit_code,
            breach = ?breach,
            elapsed_ms = elapsed.as_millis() as u64,
            cpu_ms = exit.rusage.cpu_time().as_millis() as u64,
            peak_kb,
            "command finished"
        );

        Ok(BoundedOutput {
            stdout_truncated: stdout.overflowed(),
            stdout: stdout.into_bytes(),
            stderr_truncated: stderr.overflowed(),
            stderr: strip_workdir(stderr.into_bytes(), &instance.dir),
            exit_code: exit.exit_code,
            breach,
            elapsed,
            peak_memory_kb: (peak_kb > 0).then_some(peak_kb),
        })
    }
}

//! Execution orchestration.
//!
//! One [`Executor::execute`] call per submission:
//!
//! ```text
//! Validating → Provisioning → Compiling? → Running → Encoding → Releasing → Done
//! ```
//!
//! Validation happens before anything is allocated. Everything from
//! provisioning on runs in a spawned task that owns the limiter permit, so
//! dropping the caller's future (client disconnect) never skips the release.
//! The stages themselves run in a nested task: a panic there surfaces as an
//! internal error while the instance is still released exactly once.

pub mod error;
pub mod request;
pub mod result;
#[cfg(test)]
pub(crate) mod testing;

pub use error::{ExecError, ValidationError};
pub use request::{Submission, SubmissionRequest};
pub use result::{ExecutionResult, Stage};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::config::{ExecutionLimits, GlobalConfig};
use crate::lang::{CommandTemplate, Registry, Toolchain};
use crate::os::{
    Governor, HostProvisioner, InstanceLimits, ProcessGovernor, ProvisionError, Provisioner, RunLimits, RunSpec,
    SandboxInstance,
};
use crate::prelude::fingerprint;

/// Orchestrator knobs not owned by the registry
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub limits: ExecutionLimits,
    pub capacity: usize,
    pub queue_timeout: Duration,
    pub provision_attempts: u32,
}

impl From<&GlobalConfig> for ExecutorSettings {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            limits: config.limits.clone(),
            capacity: config.max_concurrency,
            queue_timeout: config.queue_timeout(),
            provision_attempts: config.provision_attempts.max(1),
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    provisioner: Arc<dyn Provisioner>,
    governor: Arc<dyn Governor>,
    registry: Arc<Registry>,
    limiter: Arc<Semaphore>,
    settings: Arc<ExecutorSettings>,
}

fn request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Stage limits for `toolchain`, config defaults overlaid with its overrides
pub fn stage_limits(defaults: &ExecutionLimits, toolchain: &Toolchain, stage: Stage) -> RunLimits {
    let o = &toolchain.limits;
    let (timeout_secs, memory_mb, max_processes) = match stage {
        Stage::Compile => (
            o.compile_timeout_secs.unwrap_or(defaults.compile_timeout_secs),
            o.compile_memory_mb.unwrap_or(defaults.compile_memory_mb),
            o.compile_max_processes.unwrap_or(defaults.compile_max_processes),
        ),
        Stage::Run => (
            o.run_timeout_secs.unwrap_or(defaults.run_timeout_secs),
            o.memory_mb.unwrap_or(defaults.memory_mb),
            o.max_processes.unwrap_or(defaults.max_processes),
        ),
    };

    RunLimits {
        wall_time: Duration::from_secs(timeout_secs),
        memory_mb,
        max_processes,
        output_limit_bytes: defaults.output_limit_bytes,
        kill_grace: defaults.kill_grace(),
        poll_interval: defaults.poll_interval(),
        enforce_data_rlimit: toolchain.enforce_data_rlimit,
        nice: defaults.nice,
    }
}

impl Executor {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        governor: Arc<dyn Governor>,
        registry: Arc<Registry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            provisioner,
            governor,
            registry,
            limiter: Arc::new(Semaphore::new(settings.capacity.max(1))),
            settings: Arc::new(settings),
        }
    }

    /// Host-backed executor: scratch-dir provisioner plus the process governor
    pub fn from_config(config: &GlobalConfig) -> anyhow::Result<Self> {
        let registry = Registry::with_overrides(&config.toolchains)?;
        let provisioner = HostProvisioner::new(&config.scratch_root, config.max_concurrency, config.dedicated_uid_base())?;
        let governor = ProcessGovernor::new(
            config.search_path.clone(),
            config.base_read_only_paths.clone(),
            config.require_sandbox,
        );
        tracing::info!(
            isolation = provisioner.isolation_mode(),
            scratch_root = %config.scratch_root.display(),
            capacity = config.max_concurrency,
            languages = registry.iter().count(),
            "executor ready"
        );

        Ok(Self::new(Arc::new(provisioner), Arc::new(governor), Arc::new(registry), ExecutorSettings::from(config)))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity.max(1)
    }

    /// Submissions currently holding a sandbox permit
    pub fn active(&self) -> usize {
        self.capacity().saturating_sub(self.limiter.available_permits())
    }

    pub fn isolation_mode(&self) -> &'static str {
        self.provisioner.isolation_mode()
    }

    /// Run one submission end to end
    pub async fn execute(&self, request: SubmissionRequest) -> Result<ExecutionResult, ExecError> {
        let span = tracing::info_span!(
            "execute",
            request_id = %request_id(),
            language = %request.language,
            code = %fingerprint(request.code.as_bytes()),
        );

        async move {
            tracing::debug!(phase = "validating", code_bytes = request.code.len(), stdin_bytes = request.stdin.len());
            let submission = request.validate(&self.registry, &self.settings.limits).map_err(|e| {
                tracing::info!(error = %e, "rejected submission");
                ExecError::from(e)
            })?;

            let permit = match tokio::time::timeout(self.settings.queue_timeout, self.limiter.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(closed)) => return Err(ExecError::internal(closed)),
                Err(_) => {
                    tracing::warn!(capacity = self.capacity(), "no sandbox capacity, rejecting");
                    return Err(ExecError::Busy);
                }
            };

            let this = self.clone();
            let job = tokio::spawn(
                async move {
                    let _permit = permit;
                    this.run_submission(submission).await
                }
                .in_current_span(),
            );

            match job.await {
                Ok(outcome) => outcome,
                Err(e) => Err(ExecError::internal(anyhow::anyhow!("execution task failed: {}", e))),
            }
        }
        .instrument(span)
        .await
    }

    async fn run_submission(&self, submission: Submission) -> Result<ExecutionResult, ExecError> {
        let started = std::time::Instant::now();
        let ceiling = self.ceiling(&submission.toolchain);

        tracing::debug!(phase = "provisioning", memory_mb = ceiling.memory_mb, max_processes = ceiling.max_processes);
        let instance = Arc::new(self.provision(ceiling).await?);

        let stages = tokio::spawn({
            let this = self.clone();
            let instance = instance.clone();
            async move { this.run_stages(&instance, submission).await }.in_current_span()
        });
        let outcome = match stages.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(instance = %instance.id, error = %e, "stage task failed");
                Err(ExecError::internal(anyhow::anyhow!("stage task failed: {}", e)))
            }
        };

        tracing::debug!(phase = "releasing", instance = %instance.id);
        if let Err(e) = self.provisioner.release(&instance).await {
            tracing::error!(instance = %instance.id, error = %e, "failed to release sandbox instance");
        }

        match &outcome {
            Ok(result) => tracing::info!(
                phase = "done",
                exit_code = ?result.exit_code,
                stage = ?result.stage,
                breach = ?result.reason,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "submission finished"
            ),
            Err(e) => tracing::error!(phase = "failed", kind = e.kind(), error = %e, "submission failed"),
        }
        outcome
    }

    /// Instance ceilings cover every stage the toolchain runs
    fn ceiling(&self, toolchain: &Toolchain) -> InstanceLimits {
        let run = stage_limits(&self.settings.limits, toolchain, Stage::Run);
        let mut ceiling = InstanceLimits { memory_mb: run.memory_mb, max_processes: run.max_processes };
        if toolchain.pipeline.compile().is_some() {
            let compile = stage_limits(&self.settings.limits, toolchain, Stage::Compile);
            ceiling.memory_mb = ceiling.memory_mb.max(compile.memory_mb);
            ceiling.max_processes = ceiling.max_processes.max(compile.max_processes);
        }
        ceiling
    }

    async fn provision(&self, ceiling: InstanceLimits) -> Result<SandboxInstance, ExecError> {
        let attempts = self.settings.provision_attempts.max(1);
        let mut last_error: Option<ProvisionError> = None;

        for attempt in 1..=attempts {
            match self.provisioner.acquire(ceiling).await {
                Ok(instance) => {
                    tracing::debug!(instance = %instance.id, attempt, "provisioned");
                    return Ok(instance);
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "provisioning failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => ExecError::Provision(e),
            None => ExecError::Busy,
        })
    }

    fn command(&self, toolchain: &Toolchain, template: &CommandTemplate, limits: RunLimits, stdin: Vec<u8>) -> RunSpec {
        RunSpec {
            program: template.program.clone(),
            args: template.render_args(limits.memory_mb),
            env: toolchain.env.clone(),
            stdin,
            read_only_paths: toolchain.runtime.read_only_paths.clone(),
            limits,
        }
    }

    async fn run_stages(&self, instance: &SandboxInstance, submission: Submission) -> Result<ExecutionResult, ExecError> {
        let toolchain = &submission.toolchain;
        self.provisioner
            .write_file(instance, &toolchain.source_file, submission.code.as_bytes())
            .await
            .map_err(ExecError::internal)?;

        if let Some(compile) = toolchain.pipeline.compile() {
            tracing::debug!(phase = "compiling", instance = %instance.id, program = %compile.program);
            let limits = stage_limits(&self.settings.limits, toolchain, Stage::Compile);
            let spec = self.command(toolchain, compile, limits.clone(), Vec::new());
            let output = self.governor.run_bounded(instance, spec).await.map_err(ExecError::Internal)?;

            if output.breach.is_some() || output.exit_code != Some(0) {
                tracing::debug!(phase = "encoding", exit_code = ?output.exit_code, breach = ?output.breach, "compile failed");
                return Ok(result::encode(Stage::Compile, output, &limits));
            }
        }

        let run = toolchain.pipeline.run();
        tracing::debug!(phase = "running", instance = %instance.id, program = %run.program);
        let limits = stage_limits(&self.settings.limits, toolchain, Stage::Run);
        let spec = self.command(toolchain, run, limits.clone(), submission.stdin.into_bytes());
        let output = self.governor.run_bounded(instance, spec).await.map_err(ExecError::Internal)?;

        tracing::debug!(phase = "encoding", exit_code = ?output.exit_code, breach = ?output.breach);
        Ok(result::encode(Stage::Run, output, &limits))
    }
}

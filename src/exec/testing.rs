//! Mock provisioner and governor for orchestrator and router tests

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::os::{BoundedOutput, Governor, Identity, InstanceLimits, ProvisionError, Provisioner, RunSpec, SandboxInstance};

/// Counts acquire/release calls and can fail the first few acquires
#[derive(Default)]
pub struct CountingProvisioner {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub attempts: AtomicUsize,
    pub fail_first: usize,
    pub files: Mutex<Vec<String>>,
}

#[async_trait]
impl Provisioner for CountingProvisioner {
    async fn acquire(&self, limits: InstanceLimits) -> Result<SandboxInstance, ProvisionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(ProvisionError::Exhausted { capacity: 0 });
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxInstance::new(
            format!("mock{n}"),
            PathBuf::from(format!("/nonexistent/mock{n}")),
            Identity::UserNamespace,
            limits,
        ))
    }

    async fn write_file(&self, _instance: &SandboxInstance, name: &str, _content: &[u8]) -> Result<(), ProvisionError> {
        self.files.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn release(&self, instance: &SandboxInstance) -> Result<(), ProvisionError> {
        if instance.mark_released() {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn isolation_mode(&self) -> &'static str {
        "mock"
    }

    fn active(&self) -> usize {
        self.acquired.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst)
    }
}

pub enum Script {
    Output(BoundedOutput),
    Delay(Duration, BoundedOutput),
    Fail,
    Panic,
}

/// Replays scripted outcomes and records every command it was given
#[derive(Default)]
pub struct ScriptedGovernor {
    script: Mutex<VecDeque<Script>>,
    pub calls: Mutex<Vec<RunSpec>>,
}

impl ScriptedGovernor {
    pub fn new(script: Vec<Script>) -> Self {
        Self { script: Mutex::new(script.into()), calls: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Governor for ScriptedGovernor {
    async fn run_bounded(&self, _instance: &SandboxInstance, spec: RunSpec) -> anyhow::Result<BoundedOutput> {
        self.calls.lock().unwrap().push(spec);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Output(out)) => Ok(out),
            Some(Script::Delay(delay, out)) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            Some(Script::Fail) => Err(anyhow::anyhow!("sandbox setup failed")),
            Some(Script::Panic) => panic!("governor exploded"),
            None => Ok(exited(b"", 0)),
        }
    }
}

pub fn exited(stdout: &[u8], code: i32) -> BoundedOutput {
    BoundedOutput {
        stdout: stdout.to_vec(),
        exit_code: Some(code),
        elapsed: Duration::from_millis(5),
        peak_memory_kb: Some(2048),
        ..Default::default()
    }
}

//! Canonical result record and the mapping from governor output to it.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::os::{BoundedOutput, Breach, RunLimits};

/// Phase that produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Compile => "compile",
            Stage::Run => "run",
        })
    }
}

/// Outcome of one submission, returned for every completed run attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// `null` when the process was killed for breaching a limit
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    /// Peak resident memory, one decimal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    /// Set only when the submission did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Breach>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.stage.is_none()
    }
}

pub fn truncation_marker(limit: usize) -> String {
    format!("\n[output truncated at {} bytes]\n", limit)
}

fn format_secs(limits: &RunLimits) -> String {
    let secs = limits.wall_time.as_secs_f64();
    format!("{}s", (secs * 1000.0).round() / 1000.0)
}

/// Human-readable explanation appended to stderr
pub fn breach_note(breach: Breach, limits: &RunLimits) -> String {
    match breach {
        Breach::Timeout => format!("process terminated: time limit exceeded ({})", format_secs(limits)),
        Breach::Oom => format!("process terminated: memory limit exceeded ({} MB)", limits.memory_mb),
        Breach::OutputOverflow => format!(
            "process terminated: output limit exceeded ({} bytes)",
            limits.output_limit_bytes
        ),
        Breach::ProcessLimit => format!("process terminated: process limit exceeded ({})", limits.max_processes),
    }
}

fn decode(bytes: &[u8], truncated: bool, limit: usize) -> String {
    // A cut through a multi-byte character is dropped, not replaced, so the text stays within the cap
    let bytes = match std::str::from_utf8(bytes) {
        Err(e) if truncated && e.error_len().is_none() => &bytes[..e.valid_up_to()],
        _ => bytes,
    };
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated {
        text.push_str(&truncation_marker(limit));
    }
    text
}

/// Map one stage's governor output into the public record.
///
/// `limits` are the limits the stage ran under; they only feed the notes.
pub fn encode(stage: Stage, output: BoundedOutput, limits: &RunLimits) -> ExecutionResult {
    let stdout = decode(&output.stdout, output.stdout_truncated, limits.output_limit_bytes);
    let mut stderr = decode(&output.stderr, output.stderr_truncated, limits.output_limit_bytes);

    if let Some(breach) = output.breach {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&breach_note(breach, limits));
        stderr.push('\n');
    }

    let exit_code = match output.breach {
        Some(_) => None,
        None => output.exit_code,
    };
    let failed = output.breach.is_some() || exit_code != Some(0);

    ExecutionResult {
        stdout,
        stderr,
        exit_code,
        timed_out: output.breach == Some(Breach::Timeout),
        time_ms: Some(output.elapsed.as_millis() as u64),
        memory_mb: output.peak_memory_kb.map(|kb| (kb as f64 / 1024.0 * 10.0).round() / 10.0),
        stage: failed.then_some(stage),
        reason: output.breach,
    }
}

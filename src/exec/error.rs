use thiserror::Error;

use crate::lang::UnsupportedLanguage;
use crate::os::ProvisionError;

/// Request rejected before any sandbox is provisioned
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error("code is empty")]
    EmptySource,
    #[error("code is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },
    #[error("stdin is {size} bytes, limit is {limit}")]
    StdinTooLarge { size: usize, limit: usize },
}

/// Every way a submission can fail other than its program misbehaving
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("all sandboxes are busy, retry later")]
    Busy,
    #[error("could not provision a sandbox: {0}")]
    Provision(#[from] ProvisionError),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ExecError {
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        ExecError::Internal(err.into())
    }

    /// Stable label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::Validation(_) => "validation",
            ExecError::Busy => "busy",
            ExecError::Provision(_) => "provision",
            ExecError::Internal(_) => "internal",
        }
    }
}

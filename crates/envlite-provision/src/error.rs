//! Provisioning error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no python interpreter found on PATH (tried python3, python)")]
    HostInterpreterMissing,

    #[error("environment {name} has no interpreter under {path}")]
    InterpreterMissing { name: String, path: PathBuf },

    /// Both creation strategies failed; never leaves a partially Ready environment.
    #[error("environment creation failed for {name}: {detail}")]
    Creation { name: String, detail: String },

    /// One or more required packages failed install or verification.
    #[error("package install failed for {env}: {packages:?}")]
    Install { env: String, packages: Vec<String> },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

use tokio_util::sync::CancellationToken;

use crate::core::domain::{ExecutionRequest, ExecutionResult};

#[mockall::automock]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    /// Runs one request in a fresh isolated context.
    ///
    /// A failing user program is an `Ok` result; `Err` means the sandbox
    /// itself could not be created or managed.
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare sandbox: {msg}")]
    Setup { msg: String },
    #[error("failed to spawn sandboxed process: {msg}")]
    Spawn { msg: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error("sandbox failure: {msg}")]
    Internal { msg: String },
}

impl SandboxError {
    /// Errors raised before the user program started; a fresh attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Setup { .. } | SandboxError::Spawn { .. })
    }
}

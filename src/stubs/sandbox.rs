use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    traits::sandbox::{Sandbox, SandboxError},
};

/// Returns a canned result after a delay, honouring cancellation while it sleeps.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    result: Result<ExecutionResult, SandboxError>,
    delay: Duration,
}

impl SandboxStub {
    pub fn new(result: Result<ExecutionResult, SandboxError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    #[tracing::instrument(skip(cancel))]
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        tracing::debug!(
            "Start execution: language={:?}, stdin={:?}, limits={:?}",
            request.language,
            request.stdin,
            request.limits
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {
                tracing::debug!("Execution result: {:?}", self.result);
                self.result.clone()
            }
        }
    }
}

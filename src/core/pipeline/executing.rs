use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{
    domain::{ExecutionRequest, ExecutionResult, RawExecutionRequest, Submission},
    pipeline::{
        grading::grade,
        validating::{ValidationError, ValidationPolicy, validate},
    },
    traits::sandbox::{Sandbox, SandboxError},
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("all sandboxes are busy")]
    Busy,
    #[error("infrastructure failure: {msg}")]
    Infrastructure { msg: String },
    #[error("execution cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_concurrent: usize,
    /// Zero rejects immediately when every permit is taken.
    pub queue_timeout: Duration,
    pub spawn_retries: u32,
    pub policy: ValidationPolicy,
}

/// Validator -> Runner -> Grader, bounded by a concurrency limit.
#[derive(Debug, Clone)]
pub struct ExecutionService {
    sandbox: Arc<dyn Sandbox>,
    permits: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, CancellationToken>>,
    config: ServiceConfig,
}

impl ExecutionService {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: ServiceConfig) -> Self {
        Self {
            sandbox,
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            active: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[tracing::instrument(skip_all)]
    pub async fn submit(
        &self,
        raw: RawExecutionRequest,
        expected_output: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<Submission, ServiceError> {
        let request = validate(raw, &self.config.policy)?;
        let result = self.execute(&request, cancel).await?;
        let verdict = grade(&result, expected_output);

        tracing::info!(
            id = %request.id,
            language = %request.language,
            reason = ?verdict.reason,
            exit_code = ?result.exit_code,
            execution_time_ms = result.execution_time_ms,
            "Submission graded"
        );
        tracing::debug!(id = %request.id, "Normalized output: {:?}", verdict.normalized_output);

        Ok(Submission {
            result,
            verdict,
            graded: expected_output.is_some(),
            limits: request.limits,
        })
    }

    /// Cancels every in-flight execution. Used on shutdown.
    pub fn cancel_all(&self) {
        for entry in self.active.iter() {
            tracing::debug!("Cancelling execution {}", entry.key());
            entry.value().cancel();
        }
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, ServiceError> {
        let _permit = self.acquire_permit(&cancel).await?;

        self.active.insert(request.id, cancel.clone());
        let _registration = Registration {
            active: &self.active,
            id: request.id,
        };

        self.run_with_retries(request, &cancel).await
    }

    async fn acquire_permit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ServiceError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if self.config.queue_timeout.is_zero() {
            tracing::warn!("No free sandbox, rejecting request");
            return Err(ServiceError::Busy);
        }

        tracing::debug!("Waiting for a free sandbox");
        tokio::select! {
            _ = cancel.cancelled() => Err(ServiceError::Cancelled),
            permit = tokio::time::timeout(
                self.config.queue_timeout,
                self.permits.clone().acquire_owned(),
            ) => match permit {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(ServiceError::Infrastructure {
                    msg: "sandbox pool closed".to_string(),
                }),
                Err(_) => {
                    tracing::warn!("Timed out waiting for a free sandbox");
                    Err(ServiceError::Busy)
                }
            },
        }
    }

    async fn run_with_retries(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ServiceError> {
        let mut attempt = 0;
        loop {
            match self.sandbox.run(request, cancel).await {
                Ok(result) => return Ok(result),
                Err(SandboxError::Cancelled) => {
                    tracing::info!(id = %request.id, "Execution cancelled by caller");
                    return Err(ServiceError::Cancelled);
                }
                Err(e) if e.is_retryable() && attempt < self.config.spawn_retries => {
                    attempt += 1;
                    tracing::warn!(id = %request.id, attempt, "Retrying sandbox: {}", e);
                }
                Err(e) => {
                    tracing::error!(id = %request.id, "Sandbox failure: {}", e);
                    return Err(ServiceError::Infrastructure { msg: e.to_string() });
                }
            }
        }
    }
}

/// Removes an execution from the active set however its future ends.
struct Registration<'a> {
    active: &'a DashMap<Uuid, CancellationToken>,
    id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

use crate::{
    constants::{INFRASTRUCTURE_ERR_MSG, NO_OUTPUT_MSG},
    core::domain::{GradeReason, RawExecutionRequest, Submission},
    http::models::{ExecuteRequest, ExecuteResponse},
};

impl From<ExecuteRequest> for RawExecutionRequest {
    fn from(req: ExecuteRequest) -> Self {
        Self {
            code: req.code,
            language: req.language,
            stdin: req.stdin,
            time_limit_ms: req.time_limit_ms,
            memory_limit_bytes: req.memory_limit_bytes,
        }
    }
}

impl From<Submission> for ExecuteResponse {
    fn from(submission: Submission) -> Self {
        let Submission {
            result,
            verdict,
            graded,
            limits,
        } = submission;

        let notice = match verdict.reason {
            GradeReason::Timeout => Some(format!(
                "Execution timed out after {} ms",
                limits.time_ms
            )),
            GradeReason::OutputTooLarge => {
                Some("Output limit exceeded, output was truncated".to_string())
            }
            GradeReason::RuntimeError if result.memory_exceeded => {
                Some("Memory limit exceeded".to_string())
            }
            GradeReason::RuntimeError => Some(format!(
                "Process exited with code {}",
                result.exit_code.unwrap_or(-1)
            )),
            GradeReason::Matched | GradeReason::Mismatched | GradeReason::Completed => None,
        };

        let error = match (notice, result.stderr.is_empty()) {
            (Some(notice), true) => Some(notice),
            (Some(notice), false) => Some(format!("{}\n{}", result.stderr.trim_end(), notice)),
            (None, false) => Some(result.stderr.clone()),
            (None, true) => None,
        };

        let output = if result.stdout.is_empty() && error.is_none() {
            NO_OUTPUT_MSG.to_string()
        } else {
            result.stdout
        };

        Self {
            output,
            error,
            passed: graded.then_some(verdict.passed),
            reason: Some(verdict.reason.id().to_string()),
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            truncated: result.truncated,
            execution_time_ms: result.execution_time_ms,
        }
    }
}

impl ExecuteResponse {
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Default::default()
        }
    }

    pub fn infrastructure_failure() -> Self {
        Self::failure(INFRASTRUCTURE_ERR_MSG)
    }
}

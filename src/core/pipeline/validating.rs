use uuid::Uuid;

use crate::{
    constants::{
        DEFAULT_MAX_SOURCE_BYTES, DEFAULT_MAX_STDIN_BYTES, DEFAULT_MEMORY_LIMIT_BYTES,
        DEFAULT_TIME_LIMIT_MS, MAX_MEMORY_LIMIT_BYTES, MAX_TIME_LIMIT_MS,
    },
    core::domain::{ExecutionLimits, ExecutionRequest, Language, RawExecutionRequest},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },
    #[error("No code provided")]
    EmptySource,
    #[error("Source is too large: {size} bytes (max {max})")]
    SourceTooLarge { size: usize, max: usize },
    #[error("Stdin is too large: {size} bytes (max {max})")]
    StdinTooLarge { size: usize, max: usize },
    #[error("Limit {name} must be greater than zero")]
    InvalidLimit { name: &'static str },
    #[error("Malformed request body: {msg}")]
    MalformedBody { msg: String },
    #[error("Request body exceeds {max} bytes")]
    RequestTooLarge { max: usize },
}

/// Defaults and hard ceilings applied by [`validate`].
#[derive(Debug, Clone)]
pub struct ValidationPolicy {
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub default_limits: ExecutionLimits,
    pub max_limits: ExecutionLimits,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_stdin_bytes: DEFAULT_MAX_STDIN_BYTES,
            default_limits: ExecutionLimits {
                time_ms: DEFAULT_TIME_LIMIT_MS,
                memory_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            },
            max_limits: ExecutionLimits {
                time_ms: MAX_TIME_LIMIT_MS,
                memory_bytes: MAX_MEMORY_LIMIT_BYTES,
            },
        }
    }
}

#[tracing::instrument(skip_all)]
pub fn validate(
    raw: RawExecutionRequest,
    policy: &ValidationPolicy,
) -> Result<ExecutionRequest, ValidationError> {
    let language = match raw.language.as_deref() {
        None | Some("") => Language::default(),
        Some(language) => {
            Language::parse(language).ok_or_else(|| ValidationError::UnsupportedLanguage {
                language: language.to_string(),
            })?
        }
    };

    // Whitespace is still a program; only a missing or empty one is refused.
    let source = raw.code.unwrap_or_default();
    if source.is_empty() {
        return Err(ValidationError::EmptySource);
    }
    if source.len() > policy.max_source_bytes {
        return Err(ValidationError::SourceTooLarge {
            size: source.len(),
            max: policy.max_source_bytes,
        });
    }

    if let Some(stdin) = &raw.stdin {
        if stdin.len() > policy.max_stdin_bytes {
            return Err(ValidationError::StdinTooLarge {
                size: stdin.len(),
                max: policy.max_stdin_bytes,
            });
        }
    }

    let time_ms = resolve_limit(
        "timeLimitMs",
        raw.time_limit_ms,
        policy.default_limits.time_ms,
        policy.max_limits.time_ms,
    )?;
    let memory_bytes = resolve_limit(
        "memoryLimitBytes",
        raw.memory_limit_bytes,
        policy.default_limits.memory_bytes,
        policy.max_limits.memory_bytes,
    )?;

    let request = ExecutionRequest {
        id: Uuid::new_v4(),
        language,
        source,
        stdin: raw.stdin.filter(|stdin| !stdin.is_empty()),
        limits: ExecutionLimits {
            time_ms,
            memory_bytes,
        },
    };

    tracing::debug!(
        id = %request.id,
        language = %request.language,
        source_len = request.source.len(),
        limits = ?request.limits,
        "Request validated"
    );
    Ok(request)
}

fn resolve_limit(
    name: &'static str,
    requested: Option<u64>,
    default: u64,
    ceiling: u64,
) -> Result<u64, ValidationError> {
    match requested {
        Some(0) => Err(ValidationError::InvalidLimit { name }),
        Some(value) => Ok(value.min(ceiling)),
        None => Ok(default.min(ceiling)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_raw_request() -> RawExecutionRequest {
        RawExecutionRequest {
            code: Some("print('Hello, World!')".to_string()),
            language: Some("python".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_request_gets_defaults() {
        let request = validate(create_raw_request(), &ValidationPolicy::default()).unwrap();

        assert_eq!(request.language, Language::Python);
        assert_eq!(request.source, "print('Hello, World!')");
        assert_eq!(request.stdin, None);
        assert_eq!(
            request.limits,
            ExecutionLimits {
                time_ms: DEFAULT_TIME_LIMIT_MS,
                memory_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            }
        );
    }

    #[test]
    fn test_missing_language_defaults_to_python() {
        let raw = RawExecutionRequest {
            language: None,
            ..create_raw_request()
        };

        let request = validate(raw, &ValidationPolicy::default()).unwrap();

        assert_eq!(request.language, Language::Python);
    }

    #[test]
    fn test_empty_language_defaults_to_python() {
        let raw = RawExecutionRequest {
            language: Some(String::new()),
            ..create_raw_request()
        };

        let request = validate(raw, &ValidationPolicy::default()).unwrap();

        assert_eq!(request.language, Language::Python);
    }

    #[test]
    fn test_unsupported_language() {
        for language in ["ruby", " ", "bash", "../../bin/sh"] {
            let raw = RawExecutionRequest {
                language: Some(language.to_string()),
                ..create_raw_request()
            };

            let result = validate(raw, &ValidationPolicy::default());

            assert!(matches!(
                result,
                Err(ValidationError::UnsupportedLanguage { language: ref l }) if l == language
            ));
        }
    }

    #[test]
    fn test_empty_source() {
        for code in [None, Some("")] {
            let raw = RawExecutionRequest {
                code: code.map(str::to_string),
                ..create_raw_request()
            };

            assert_eq!(
                validate(raw, &ValidationPolicy::default()).unwrap_err(),
                ValidationError::EmptySource
            );
        }
    }

    #[test]
    fn test_whitespace_source_is_accepted() {
        let raw = RawExecutionRequest {
            code: Some("   \n\t ".to_string()),
            ..create_raw_request()
        };

        let request = validate(raw, &ValidationPolicy::default()).unwrap();

        assert_eq!(request.source, "   \n\t ");
    }

    #[test]
    fn test_source_too_large() {
        let policy = ValidationPolicy::default();
        let raw = RawExecutionRequest {
            code: Some("x".repeat(policy.max_source_bytes + 1)),
            ..create_raw_request()
        };

        assert_eq!(
            validate(raw, &policy).unwrap_err(),
            ValidationError::SourceTooLarge {
                size: policy.max_source_bytes + 1,
                max: policy.max_source_bytes,
            }
        );
    }

    #[test]
    fn test_source_at_ceiling_is_accepted() {
        let policy = ValidationPolicy::default();
        let raw = RawExecutionRequest {
            code: Some("x".repeat(policy.max_source_bytes)),
            ..create_raw_request()
        };

        assert!(validate(raw, &policy).is_ok());
    }

    #[test]
    fn test_stdin_too_large() {
        let policy = ValidationPolicy::default();
        let raw = RawExecutionRequest {
            stdin: Some("1".repeat(policy.max_stdin_bytes + 1)),
            ..create_raw_request()
        };

        assert!(matches!(
            validate(raw, &policy),
            Err(ValidationError::StdinTooLarge { .. })
        ));
    }

    #[test]
    fn test_limits_are_clamped_to_ceilings() {
        let raw = RawExecutionRequest {
            time_limit_ms: Some(u64::MAX),
            memory_limit_bytes: Some(64 * 1024 * 1024 * 1024),
            ..create_raw_request()
        };

        let request = validate(raw, &ValidationPolicy::default()).unwrap();

        assert_eq!(request.limits.time_ms, MAX_TIME_LIMIT_MS);
        assert_eq!(request.limits.memory_bytes, MAX_MEMORY_LIMIT_BYTES);
    }

    #[test]
    fn test_limits_below_ceiling_are_kept() {
        let raw = RawExecutionRequest {
            time_limit_ms: Some(1000),
            memory_limit_bytes: Some(32 * 1024 * 1024),
            ..create_raw_request()
        };

        let request = validate(raw, &ValidationPolicy::default()).unwrap();

        assert_eq!(request.limits.time_ms, 1000);
        assert_eq!(request.limits.memory_bytes, 32 * 1024 * 1024);
    }

    #[test]
    fn test_defaults_never_exceed_ceilings() {
        let policy = ValidationPolicy {
            max_limits: ExecutionLimits {
                time_ms: 100,
                memory_bytes: 1024,
            },
            ..Default::default()
        };

        let request = validate(create_raw_request(), &policy).unwrap();

        assert_eq!(request.limits.time_ms, 100);
        assert_eq!(request.limits.memory_bytes, 1024);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let raw = RawExecutionRequest {
            time_limit_ms: Some(0),
            ..create_raw_request()
        };

        assert_eq!(
            validate(raw, &ValidationPolicy::default()).unwrap_err(),
            ValidationError::InvalidLimit {
                name: "timeLimitMs"
            }
        );
    }

    #[test]
    fn test_language_checked_before_source() {
        let raw = RawExecutionRequest {
            code: None,
            language: Some("cobol".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            validate(raw, &ValidationPolicy::default()),
            Err(ValidationError::UnsupportedLanguage { .. })
        ));
    }
}

use std::fmt;

use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::JavaScript];

    /// Canonical wire id.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            _ => None,
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::Python
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    pub memory_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub language: Language,
    pub source: String,
    pub stdin: Option<String>,
    pub limits: ExecutionLimits,
}

/// Untrusted input, exactly as the caller sent it.
#[derive(Clone, Debug, Default)]
pub struct RawExecutionRequest {
    pub code: Option<String>,
    pub language: Option<String>,
    pub stdin: Option<String>,
    pub time_limit_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
    pub memory_exceeded: bool,
    pub execution_time_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GradeReason {
    Matched,
    Mismatched,
    RuntimeError,
    Timeout,
    OutputTooLarge,
    /// Ran cleanly, nothing to compare against.
    Completed,
}

impl GradeReason {
    pub fn id(&self) -> &'static str {
        match self {
            GradeReason::Matched => "matched",
            GradeReason::Mismatched => "mismatched",
            GradeReason::RuntimeError => "runtime_error",
            GradeReason::Timeout => "timeout",
            GradeReason::OutputTooLarge => "output_too_large",
            GradeReason::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GradeVerdict {
    pub passed: bool,
    pub normalized_output: String,
    pub reason: GradeReason,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub result: ExecutionResult,
    pub verdict: GradeVerdict,
    pub graded: bool,
    /// Limits the run was held to, after defaults and ceilings.
    pub limits: ExecutionLimits,
}

//! Output grading.
//!
//! Actual and expected output are both passed through [`normalize`] before
//! comparison:
//!
//! 1. the text is split on `\n`;
//! 2. trailing whitespace (spaces, tabs, `\r`) is removed from every line;
//! 3. the lines are joined back with `\n`;
//! 4. every trailing newline is removed, which drops trailing blank lines.
//!
//! Leading indentation and blank lines before or between content lines are
//! kept, so `"a\n\nb"` and `"a\nb"` are different outputs.

use itertools::Itertools;

use crate::core::domain::{ExecutionResult, GradeReason, GradeVerdict};

pub fn normalize(text: &str) -> String {
    text.split('\n')
        .map(str::trim_end)
        .join("\n")
        .trim_end_matches('\n')
        .to_string()
}

#[tracing::instrument(skip_all)]
pub fn grade(result: &ExecutionResult, expected: Option<&str>) -> GradeVerdict {
    let normalized_output = normalize(&result.stdout);

    let reason = if result.timed_out {
        GradeReason::Timeout
    } else if result.truncated {
        GradeReason::OutputTooLarge
    } else if result.exit_code != Some(0) {
        GradeReason::RuntimeError
    } else {
        match expected {
            None => GradeReason::Completed,
            Some(expected) if normalize(expected) == normalized_output => GradeReason::Matched,
            Some(_) => GradeReason::Mismatched,
        }
    };

    tracing::debug!("Grade reason: {:?}", reason);

    GradeVerdict {
        passed: reason == GradeReason::Matched,
        normalized_output,
        reason,
    }
}

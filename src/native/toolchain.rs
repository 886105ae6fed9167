use std::path::PathBuf;

use tokio::process::Command;

use crate::{
    constants::MIB,
    core::domain::{ExecutionLimits, Language},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchArg {
    Literal(String),
    /// `prefix` followed by the memory limit in MiB, e.g. `--max-old-space-size=128`.
    HeapLimitMib { prefix: String },
    SourceFile,
}

/// One pinned interpreter invocation.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<LaunchArg>,
    pub source_file: String,
    pub version: String,
}

impl LaunchSpec {
    pub fn render_args(&self, limits: &ExecutionLimits) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| match arg {
                LaunchArg::Literal(value) => value.clone(),
                LaunchArg::HeapLimitMib { prefix } => {
                    format!("{}{}", prefix, (limits.memory_bytes / MIB).max(1))
                }
                LaunchArg::SourceFile => self.source_file.clone(),
            })
            .collect()
    }
}

/// The fixed language -> interpreter table. Requests only pick a variant.
#[derive(Debug, Clone)]
pub struct Toolchain {
    python: LaunchSpec,
    javascript: LaunchSpec,
}

impl Toolchain {
    pub fn new(python: LaunchSpec, javascript: LaunchSpec) -> Self {
        Self { python, javascript }
    }

    pub fn with_defaults(
        python_path: impl Into<PathBuf>,
        python_version: impl Into<String>,
        node_path: impl Into<PathBuf>,
        node_version: impl Into<String>,
    ) -> Self {
        Self::new(
            LaunchSpec {
                program: python_path.into(),
                args: vec![
                    LaunchArg::Literal("-I".to_string()),
                    LaunchArg::Literal("-B".to_string()),
                    LaunchArg::SourceFile,
                ],
                source_file: "main.py".to_string(),
                version: python_version.into(),
            },
            LaunchSpec {
                program: node_path.into(),
                args: vec![
                    LaunchArg::HeapLimitMib {
                        prefix: "--max-old-space-size=".to_string(),
                    },
                    LaunchArg::SourceFile,
                ],
                source_file: "main.js".to_string(),
                version: node_version.into(),
            },
        )
    }

    pub fn launch(&self, language: Language) -> &LaunchSpec {
        match language {
            Language::Python => &self.python,
            Language::JavaScript => &self.javascript,
        }
    }

    /// Runs `<program> --version` for every language and warns when the
    /// installed interpreter is missing or does not report the pinned version.
    pub async fn log_versions(&self) {
        for language in Language::ALL {
            let launch = self.launch(language);
            match Command::new(&launch.program).arg("--version").output().await {
                Ok(out) => {
                    let reported = format!(
                        "{}{}",
                        String::from_utf8_lossy(&out.stdout),
                        String::from_utf8_lossy(&out.stderr)
                    );
                    let reported = reported.trim();
                    if reported.contains(&launch.version) {
                        tracing::info!(%language, version = reported, "Interpreter ready");
                    } else {
                        tracing::warn!(
                            %language,
                            pinned = %launch.version,
                            reported,
                            "Interpreter version differs from pinned version"
                        );
                    }
                }
                Err(e) => tracing::warn!(
                    %language,
                    program = %launch.program.display(),
                    "Interpreter unavailable: {}",
                    e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_toolchain() -> Toolchain {
        Toolchain::with_defaults("/usr/bin/python3", "3.12", "/usr/bin/node", "v22")
    }

    #[test]
    fn test_python_launch() {
        let toolchain = create_toolchain();
        let launch = toolchain.launch(Language::Python);

        let args = launch.render_args(&ExecutionLimits {
            time_ms: 1000,
            memory_bytes: 128 * MIB,
        });

        assert_eq!(launch.program, PathBuf::from("/usr/bin/python3"));
        assert_eq!(args, vec!["-I", "-B", "main.py"]);
    }

    #[test]
    fn test_javascript_heap_flag_follows_memory_limit() {
        let toolchain = create_toolchain();
        let launch = toolchain.launch(Language::JavaScript);

        let args = launch.render_args(&ExecutionLimits {
            time_ms: 1000,
            memory_bytes: 64 * MIB,
        });

        assert_eq!(args, vec!["--max-old-space-size=64", "main.js"]);
    }

    #[test]
    fn test_heap_flag_never_zero() {
        let toolchain = create_toolchain();

        let args = toolchain
            .launch(Language::JavaScript)
            .render_args(&ExecutionLimits {
                time_ms: 1000,
                memory_bytes: 1024,
            });

        assert_eq!(args[0], "--max-old-space-size=1");
    }
}

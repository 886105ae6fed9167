use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

use crate::{
    constants::{
        DEFAULT_CGROUP_ROOT, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MAX_PROCESSES,
        DEFAULT_MAX_SOURCE_BYTES, DEFAULT_MAX_STDIN_BYTES, DEFAULT_MEMORY_LIMIT_BYTES,
        DEFAULT_QUEUE_TIMEOUT_MS, DEFAULT_RO_BINDS, DEFAULT_SANDBOX_UID_BASE,
        DEFAULT_SPAWN_RETRIES, DEFAULT_TIME_LIMIT_MS, MAX_MEMORY_LIMIT_BYTES, MAX_TIME_LIMIT_MS,
    },
    core::{
        domain::ExecutionLimits,
        pipeline::{executing::ServiceConfig, validating::ValidationPolicy},
    },
    native::{
        cgroup::CgroupParent,
        sandbox::{IsolationConfig, NativeSandboxConfig},
        toolchain::Toolchain,
        uids::UidPool,
    },
};

/// Sandboxed code execution and grading service.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Args {
    #[arg(long, env = "CODERUNNER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Parent directory for per-execution scratch directories.
    #[arg(long, env = "CODERUNNER_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(long, env = "CODERUNNER_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,

    /// How long a request may wait for a free sandbox; 0 rejects immediately.
    #[arg(long, env = "CODERUNNER_QUEUE_TIMEOUT_MS", default_value_t = DEFAULT_QUEUE_TIMEOUT_MS)]
    pub queue_timeout_ms: u64,

    #[arg(long, env = "CODERUNNER_SPAWN_RETRIES", default_value_t = DEFAULT_SPAWN_RETRIES)]
    pub spawn_retries: u32,

    #[arg(long, env = "CODERUNNER_MAX_SOURCE_BYTES", default_value_t = DEFAULT_MAX_SOURCE_BYTES)]
    pub max_source_bytes: usize,

    #[arg(long, env = "CODERUNNER_MAX_STDIN_BYTES", default_value_t = DEFAULT_MAX_STDIN_BYTES)]
    pub max_stdin_bytes: usize,

    #[arg(long, env = "CODERUNNER_DEFAULT_TIME_LIMIT_MS", default_value_t = DEFAULT_TIME_LIMIT_MS)]
    pub default_time_limit_ms: u64,

    #[arg(long, env = "CODERUNNER_MAX_TIME_LIMIT_MS", default_value_t = MAX_TIME_LIMIT_MS)]
    pub max_time_limit_ms: u64,

    #[arg(long, env = "CODERUNNER_DEFAULT_MEMORY_LIMIT_BYTES", default_value_t = DEFAULT_MEMORY_LIMIT_BYTES)]
    pub default_memory_limit_bytes: u64,

    #[arg(long, env = "CODERUNNER_MAX_MEMORY_LIMIT_BYTES", default_value_t = MAX_MEMORY_LIMIT_BYTES)]
    pub max_memory_limit_bytes: u64,

    /// Captured bytes per stream before the run is cut off as truncated.
    #[arg(long, env = "CODERUNNER_MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    pub max_output_bytes: usize,

    #[arg(long, env = "CODERUNNER_MAX_PROCESSES", default_value_t = DEFAULT_MAX_PROCESSES)]
    pub max_processes: u64,

    /// Confine every program: private mount, pid, network, IPC and UTS
    /// namespaces, a chroot of read-only binds, and a uid of its own.
    /// Requires root.
    #[arg(
        long,
        env = "CODERUNNER_ISOLATE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub isolate: bool,

    /// First of `max_concurrent` uids handed to confined programs.
    #[arg(long, env = "CODERUNNER_SANDBOX_UID_BASE", default_value_t = DEFAULT_SANDBOX_UID_BASE)]
    pub sandbox_uid_base: u32,

    /// Host paths visible read-only inside the confinement root.
    #[arg(
        long,
        env = "CODERUNNER_RO_BINDS",
        value_delimiter = ',',
        default_value = DEFAULT_RO_BINDS
    )]
    pub ro_binds: Vec<PathBuf>,

    /// Enforce memory and process limits with a cgroup v2 group per run.
    #[arg(
        long,
        env = "CODERUNNER_CGROUP",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub cgroup: bool,

    #[arg(long, env = "CODERUNNER_CGROUP_ROOT", default_value = DEFAULT_CGROUP_ROOT)]
    pub cgroup_root: PathBuf,

    #[arg(long, env = "CODERUNNER_PYTHON_PATH", default_value = "/usr/bin/python3")]
    pub python_path: PathBuf,

    #[arg(long, env = "CODERUNNER_PYTHON_VERSION", default_value = "3.12")]
    pub python_version: String,

    #[arg(long, env = "CODERUNNER_NODE_PATH", default_value = "/usr/bin/node")]
    pub node_path: PathBuf,

    #[arg(long, env = "CODERUNNER_NODE_VERSION", default_value = "v22")]
    pub node_version: String,
}

impl Args {
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            max_concurrent: self.max_concurrent.max(1),
            queue_timeout: Duration::from_millis(self.queue_timeout_ms),
            spawn_retries: self.spawn_retries,
            policy: self.validation_policy(),
        }
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            max_source_bytes: self.max_source_bytes,
            max_stdin_bytes: self.max_stdin_bytes,
            default_limits: ExecutionLimits {
                time_ms: self.default_time_limit_ms,
                memory_bytes: self.default_memory_limit_bytes,
            },
            max_limits: ExecutionLimits {
                time_ms: self.max_time_limit_ms,
                memory_bytes: self.max_memory_limit_bytes,
            },
        }
    }

    /// `cgroup` is set up separately since it touches the host.
    pub fn sandbox_config(&self, cgroup: Option<CgroupParent>) -> NativeSandboxConfig {
        let scratch_root = self
            .scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("coderunner"));
        let isolation = self.isolate.then(|| IsolationConfig {
            ro_binds: self.ro_binds.clone(),
            uids: UidPool::new(self.sandbox_uid_base, self.max_concurrent.max(1) as u32),
        });
        NativeSandboxConfig {
            max_processes: self.max_processes,
            isolation,
            cgroup,
            ..NativeSandboxConfig::new(scratch_root, self.max_output_bytes)
        }
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::with_defaults(
            &self.python_path,
            &self.python_version,
            &self.node_path,
            &self.node_version,
        )
    }

    /// Request bodies carry source, stdin and expected output.
    pub fn max_body_bytes(&self) -> usize {
        2 * self.max_source_bytes + self.max_stdin_bytes + 16 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["coderunner-grader"]).unwrap();

        assert_eq!(args.listen, "0.0.0.0:8080".parse().unwrap());
        assert!(args.isolate);
        assert!(args.cgroup);
        assert_eq!(args.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
        assert_eq!(
            args.ro_binds,
            ["/usr", "/bin", "/lib", "/lib64", "/etc/alternatives", "/etc/ld.so.cache"]
                .map(PathBuf::from)
        );

        let sandbox = args.sandbox_config(None);
        let isolation = sandbox.isolation.unwrap();
        assert_eq!(
            isolation.uids.lease().map(|lease| lease.uid()),
            Some(DEFAULT_SANDBOX_UID_BASE)
        );
        assert!(sandbox.cgroup.is_none());

        let policy = args.validation_policy();
        assert_eq!(policy.max_source_bytes, DEFAULT_MAX_SOURCE_BYTES);
        assert_eq!(policy.default_limits.time_ms, DEFAULT_TIME_LIMIT_MS);
        assert_eq!(policy.max_limits.memory_bytes, MAX_MEMORY_LIMIT_BYTES);

        let service = args.service_config();
        assert_eq!(service.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(service.spawn_retries, 1);
    }

    #[test]
    fn test_overrides() {
        let args = Args::try_parse_from([
            "coderunner-grader",
            "--listen",
            "127.0.0.1:9000",
            "--max-concurrent",
            "0",
            "--queue-timeout-ms",
            "0",
            "--isolate",
            "false",
            "--cgroup",
            "false",
            "--ro-binds",
            "/usr,/opt/python",
            "--scratch-dir",
            "/var/lib/coderunner",
        ])
        .unwrap();

        assert_eq!(args.service_config().max_concurrent, 1);
        assert!(args.service_config().queue_timeout.is_zero());

        assert!(!args.cgroup);
        assert_eq!(
            args.ro_binds,
            vec![PathBuf::from("/usr"), PathBuf::from("/opt/python")]
        );

        let sandbox = args.sandbox_config(None);
        assert!(sandbox.isolation.is_none());
        assert_eq!(sandbox.scratch_root, PathBuf::from("/var/lib/coderunner"));
    }
}

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_STDIN_BYTES: usize = 64 * 1024;

pub const DEFAULT_TIME_LIMIT_MS: u64 = 5_000;
pub const MAX_TIME_LIMIT_MS: u64 = 10_000;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 128 * MIB;
pub const MAX_MEMORY_LIMIT_BYTES: u64 = 256 * MIB;

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_PROCESSES: u64 = 64;
pub const MAX_OPEN_FILES: u64 = 64;
/// Without a cgroup, `RLIMIT_DATA` sits this far above the memory limit so
/// the resident-set watchdog sees an overrun before allocations start failing.
pub const DATA_BACKSTOP_HEADROOM_BYTES: u64 = 512 * MIB;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/coderunner";
pub const DEFAULT_SANDBOX_UID_BASE: u32 = 60_000;
pub const DEFAULT_RO_BINDS: &str = "/usr,/bin,/lib,/lib64,/etc/alternatives,/etc/ld.so.cache";
pub const SANDBOX_TMP_BYTES: u64 = 16 * MIB;
pub const SANDBOX_HOSTNAME: &str = "sandbox";
/// Program directory inside the sandbox root.
pub const WORK_DIR: &str = "work";

pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_QUEUE_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_SPAWN_RETRIES: u32 = 1;

/// How long capture readers may keep draining after the process group is killed.
pub const DRAIN_GRACE_MS: u64 = 250;
pub const MEMORY_POLL_INTERVAL_MS: u64 = 10;

/// 128 + SIGKILL, the shell convention for a process killed by the OOM guard.
pub const OOM_EXIT_CODE: i32 = 137;

pub const NO_OUTPUT_MSG: &str = "Code executed successfully (no output)";
pub const INFRASTRUCTURE_ERR_MSG: &str = "Failed to execute code";

use nix::sys::resource::{Resource, getrlimit, setrlimit};

use crate::{constants::MAX_OPEN_FILES, core::domain::ExecutionLimits};

/// Resource limits applied in the child between `fork` and `exec`.
///
/// `RLIMIT_AS` is not used: interpreters such as V8 reserve far more address
/// space than they ever touch. `RLIMIT_DATA` bounds what is actually
/// allocated and is only set when no cgroup enforces memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    pub data_bytes: Option<u64>,
    pub cpu_seconds: u64,
    pub file_size_bytes: u64,
    /// `RLIMIT_NPROC` counts every process of the real uid, so it is only
    /// meaningful once the program runs under a uid of its own.
    pub max_processes: Option<u64>,
    pub open_files: u64,
}

impl ProcessLimits {
    pub fn new(limits: &ExecutionLimits, max_output_bytes: usize) -> Self {
        Self {
            data_bytes: None,
            cpu_seconds: limits.time_ms.div_ceil(1000) + 1,
            file_size_bytes: max_output_bytes as u64,
            max_processes: None,
            open_files: MAX_OPEN_FILES,
        }
    }

    pub fn with_data_backstop(mut self, bytes: u64) -> Self {
        self.data_bytes = Some(bytes);
        self
    }

    pub fn with_max_processes(mut self, processes: u64) -> Self {
        self.max_processes = Some(processes);
        self
    }

    /// Must stay async-signal-safe: it runs in the forked child.
    pub fn apply(&self) -> nix::Result<()> {
        if let Some(data_bytes) = self.data_bytes {
            lower(Resource::RLIMIT_DATA, data_bytes)?;
        }
        lower(Resource::RLIMIT_CPU, self.cpu_seconds)?;
        lower(Resource::RLIMIT_FSIZE, self.file_size_bytes)?;
        if let Some(max_processes) = self.max_processes {
            lower(Resource::RLIMIT_NPROC, max_processes)?;
        }
        lower(Resource::RLIMIT_NOFILE, self.open_files)?;
        lower(Resource::RLIMIT_CORE, 0)
    }
}

/// Sets both soft and hard limit, never above the inherited hard limit.
fn lower(resource: Resource, value: u64) -> nix::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)
}

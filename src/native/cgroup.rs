use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use uuid::Uuid;

use crate::core::traits::sandbox::SandboxError;

const CONTROLLERS: &str = "+memory +pids";
const REMOVE_ATTEMPTS: u32 = 40;
const REMOVE_BACKOFF_MS: u64 = 5;

/// cgroup v2 directory under which every run gets a child group.
#[derive(Debug, Clone)]
pub struct CgroupParent {
    path: PathBuf,
}

impl CgroupParent {
    /// Creates `path` and delegates the memory and pids controllers to its
    /// children. Fails when cgroup v2 is not mounted writable or the
    /// controllers cannot be delegated from the parent group.
    pub fn setup(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        if let Some(parent) = path.parent() {
            std::fs::write(parent.join("cgroup.subtree_control"), CONTROLLERS)?;
        }
        std::fs::write(path.join("cgroup.subtree_control"), CONTROLLERS)?;
        tracing::info!(path = %path.display(), "cgroup ready");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap is disabled so an overrun ends in the OOM killer, and
    /// `memory.oom.group` makes the kill take the whole run down.
    pub async fn create(
        &self,
        id: Uuid,
        memory_bytes: u64,
        max_processes: u64,
    ) -> Result<RunCgroup, SandboxError> {
        let setup_err = |e: io::Error| SandboxError::Setup {
            msg: format!("cgroup: {}", e),
        };

        let path = self.path.join(id.to_string());
        tokio::fs::create_dir(&path).await.map_err(setup_err)?;
        let cgroup = RunCgroup {
            path,
            removed: false,
        };

        cgroup.write("memory.max", memory_bytes.to_string()).await.map_err(setup_err)?;
        cgroup.write("pids.max", max_processes.to_string()).await.map_err(setup_err)?;
        cgroup.write("memory.oom.group", "1").await.map_err(setup_err)?;
        if let Err(e) = cgroup.write("memory.swap.max", "0").await {
            // Absent when the kernel runs without swap accounting.
            if e.kind() != io::ErrorKind::NotFound {
                return Err(setup_err(e));
            }
        }

        Ok(cgroup)
    }
}

#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
    removed: bool,
}

impl RunCgroup {
    async fn write(&self, file: &str, value: impl AsRef<[u8]>) -> io::Result<()> {
        tokio::fs::write(self.path.join(file), value).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opened before spawning; the child joins by writing `0` into it.
    pub fn procs(&self) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
    }

    pub async fn oom_kills(&self) -> u64 {
        match tokio::fs::read_to_string(self.path.join("memory.events")).await {
            Ok(events) => parse_oom_kills(&events),
            Err(e) => {
                tracing::warn!("Failed to read memory.events: {}", e);
                0
            }
        }
    }

    /// Kills every process still in the group, including ones that left
    /// the process group.
    pub async fn kill(&self) {
        if let Err(e) = self.write("cgroup.kill", "1").await {
            tracing::debug!("cgroup.kill unavailable: {}", e);
        }
    }

    /// Removing a group fails while its last processes are still exiting.
    pub async fn remove(mut self) {
        for _ in 0..REMOVE_ATTEMPTS {
            match tokio::fs::remove_dir(&self.path).await {
                Ok(()) => {
                    self.removed = true;
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.removed = true;
                    return;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(REMOVE_BACKOFF_MS)).await,
            }
        }
    }
}

impl Drop for RunCgroup {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove cgroup {}: {}", self.path.display(), e);
            }
        }
    }
}

pub fn parse_oom_kills(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

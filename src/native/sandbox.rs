use std::{
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    constants::{
        DATA_BACKSTOP_HEADROOM_BYTES, DEFAULT_MAX_PROCESSES, DRAIN_GRACE_MS,
        MEMORY_POLL_INTERVAL_MS, OOM_EXIT_CODE, WORK_DIR,
    },
    core::{
        domain::{ExecutionRequest, ExecutionResult},
        traits::sandbox::{Sandbox, SandboxError},
    },
    native::{
        capture::{Captured, capture},
        cgroup::{CgroupParent, RunCgroup},
        jail::{Jail, RootfsPlan},
        limits::ProcessLimits,
        memory::{Tracked, watch_memory},
        scratch::Scratch,
        toolchain::{LaunchSpec, Toolchain},
        uids::{UidLease, UidPool},
    },
};

/// The two forked relays that stay behind a confined program.
const RELAY_PROCESSES: u64 = 2;

/// Confinement of every run: private namespaces, a chroot built from
/// read-only binds of `ro_binds`, and a uid of its own from `uids`.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub ro_binds: Vec<PathBuf>,
    pub uids: UidPool,
}

#[derive(Debug, Clone)]
pub struct NativeSandboxConfig {
    pub scratch_root: PathBuf,
    pub max_output_bytes: usize,
    pub max_processes: u64,
    pub isolation: Option<IsolationConfig>,
    /// Enforces memory and process limits when present. Without it memory
    /// falls back to the resident-set watchdog.
    pub cgroup: Option<CgroupParent>,
    pub drain_grace: Duration,
    pub memory_poll_interval: Duration,
}

impl NativeSandboxConfig {
    pub fn new(scratch_root: impl Into<PathBuf>, max_output_bytes: usize) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            max_output_bytes,
            max_processes: DEFAULT_MAX_PROCESSES,
            isolation: None,
            cgroup: None,
            drain_grace: Duration::from_millis(DRAIN_GRACE_MS),
            memory_poll_interval: Duration::from_millis(MEMORY_POLL_INTERVAL_MS),
        }
    }
}

/// Restricted subprocess: own process group, rlimits, and when configured a
/// cgroup plus namespace confinement, in a throwaway directory.
#[derive(Debug)]
pub struct NativeSandbox {
    toolchain: Toolchain,
    config: NativeSandboxConfig,
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Exited,
    TimedOut,
    MemoryExceeded,
    OutputOverflow,
    Cancelled,
}

impl NativeSandbox {
    pub fn new(toolchain: Toolchain, config: NativeSandboxConfig) -> Self {
        Self { toolchain, config }
    }

    fn jail(
        &self,
        request: &ExecutionRequest,
        scratch: &Scratch,
        cgroup: Option<&RunCgroup>,
        lease: Option<&UidLease>,
    ) -> Result<Jail, SandboxError> {
        let setup_err = |e: std::io::Error| SandboxError::Setup { msg: e.to_string() };

        let mut limits = ProcessLimits::new(&request.limits, self.config.max_output_bytes);
        if cgroup.is_none() {
            limits = limits
                .with_data_backstop(request.limits.memory_bytes + DATA_BACKSTOP_HEADROOM_BYTES);
        }
        if lease.is_some() {
            limits = limits.with_max_processes(self.config.max_processes);
        }

        let mut jail = Jail::new(limits);
        if let Some(cgroup) = cgroup {
            jail = jail.with_cgroup(cgroup.procs().map_err(setup_err)?);
        }
        if let (Some(isolation), Some(lease)) = (&self.config.isolation, lease) {
            scratch.hand_over(lease.uid())?;
            let rootfs = RootfsPlan::prepare(scratch.path(), &isolation.ro_binds).map_err(setup_err)?;
            jail = jail.with_confinement(rootfs, lease.uid());
        }
        Ok(jail)
    }

    fn command(
        &self,
        launch: &LaunchSpec,
        request: &ExecutionRequest,
        scratch: &Scratch,
        jail: Jail,
    ) -> Command {
        let mut command = Command::new(&launch.program);
        command
            .args(launch.render_args(&request.limits))
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .env("LANG", "C.UTF-8")
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if jail.is_confined() {
            // The jail changes into the work directory after chroot.
            command
                .env("HOME", format!("/{}", WORK_DIR))
                .env("TMPDIR", "/tmp");
        } else {
            command
                .current_dir(scratch.work_dir())
                .env("HOME", scratch.work_dir())
                .env("TMPDIR", scratch.work_dir());
        }

        // SAFETY: `enter` only issues async-signal-safe syscalls on data
        // prepared before the fork and does not allocate.
        unsafe {
            command.pre_exec(move || jail.enter());
        }

        command
    }

    fn spawn_capture(
        &self,
        child: &mut Child,
        overflow: &CancellationToken,
        stop: &CancellationToken,
    ) -> Result<(JoinHandle<Captured>, JoinHandle<Captured>), SandboxError> {
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Internal {
            msg: "stdout pipe missing".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SandboxError::Internal {
            msg: "stderr pipe missing".to_string(),
        })?;

        let limit = self.config.max_output_bytes;
        Ok((
            tokio::spawn(capture(stdout, limit, overflow.clone(), stop.clone())),
            tokio::spawn(capture(stderr, limit, overflow.clone(), stop.clone())),
        ))
    }

    /// Waits for both readers, giving them `drain_grace` to hit EOF.
    async fn drain(
        &self,
        stdout: JoinHandle<Captured>,
        stderr: JoinHandle<Captured>,
        stop: CancellationToken,
    ) -> Result<(Captured, Captured), SandboxError> {
        let grace = self.config.drain_grace;
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            stop.cancel();
        });

        let (stdout, stderr) = tokio::join!(stdout, stderr);
        stopper.abort();

        let join_err = |e: tokio::task::JoinError| SandboxError::Internal { msg: e.to_string() };
        Ok((stdout.map_err(join_err)?, stderr.map_err(join_err)?))
    }
}

#[async_trait::async_trait]
impl Sandbox for NativeSandbox {
    #[tracing::instrument(skip_all, fields(id = %request.id, language = %request.language))]
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let launch = self.toolchain.launch(request.language);
        let scratch = Scratch::create(
            &self.config.scratch_root,
            request.id,
            &launch.source_file,
            &request.source,
        )
        .await?;

        let cgroup = match &self.config.cgroup {
            Some(parent) => Some(
                parent
                    .create(
                        request.id,
                        request.limits.memory_bytes,
                        self.config.max_processes + RELAY_PROCESSES,
                    )
                    .await?,
            ),
            None => None,
        };
        let lease = match &self.config.isolation {
            Some(isolation) => Some(isolation.uids.lease().ok_or_else(|| SandboxError::Setup {
                msg: "no free sandbox uid".to_string(),
            })?),
            None => None,
        };
        let jail = self.jail(request, &scratch, cgroup.as_ref(), lease.as_ref())?;

        let started = Instant::now();
        let mut child = self
            .command(launch, request, &scratch, jail)
            .spawn()
            .map_err(|e| SandboxError::Spawn { msg: e.to_string() })?;
        let pid = child.id().ok_or_else(|| SandboxError::Internal {
            msg: "child exited before its pid was read".to_string(),
        })?;
        // process_group(0) makes the child the leader of a group with its own pid.
        let group = Pid::from_raw(pid as i32);
        tracing::debug!(pid, confined = lease.is_some(), "Sandbox spawned");

        let overflow = CancellationToken::new();
        let stop = CancellationToken::new();
        let (stdout_task, stderr_task) = match self.spawn_capture(&mut child, &overflow, &stop) {
            Ok(tasks) => tasks,
            Err(e) => {
                kill_group(group);
                return Err(e);
            }
        };

        if let (Some(mut pipe), Some(stdin)) = (child.stdin.take(), request.stdin.clone()) {
            tokio::spawn(async move {
                // A program that never reads its input closes the pipe early.
                if let Err(e) = pipe.write_all(stdin.as_bytes()).await {
                    tracing::debug!("Stdin not fully consumed: {}", e);
                }
            });
        }

        // Relays of a confined run belong to the service uid and are not counted.
        let tracked = Tracked {
            pgid: group.as_raw(),
            uid: lease.as_ref().map(UidLease::uid),
        };
        let enforced_by_cgroup = cgroup.is_some();
        let memory_limit = request.limits.memory_bytes;
        let poll_interval = self.config.memory_poll_interval;
        let memory_watch = async move {
            if enforced_by_cgroup {
                std::future::pending().await
            } else {
                watch_memory(tracked, memory_limit, poll_interval).await
            }
        };

        let deadline = started + Duration::from_millis(request.limits.time_ms);
        let (outcome, status) = tokio::select! {
            status = child.wait() => (Outcome::Exited, Some(status)),
            _ = tokio::time::sleep_until(deadline) => (Outcome::TimedOut, None),
            rss = memory_watch => {
                tracing::debug!(rss, limit = memory_limit, "Resident set over limit");
                (Outcome::MemoryExceeded, None)
            }
            _ = overflow.cancelled() => (Outcome::OutputOverflow, None),
            _ = cancel.cancelled() => (Outcome::Cancelled, None),
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        // Also reaps anything the program left running in its group.
        kill_group(group);
        if let Some(cgroup) = &cgroup {
            cgroup.kill().await;
        }
        let status = match status {
            Some(status) => status,
            None => child.wait().await,
        };

        let mut outcome = outcome;
        if let Some(cgroup) = cgroup {
            let oom_kills = cgroup.oom_kills().await;
            if oom_kills > 0 && matches!(outcome, Outcome::Exited | Outcome::OutputOverflow) {
                tracing::debug!(oom_kills, limit = memory_limit, "cgroup hit its memory limit");
                outcome = Outcome::MemoryExceeded;
            }
            cgroup.remove().await;
        }
        tracing::debug!(?outcome, execution_time_ms, "Sandbox finished");

        let (stdout, stderr) = self.drain(stdout_task, stderr_task, stop).await?;

        let exit_code = match outcome {
            Outcome::Cancelled => return Err(SandboxError::Cancelled),
            Outcome::TimedOut => None,
            Outcome::MemoryExceeded => Some(OOM_EXIT_CODE),
            Outcome::Exited | Outcome::OutputOverflow => {
                let status = status.map_err(|e| SandboxError::Internal { msg: e.to_string() })?;
                Some(status_code(status))
            }
        };

        let limit = self.config.max_output_bytes;
        let truncated = stdout.truncated || stderr.truncated;
        Ok(ExecutionResult {
            stdout: stdout.into_string(limit),
            stderr: stderr.into_string(limit),
            exit_code,
            timed_out: matches!(outcome, Outcome::TimedOut),
            truncated,
            memory_exceeded: matches!(outcome, Outcome::MemoryExceeded),
            execution_time_ms,
        })
    }
}

fn kill_group(group: Pid) {
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to kill process group {}: {}", group, e),
    }
}

/// Signal deaths are reported shell-style as 128 + signal number.
fn status_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

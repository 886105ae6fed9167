use std::{
    ffi::{CStr, CString},
    fs::File,
    io::{self, Write},
    os::unix::{ffi::OsStrExt, io::RawFd},
    path::Path,
};

use nix::{
    mount::{MsFlags, mount},
    sched::{CloneFlags, unshare},
    sys::{
        prctl::{set_no_new_privs, set_pdeathsig},
        resource::{Resource, getrlimit},
        signal::Signal,
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Gid, Pid, Uid, chdir, chroot, close, fork, sethostname, setgroups, setresgid, setresuid},
};

use crate::{
    constants::{SANDBOX_HOSTNAME, SANDBOX_TMP_BYTES, WORK_DIR},
    native::limits::ProcessLimits,
};

const DEVICES: [&str; 4] = ["null", "zero", "random", "urandom"];
const MAX_SCANNED_FDS: u64 = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountStep {
    ReadOnlyBind { source: CString, target: CString },
    DeviceBind { source: CString, target: CString },
    Proc { target: CString },
    Tmpfs { target: CString, options: CString },
}

impl MountStep {
    fn mount(&self) -> nix::Result<()> {
        match self {
            MountStep::ReadOnlyBind { source, target } => {
                mount_c(
                    Some(source.as_c_str()),
                    target,
                    None,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None,
                )?;
                mount_c(
                    None,
                    target,
                    None,
                    MsFlags::MS_BIND
                        | MsFlags::MS_REMOUNT
                        | MsFlags::MS_RDONLY
                        | MsFlags::MS_NOSUID
                        | MsFlags::MS_NODEV,
                    None,
                )
            }
            MountStep::DeviceBind { source, target } => {
                mount_c(Some(source.as_c_str()), target, None, MsFlags::MS_BIND, None)
            }
            MountStep::Proc { target } => mount_c(
                Some(c"proc"),
                target,
                Some(c"proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None,
            ),
            MountStep::Tmpfs { target, options } => mount_c(
                Some(c"tmpfs"),
                target,
                Some(c"tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(options.as_c_str()),
            ),
        }
    }
}

fn mount_c(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: MsFlags,
    data: Option<&CStr>,
) -> nix::Result<()> {
    mount(source, target, fstype, flags, data)
}

fn c_path(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

/// Root filesystem of one confined run, laid out on the host before spawning.
///
/// Everything the child needs is computed here so that nothing allocates
/// between `fork` and `exec`. The mounts themselves happen inside the run's
/// private mount namespace, so on the host the root stays a tree of empty
/// directories that is removed with the scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsPlan {
    root: CString,
    work: CString,
    mounts: Vec<MountStep>,
}

impl RootfsPlan {
    /// Prepares mountpoints under `root` for each of `ro_binds`, the device
    /// nodes, `/proc` and `/tmp`. Symlinked sources are recreated as the same
    /// symlink; missing sources are skipped.
    pub fn prepare(root: &Path, ro_binds: &[impl AsRef<Path>]) -> io::Result<Self> {
        let mut mounts = Vec::new();

        for source in ro_binds.iter().map(AsRef::as_ref) {
            let Ok(meta) = std::fs::symlink_metadata(source) else {
                tracing::debug!(source = %source.display(), "Bind source missing, skipped");
                continue;
            };
            let target = root.join(source.strip_prefix("/").unwrap_or(source));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            if meta.file_type().is_symlink() {
                std::os::unix::fs::symlink(std::fs::read_link(source)?, &target)?;
                continue;
            }
            if meta.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                File::create(&target)?;
            }
            mounts.push(MountStep::ReadOnlyBind {
                source: c_path(source)?,
                target: c_path(&target)?,
            });
        }

        let dev = root.join("dev");
        std::fs::create_dir_all(&dev)?;
        for device in DEVICES {
            let target = dev.join(device);
            File::create(&target)?;
            mounts.push(MountStep::DeviceBind {
                source: c_path(&Path::new("/dev").join(device))?,
                target: c_path(&target)?,
            });
        }

        let proc = root.join("proc");
        std::fs::create_dir_all(&proc)?;
        mounts.push(MountStep::Proc {
            target: c_path(&proc)?,
        });

        let tmp = root.join("tmp");
        std::fs::create_dir_all(&tmp)?;
        mounts.push(MountStep::Tmpfs {
            target: c_path(&tmp)?,
            options: CString::new(format!("size={},mode=1777", SANDBOX_TMP_BYTES))?,
        });

        Ok(Self {
            root: c_path(root)?,
            work: c_path(&Path::new("/").join(WORK_DIR))?,
            mounts,
        })
    }

    pub fn mounts(&self) -> &[MountStep] {
        &self.mounts
    }

    fn enter(&self) -> nix::Result<()> {
        mount_c(None, c"/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None)?;
        for step in &self.mounts {
            step.mount()?;
        }
        sethostname(SANDBOX_HOSTNAME)?;
        chroot(self.root.as_c_str())?;
        chdir(self.work.as_c_str())
    }
}

#[derive(Debug)]
struct Confinement {
    rootfs: RootfsPlan,
    uid: u32,
}

/// Everything the child does to itself between `fork` and `exec`.
#[derive(Debug)]
pub struct Jail {
    limits: ProcessLimits,
    cgroup_procs: Option<File>,
    confinement: Option<Confinement>,
}

impl Jail {
    pub fn new(limits: ProcessLimits) -> Self {
        Self {
            limits,
            cgroup_procs: None,
            confinement: None,
        }
    }

    pub fn with_cgroup(mut self, procs: File) -> Self {
        self.cgroup_procs = Some(procs);
        self
    }

    /// Runs the program in fresh mount, pid, network, IPC and UTS namespaces,
    /// chrooted into `rootfs`, as `uid`/`uid` with no supplementary groups.
    pub fn with_confinement(mut self, rootfs: RootfsPlan, uid: u32) -> Self {
        self.confinement = Some(Confinement { rootfs, uid });
        self
    }

    pub fn is_confined(&self) -> bool {
        self.confinement.is_some()
    }

    /// Runs in the forked child. Only async-signal-safe calls are made and
    /// nothing is allocated.
    ///
    /// When confined, the child forks twice: the first copy stays behind as a
    /// relay for the exit status, the second becomes pid 1 of the new pid
    /// namespace and the third goes on to `exec` the program. The kernel
    /// kills whatever is left in the namespace once pid 1 exits.
    pub fn enter(&self) -> io::Result<()> {
        if let Some(procs) = &self.cgroup_procs {
            let mut procs: &File = procs;
            procs.write_all(b"0")?;
        }

        let Some(confinement) = &self.confinement else {
            return Ok(self.limits.apply()?);
        };

        unshare(
            CloneFlags::CLONE_NEWNS
                | CloneFlags::CLONE_NEWPID
                | CloneFlags::CLONE_NEWNET
                | CloneFlags::CLONE_NEWIPC
                | CloneFlags::CLONE_NEWUTS,
        )?;
        relay()?;
        set_pdeathsig(Signal::SIGKILL)?;
        relay()?;
        set_pdeathsig(Signal::SIGKILL)?;

        confinement.rootfs.enter()?;
        self.limits.apply()?;

        let uid = Uid::from_raw(confinement.uid);
        let gid = Gid::from_raw(confinement.uid);
        setgroups(&[])?;
        setresgid(gid, gid, gid)?;
        setresuid(uid, uid, uid)?;
        set_no_new_privs()?;
        Ok(())
    }
}

/// Forks. The child returns and carries on. The parent never returns: it
/// closes every descriptor, so the spawning side sees EOF on its pipes once
/// the program is gone, reaps children until the forked one exits, and exits
/// with its status.
fn relay() -> io::Result<()> {
    // SAFETY: both branches only make async-signal-safe calls.
    match unsafe { fork() }? {
        ForkResult::Child => Ok(()),
        ForkResult::Parent { child } => {
            close_descriptors();
            let code = loop {
                match waitpid(Pid::from_raw(-1), None) {
                    Ok(WaitStatus::Exited(pid, code)) if pid == child => break code,
                    Ok(WaitStatus::Signaled(pid, signal, _)) if pid == child => {
                        break 128 + signal as i32;
                    }
                    Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
                    Err(_) => break 1,
                }
            };
            // SAFETY: terminates the relay without running atexit handlers.
            unsafe { nix::libc::_exit(code) }
        }
    }
}

fn close_descriptors() {
    let max = getrlimit(Resource::RLIMIT_NOFILE)
        .map(|(soft, _)| soft.min(MAX_SCANNED_FDS))
        .unwrap_or(1024);
    for fd in 0..max as RawFd {
        let _ = close(fd);
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn create_dir(label: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("coderunner_{}_{}", label, Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn create_host() -> std::path::PathBuf {
        let host = create_dir("host");
        std::fs::create_dir_all(host.join("usr/bin")).unwrap();
        std::fs::write(host.join("ld.so.cache"), "cache").unwrap();
        std::os::unix::fs::symlink("usr/bin", host.join("bin")).unwrap();
        host
    }

    fn bind_targets(plan: &RootfsPlan) -> Vec<CString> {
        plan.mounts()
            .iter()
            .filter_map(|step| match step {
                MountStep::ReadOnlyBind { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_prepare_lays_out_root() {
        let host = create_host();
        let root = create_dir("root");
        std::fs::create_dir_all(root.join(WORK_DIR)).unwrap();
        let binds = [host.join("usr"), host.join("ld.so.cache")];

        let plan = RootfsPlan::prepare(&root, &binds).unwrap();

        let nested = root.join(host.strip_prefix("/").unwrap());
        assert!(nested.join("usr").is_dir());
        assert!(nested.join("ld.so.cache").is_file());
        assert_eq!(
            bind_targets(&plan),
            vec![
                c_path(&nested.join("usr")).unwrap(),
                c_path(&nested.join("ld.so.cache")).unwrap(),
            ]
        );
        for device in DEVICES {
            assert!(root.join("dev").join(device).is_file());
        }
        assert!(root.join("proc").is_dir());
        assert!(root.join("tmp").is_dir());
        assert!(matches!(plan.mounts().last(), Some(MountStep::Tmpfs { .. })));
    }

    #[test]
    fn test_prepare_recreates_symlinks() {
        let host = create_host();
        let root = create_dir("root");

        let plan = RootfsPlan::prepare(&root, &[host.join("bin")]).unwrap();

        let link = root.join(host.join("bin").strip_prefix("/").unwrap());
        assert_eq!(std::fs::read_link(link).unwrap(), Path::new("usr/bin"));
        assert!(bind_targets(&plan).is_empty());
    }

    #[test]
    fn test_prepare_skips_missing_sources() {
        let root = create_dir("root");

        let plan = RootfsPlan::prepare(&root, &["/coderunner/definitely/missing"]).unwrap();

        assert!(bind_targets(&plan).is_empty());
        assert!(!root.join("coderunner").exists());
        // devices, proc and tmp
        assert_eq!(plan.mounts().len(), DEVICES.len() + 2);
    }

    #[test]
    fn test_jail_confinement() {
        let root = create_dir("root");
        let limits = ProcessLimits::new(
            &crate::core::domain::ExecutionLimits {
                time_ms: 1000,
                memory_bytes: 1024,
            },
            1024,
        );

        let plain = Jail::new(limits);
        let confined = Jail::new(limits)
            .with_confinement(RootfsPlan::prepare(&root, &[] as &[&str]).unwrap(), 60_000);

        assert!(!plain.is_confined());
        assert!(confined.is_confined());
    }
}

use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::{constants::WORK_DIR, core::traits::sandbox::SandboxError};

/// Per-execution directory, removed when dropped.
///
/// `<root>/<id>/` becomes the sandbox root when the run is confined; the
/// program and everything it writes live in `<root>/<id>/work/`.
#[derive(Debug)]
pub struct Scratch {
    path: PathBuf,
}

impl Scratch {
    pub async fn create(
        root: &Path,
        id: Uuid,
        source_file: &str,
        source: &str,
    ) -> Result<Self, SandboxError> {
        let setup_err = |e: std::io::Error| SandboxError::Setup { msg: e.to_string() };

        let path = root.join(id.to_string());
        fs::create_dir_all(path.join(WORK_DIR))
            .await
            .map_err(setup_err)?;

        let scratch = Self { path };
        fs::write(scratch.work_dir().join(source_file), source)
            .await
            .map_err(setup_err)?;

        Ok(scratch)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn work_dir(&self) -> PathBuf {
        self.path.join(WORK_DIR)
    }

    /// Gives the work directory to the uid the program will run as.
    pub fn hand_over(&self, uid: u32) -> Result<(), SandboxError> {
        let work_dir = self.work_dir();
        let entries = std::fs::read_dir(&work_dir)
            .map_err(|e| SandboxError::Setup { msg: e.to_string() })?;

        std::iter::once(Ok(work_dir.clone()))
            .chain(entries.map(|entry| entry.map(|entry| entry.path())))
            .try_for_each(|path| std::os::unix::fs::chown(path?, Some(uid), Some(uid)))
            .map_err(|e| SandboxError::Setup { msg: e.to_string() })
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_root() -> PathBuf {
        std::env::temp_dir().join(format!("coderunner_scratch_{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_scratch_lifecycle() {
        let root = create_root();
        let id = Uuid::new_v4();

        let scratch = Scratch::create(&root, id, "main.py", "print(1)")
            .await
            .unwrap();
        let path = scratch.path().to_path_buf();
        assert_eq!(path, root.join(id.to_string()));
        assert_eq!(scratch.work_dir(), path.join("work"));
        assert_eq!(
            fs::read_to_string(scratch.work_dir().join("main.py"))
                .await
                .unwrap(),
            "print(1)"
        );

        drop(scratch);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_hand_over_to_own_uid() {
        use std::os::unix::fs::MetadataExt;

        let scratch = Scratch::create(&create_root(), Uuid::new_v4(), "main.py", "print(1)")
            .await
            .unwrap();
        let uid = nix::unistd::getuid().as_raw();

        scratch.hand_over(uid).unwrap();

        let meta = std::fs::metadata(scratch.work_dir().join("main.py")).unwrap();
        assert_eq!(meta.uid(), uid);
    }

    #[tokio::test]
    async fn test_scratch_setup_error() {
        // /proc is read only
        let root = Path::new("/proc/coderunner_scratch");

        let result = Scratch::create(root, Uuid::new_v4(), "main.py", "print(1)").await;

        assert!(matches!(result, Err(SandboxError::Setup { .. })));
    }
}

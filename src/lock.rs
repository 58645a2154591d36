use crate::error::{MangaDockError, Result};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = "mangadock.lock";

/// Exclusive claim on a documents directory. Only the holder may write the
/// registries or touch chapter files; the OS drops the claim when the
/// process exits, even on a crash.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(documents_path: &Path) -> Result<Self> {
        fs::create_dir_all(documents_path)?;
        let path = documents_path.join(LOCK_FILE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            return Err(MangaDockError::AlreadyRunning { path, source: e });
        }

        debug!("Acquired instance lock {:?}", path);
        Ok(Self { file, path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to release instance lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_refused() {
        let dir = tempfile::tempdir().unwrap();

        let first = InstanceLock::acquire(dir.path()).unwrap();
        let second = InstanceLock::acquire(dir.path());
        assert!(matches!(second, Err(MangaDockError::AlreadyRunning { .. })));

        drop(first);
        assert!(InstanceLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn creates_missing_documents_directory() {
        let dir = tempfile::tempdir().unwrap();
        let documents = dir.path().join("nested").join("docs");

        let _lock = InstanceLock::acquire(&documents).unwrap();
        assert!(documents.join(LOCK_FILE).exists());
    }
}

//! Advisory locking of the shared library root, so concurrent processes
//! don't lift and trim over each other.

use std::fs::{File, OpenOptions};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use fs2::FileExt;
use tracing::*;

const POLL: Duration = Duration::from_millis(100);

/// An acquired lock; released on drop.
pub struct FileLock {
    file: File,
    shared: bool,
}

impl FileLock {
    /// Acquire the lock at `path`, polling until `timeout_ms` runs out.
    /// Shared mode takes a read lock so several restorers can overlap;
    /// writers (lift, remove, import) take it exclusively.
    pub fn acquire(path: &Utf8Path, timeout_ms: u64, shared: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create {parent}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Couldn't open lock file {path}"))?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let attempt = if shared {
                FileExt::try_lock_shared(&file)
            } else {
                FileExt::try_lock_exclusive(&file)
            };
            match attempt {
                Ok(()) => return Ok(Self { file, shared }),
                Err(e) if Instant::now() >= deadline => {
                    bail!("Timed out waiting for lock on {path}: {e}")
                }
                Err(_) => {
                    trace!("Lock on {path} is busy, polling");
                    std::thread::sleep(POLL);
                }
            }
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shared_locks_coexist_exclusive_does_not() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = crate::file_util::utf8(dir.path())?.join("lock");

        let a = FileLock::acquire(&path, 100, true)?;
        let _b = FileLock::acquire(&path, 100, true)?;
        assert!(FileLock::acquire(&path, 200, false).is_err());

        drop(a);
        drop(_b);
        let _c = FileLock::acquire(&path, 100, false)?;
        assert!(FileLock::acquire(&path, 200, true).is_err());
        Ok(())
    }
}

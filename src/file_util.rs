//! Part files, atomic renames, and the other filesystem plumbing that keeps
//! half-written content out of the library and out of restored trees.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tracing::*;

use crate::counters;

/// Transient siblings of a final path are named `<name>.part#<digits>`.
/// Everything that scans directories must ignore them: another worker may be
/// mid-rename.
static PART_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.part#\d+$").unwrap());

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn is_part_file(name: &str) -> bool {
    PART_PATTERN.is_match(name)
}

/// A unique temporary sibling for `target`, in the same directory so the
/// final rename never crosses filesystems.
pub fn part_name(target: &Utf8Path) -> Utf8PathBuf {
    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    let unique = std::process::id() as u64 * 1_000_000 + seq;
    Utf8PathBuf::from(format!("{target}.part#{unique}"))
}

const RENAME_ATTEMPTS: u32 = 5;
const RENAME_BACKOFF: Duration = Duration::from_millis(100);

/// Renames `from` to `to`, recreating a vanished parent directory and
/// retrying transient failures with a bounded back-off. As a last resort,
/// hops through a fresh intermediate name next to the target.
pub fn commit(from: &Utf8Path, to: &Utf8Path) -> Result<()> {
    let mut last_err = match fs::rename(from, to) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    for attempt in 0..RENAME_ATTEMPTS {
        if last_err.kind() == std::io::ErrorKind::NotFound {
            // A racing cleanup removed the parent. Put it back and go again.
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Couldn't recreate {parent}"))?;
            }
        } else {
            counters::bump(counters::Op::RenameRetry);
            std::thread::sleep(RENAME_BACKOFF);
        }

        match fs::rename(from, to) {
            Ok(()) => {
                trace!("Renamed {from} to {to} after {} retries", attempt + 1);
                return Ok(());
            }
            Err(e) => last_err = e,
        }
    }

    // Exhausted. Hop through an intermediate so a directly-contended target
    // name doesn't starve us forever.
    counters::bump(counters::Op::RenameHop);
    let hop = part_name(to);
    fs::rename(from, &hop)
        .with_context(|| format!("Couldn't rename {from} to {to} (last error: {last_err})"))?;
    if let Err(e) = fs::rename(&hop, to) {
        let _ = fs::remove_file(&hop);
        return Err(anyhow::Error::new(e).context(format!("Couldn't rename {hop} to {to}")));
    }
    Ok(())
}

/// Removes a file, retrying transient failures (antivirus, racing writers)
/// with the same bounded back-off as [`commit`].
pub fn try_remove(path: &Utf8Path) -> Result<()> {
    let mut last_err = match fs::remove_file(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => e,
    };
    for _ in 0..RENAME_ATTEMPTS {
        std::thread::sleep(RENAME_BACKOFF);
        match fs::remove_file(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => last_err = e,
        }
    }
    Err(anyhow::Error::new(last_err).context(format!("Couldn't remove {path}")))
}

/// `mkdir -p` with an explicit mode on the leaf.
/// Intermediate directories get the process umask like anyone else's.
pub fn mkdir_p(path: &Utf8Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Couldn't create {path}"))?;
    set_mode(path, mode)
}

#[cfg(unix)]
pub fn set_mode(path: &Utf8Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Couldn't chmod {path}"))
}

#[cfg(windows)]
pub fn set_mode(path: &Utf8Path, mode: u32) -> Result<()> {
    // Only the owner-write bit maps to anything here.
    let mut perms = fs::metadata(path.as_std_path())
        .with_context(|| format!("Couldn't stat {path}"))?
        .permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).with_context(|| format!("Couldn't chmod {path}"))
}

/// Pins a path's access and modification times to the given Unix second.
#[cfg(unix)]
pub fn chtimes(path: &Utf8Path, unix_secs: i64) -> Result<()> {
    use rustix::fs::{AtFlags, CWD, Timespec, Timestamps, utimensat};

    let stamp = Timespec {
        tv_sec: unix_secs,
        tv_nsec: 0,
    };
    let times = Timestamps {
        last_access: stamp,
        last_modification: stamp,
    };
    utimensat(CWD, path.as_std_path(), &times, AtFlags::empty())
        .with_context(|| format!("Couldn't set times on {path}"))
}

#[cfg(windows)]
pub fn chtimes(path: &Utf8Path, unix_secs: i64) -> Result<()> {
    use std::time::{Duration, UNIX_EPOCH};

    let when = UNIX_EPOCH + Duration::from_secs(unix_secs as u64);
    let fh = fs::File::options()
        .write(true)
        .open(path.as_std_path())
        .with_context(|| format!("Couldn't open {path} to set times"))?;
    fh.set_times(
        fs::FileTimes::new().set_accessed(when).set_modified(when),
    )
    .with_context(|| format!("Couldn't set times on {path}"))
}

/// The seconds part of a path's mtime, or `None` if it can't be stat'd.
pub fn mtime_secs(meta: &fs::Metadata) -> Option<i64> {
    let modified = meta.modified().ok()?;
    match modified.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => Some(d.as_secs() as i64),
        Err(e) => Some(-(e.duration().as_secs() as i64)),
    }
}

/// Turn a [`Path`] we produced ourselves back into UTF-8.
pub fn utf8(path: &Path) -> Result<&Utf8Path> {
    Utf8Path::from_path(path).with_context(|| format!("Non-UTF-8 path: {}", path.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn part_pattern() {
        assert!(is_part_file("error.py.part#6599"));
        assert!(is_part_file("x.part#0"));
        assert!(!is_part_file("file.part"));
        assert!(!is_part_file("file.part#abc"));
        assert!(!is_part_file("file#123.txt"));
        assert!(!is_part_file("file.part.txt"));
    }

    #[test]
    fn part_names_are_unique() {
        let target = Utf8Path::new("/tmp/some/file.py");
        let a = part_name(target);
        let b = part_name(target);
        assert_ne!(a, b);
        assert!(is_part_file(a.as_str()));
        assert!(a.as_str().starts_with("/tmp/some/file.py.part#"));
    }

    #[test]
    fn commit_recreates_missing_parent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = utf8(dir.path())?;
        let src = root.join("src");
        fs::write(&src, b"hello")?;

        let dst = root.join("sub/dir/dst");
        commit(&src, &dst)?;
        assert_eq!(fs::read(&dst)?, b"hello");
        assert!(!src.exists());
        Ok(())
    }

    #[test]
    fn try_remove_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let p = utf8(dir.path())?.join("gone");
        try_remove(&p)?;
        fs::write(&p, b"x")?;
        try_remove(&p)?;
        assert!(!p.exists());
        Ok(())
    }
}

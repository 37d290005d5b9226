use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use crate::error::{Error, Result};

/// Name of the lock sentinel file inside each locked directory.
pub const LOCK_FILE_NAME: &str = "FLOCK";

/// Opens the sentinel so that the returned handle holds an exclusive
/// advisory lock. A lock held elsewhere fails the open instead of
/// blocking it.
#[cfg(unix)]
fn open_exclusive(path: &Path) -> io::Result<File> {
    use std::os::unix::io::AsRawFd;

    let file = File::options().create(true).read(true).write(true).open(path)?;
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(file),
        _ => Err(io::Error::last_os_error()),
    }
}

/// On Windows a zero share mode makes the handle itself the exclusive
/// lock; no separate lock call exists or is needed.
#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;

    File::options()
        .create(true)
        .read(true)
        .write(true)
        .share_mode(0)
        .open(path)
}

#[cfg(not(any(unix, windows)))]
fn open_exclusive(_path: &Path) -> io::Result<File> {
    // Running unlocked would break single-process exclusivity, so refuse.
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "advisory file locks are not supported on this platform",
    ))
}

/// An exclusive advisory lock on a sentinel file.
///
/// The open file handle is what holds the lock, so dropping the guard
/// releases it. The sentinel file itself is never unlinked; removing it
/// would let a second process create and lock a fresh one while the first
/// still holds the old inode.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the sentinel if needed and takes the lock. The holder's pid
    /// is stamped into the file, purely as a diagnostic for `cat FLOCK`.
    pub fn acquire<P: Into<PathBuf>>(path: P) -> io::Result<Self> {
        let path = path.into();
        let mut file = open_exclusive(&path)?;

        file.set_len(0)?;
        file.write_all(format!("{}\n", process::id()).as_bytes())?;

        Ok(Self { file, path })
    }

    /// Releases the lock, surfacing unlock failures that a plain drop
    /// would swallow.
    pub fn release(self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        // Elsewhere the lock is the handle; closing it on drop releases.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Exclusive locks over the distinct set among the column family, index,
/// and value log directories.
pub struct DirLockSet {
    locks: Vec<FileLock>,
}

impl DirLockSet {
    /// Locks each distinct directory in deterministic order. On failure the
    /// partially acquired locks are released and
    /// [`Error::AnotherProcessHoldsDir`] names the offending directory.
    pub fn acquire(cf_dir: &Path, indexer_dir: &Path, vlog_dir: &Path) -> Result<Self> {
        let mut dirs = vec![cf_dir];
        if indexer_dir != cf_dir {
            dirs.push(indexer_dir);
        }
        if vlog_dir != cf_dir && vlog_dir != indexer_dir {
            dirs.push(vlog_dir);
        }

        let mut locks = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match FileLock::acquire(dir.join(LOCK_FILE_NAME)) {
                Ok(lock) => locks.push(lock),
                // Dropping `locks` here releases the partial set.
                Err(_) => return Err(Error::AnotherProcessHoldsDir(dir.to_path_buf())),
            }
        }
        Ok(Self { locks })
    }

    /// Releases the locks in reverse acquisition order. Every lock is
    /// attempted; the last failure is returned.
    pub fn release(&mut self) -> Result<()> {
        let mut last_err = None;
        while let Some(lock) = self.locks.pop() {
            if let Err(e) = lock.release() {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

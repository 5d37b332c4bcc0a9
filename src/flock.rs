use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Name of the lock file inside a store directory.
pub const LOCK_FILE_NAME: &str = "datafiles.lock";

/// Exclusive advisory lock on a store directory.
///
/// Only one store may append to a directory at a time: two writers would
/// hand out overlapping file indices. The lock is released when the value
/// is dropped or the process exits.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Locks the store directory `dir`, failing immediately if another
    /// process or store instance holds it.
    pub fn lock_dir(dir: &Path) -> io::Result<Self> {
        Self::lock(dir.join(LOCK_FILE_NAME))
    }

    /// Creates `path` if needed and takes an exclusive lock on it.
    /// The file holds the owner's process ID.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        // Only truncate once we own the lock, so a losing contender never
        // clobbers the owner's PID.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = %path.display(), "Acquired directory lock");
        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock = FileLock::lock_dir(dir.path()).expect("Failed to acquire lock");

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE_NAME));
        let content = fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_double_lock() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let _first = FileLock::lock_dir(dir.path()).expect("Failed to acquire first lock");

        assert!(FileLock::lock_dir(dir.path()).is_err());
        // The losing attempt leaves the owner's PID in place.
        let content = fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let _lock = FileLock::lock_dir(dir.path()).expect("Failed to acquire lock");
        }
        let _again = FileLock::lock_dir(dir.path()).expect("Lock should be free after drop");
    }
}

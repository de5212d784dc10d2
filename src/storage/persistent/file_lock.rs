//! Single-writer guard for an alarm store directory.
//!
//! Two processes appending to the same alarm log would interleave records,
//! so the store takes a non-blocking exclusive lock on `<dir>/alarms.lock`
//! and holds it until dropped. The holder writes its pid into the file so
//! a refused opener can say who owns the store.

use std::fs::{self, File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::Path;

/// Lock file name inside the store directory.
pub const LOCK_FILE: &str = "alarms.lock";

/// Exclusive ownership of an alarm store directory.
#[derive(Debug)]
pub struct AlarmDirLock {
    _file: File,
    pid: u32,
}

impl AlarmDirLock {
    /// Claims `dir` for this process without blocking.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` naming the holding pid if another opener owns the store
    /// - Any I/O error creating or writing the lock file
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let lock_path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if let Err(e) = Self::try_lock(&file) {
            if e.kind() != ErrorKind::WouldBlock {
                return Err(e);
            }
            let holder = holder_pid(&lock_path)
                .map_or_else(|| "unknown pid".to_string(), |pid| format!("pid {pid}"));
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("alarm store {} is held by {holder}", dir.display()),
            ));
        }

        let pid = std::process::id();
        file.set_len(0)?;
        writeln!(file, "{pid}")?;
        file.flush()?;

        Ok(Self { _file: file, pid })
    }

    /// Pid recorded in the lock file.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: the descriptor is owned by `file` and valid for this call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = IoError::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(ErrorKind::WouldBlock, err));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is owned by `file`; OVERLAPPED is plain data and may be zeroed.
        // The locked byte sits past the pid text so other openers can still read it.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            overlapped.Anonymous.Anonymous.OffsetHigh = 1;
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if result == 0 {
            return Err(IoError::new(ErrorKind::WouldBlock, IoError::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "alarm store locking is not supported on this platform",
        ))
    }
}

fn holder_pid(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

//! Durable flush of WAL files and directories
//!
//! `durable_sync` maps to the strongest primitive each platform offers:
//! `fdatasync` on Linux, `F_FULLFSYNC` on Apple platforms (plain `fsync`
//! only reaches the drive cache there), `FlushFileBuffers` on Windows and
//! `sync_data` elsewhere.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until the file's data has reached persistent media.
///
/// Must not be called while holding the table lock; it can stall for
/// milliseconds under load.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File`.
        check(unsafe { libc::fdatasync(file.as_raw_fd()) } == 0)
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live `File`.
        check(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } == 0)
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live `File`.
        check(unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) } != 0)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows"))]
fn check(ok: bool) -> io::Result<()> {
    if ok { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Persist directory entries (new WAL files after rotation).
///
/// Directories cannot be opened for sync on Windows; rename/create is
/// already durable there once the file itself is flushed.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        durable_sync(&handle)
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

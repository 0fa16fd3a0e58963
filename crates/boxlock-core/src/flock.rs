//! Thin `flock(2)` wrappers.
//!
//! The blocking variant deliberately surfaces `EINTR` instead of retrying:
//! the acquirer's latch is meant to be interrupted by the interval timer,
//! and the caller decides what an interruption means by consulting the
//! alarm flag.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// Takes an exclusive advisory lock, blocking until granted or interrupted.
///
/// The lock lives on the open file description and is released when `file`
/// is closed.
#[allow(unsafe_code)]
pub fn lock_exclusive(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor from an open `std::fs::File` that
    // outlives this call. `LOCK_EX` is a valid flock operation and cannot
    // cause undefined behavior.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Attempts an exclusive advisory lock without blocking. Returns `Ok(false)`
/// when another process holds it.
#[allow(unsafe_code)]
pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    let fd = file.as_raw_fd();
    // SAFETY: as above; `LOCK_EX | LOCK_NB` is a valid flock operation.
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let error = io::Error::last_os_error();
    if error.kind() == io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(error)
}

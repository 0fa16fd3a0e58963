//! PID-reuse-safe process identity.
//!
//! A bare PID is not a stable name for a process: the kernel recycles them.
//! The broker therefore stamps every queue entry with the process start time
//! from `/proc/<pid>/stat` (field 22, clock ticks since boot). Two processes
//! that ever shared a PID cannot share a start time, so the pair
//! `<pid>:<start_ticks>` survives recycling.
//!
//! Liveness is probed with the null signal rather than by inspecting
//! `/proc`: `EPERM` from `kill(pid, 0)` means the process exists but belongs
//! to another user, which still counts as alive.

use std::fmt;
use std::fs::File;
use std::io::Read;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, getppid, Pid};
use thiserror::Error;

/// Upper bound for one `/proc/<pid>/stat` read. The record is a single line;
/// 64 KiB tolerates pathological comm values without unbounded allocation.
const MAX_STAT_SIZE: u64 = 64 * 1024;

/// Failure to establish a process identity from the kernel's stat record.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The stat file could not be opened or read; the process is gone or
    /// `/proc` is unusable.
    #[error("could not read /proc/{pid}/stat: {source}")]
    StatUnreadable {
        /// Process the read was for.
        pid: i32,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The stat record did not contain a parsable start-time field.
    #[error("could not parse /proc/{pid}/stat")]
    StatUnparsable {
        /// Process the parse was for.
        pid: i32,
    },
}

/// A recycling-safe process identity: a PID plus its start time in clock
/// ticks since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStamp {
    /// Process id.
    pub pid: i32,
    /// Start time of the process, field 22 of its stat record.
    pub start_ticks: u64,
}

impl ProcessStamp {
    /// Stamps an arbitrary process.
    pub fn of(pid: i32) -> Result<Self, IdentityError> {
        Ok(Self {
            pid,
            start_ticks: start_ticks_of(pid)?,
        })
    }

    /// Stamps the calling process.
    pub fn current() -> Result<Self, IdentityError> {
        Self::of(getpid().as_raw())
    }

    /// Stamps the parent of the calling process, the intended owner of any
    /// lock this broker acquires.
    pub fn parent() -> Result<Self, IdentityError> {
        Self::of(getppid().as_raw())
    }

    /// Whether the stamped process is still running under this identity.
    ///
    /// Any failure along the way means "not live": a holder that died
    /// between the signal probe and the stat read is as dead as one that
    /// never answered the probe.
    #[must_use]
    pub fn is_live(&self) -> bool {
        match kill(Pid::from_raw(self.pid), None) {
            Ok(()) => {}
            // The process exists but is not ours to signal.
            Err(Errno::EPERM) => {}
            Err(_) => return false,
        }
        start_ticks_of(self.pid).is_ok_and(|ticks| ticks == self.start_ticks)
    }

    /// Parses the on-disk `<pid>:<start_ticks>` form. Returns `None` for
    /// anything else; queue scans skip such lines.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (pid, ticks) = line.trim().split_once(':')?;
        Some(Self {
            pid: pid.parse().ok()?,
            start_ticks: ticks.parse().ok()?,
        })
    }
}

impl fmt::Display for ProcessStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.start_ticks)
    }
}

/// Reads a process's start time from `/proc/<pid>/stat`.
pub fn start_ticks_of(pid: i32) -> Result<u64, IdentityError> {
    let path = format!("/proc/{pid}/stat");
    let mut content = String::new();
    File::open(&path)
        .and_then(|file| file.take(MAX_STAT_SIZE).read_to_string(&mut content))
        .map_err(|source| IdentityError::StatUnreadable { pid, source })?;
    parse_start_ticks(&content).ok_or(IdentityError::StatUnparsable { pid })
}

/// Extracts field 22 (starttime) from a stat record.
///
/// comm (field 2) is an unescaped parenthesised string that may itself
/// contain spaces and `)`, so fields are counted from the last `)` rather
/// than from the start of the line.
fn parse_start_ticks(content: &str) -> Option<u64> {
    let comm_end = content.rfind(')')?;
    let fields: Vec<&str> = content.get(comm_end + 2..)?.split_whitespace().collect();
    // After comm the next field is 3 (state), so field 22 sits at index 19.
    fields.get(19)?.parse().ok()
}

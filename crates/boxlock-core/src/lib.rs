//! Cross-process lock broker primitives for isolate sandbox boxes.
//!
//! A host provisioned with [isolate](https://github.com/ioi/isolate) has a
//! fixed pool of numbered sandbox boxes shared by every job runner on the
//! machine. This crate implements the arbitration protocol between them: a
//! filesystem-mediated mutual-exclusion scheme that stays correct under
//! concurrent contenders, crashes, PID recycling, signal interrupts and
//! timeouts.
//!
//! The moving parts, bottom up:
//!
//! - [`identity`] -- `(pid, start_ticks)` stamps that survive PID reuse, and
//!   the null-signal liveness probe;
//! - [`lockdir`] -- the `lock/` + `free/` state tree;
//! - [`pidlock`] -- the per-box acquire/release state machine built on
//!   append-queue election and atomic rename;
//! - [`acquire`] -- the multi-box strategy: shuffled free sweep, random full
//!   scan, then latch + inotify wait;
//! - [`alarm`] / [`rescue`] -- the interval-timer timeout and the
//!   fatal-signal emergency release;
//! - [`sandbox`] -- the probe of, and init/cleanup calls into, the external
//!   tool.
//!
//! Linux-only by design: the protocol leans on `/proc`, `flock`, inotify and
//! `O_APPEND` semantics.

pub mod acquire;
pub mod alarm;
pub mod config;
pub mod flock;
pub mod identity;
pub mod lockdir;
pub mod pidlock;
pub mod rescue;
pub mod sandbox;

pub use config::BrokerConfig;
pub use identity::{IdentityError, ProcessStamp};
pub use lockdir::{ensure_lock_dirs, LockDirError};
pub use pidlock::{Broker, PidlockError, ReleaseError};
pub use sandbox::{InvalidOption, ProbeError, SandboxInfo, SandboxTool};
